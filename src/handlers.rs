//! HTTP API facade (§6): a thin axum layer translating requests into `RegistryHandle`
//! operations and the `{error:{code,message,details?}}` envelope.
//!
//! The facade is deliberately not part of the core (§1): it owns auth, routing, and
//! JSON shape, nothing more. Every handler is a few lines translating one registry call.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{ChainId, SessionStatus, TransferStatus};
use crate::network_status::ChainStatus;
use crate::registry::{CreateSessionInput, Page, RegistryError, SessionFilter, TransferFilter};
use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                code,
                message: message.into(),
                details: None,
            },
        }),
    )
        .into_response()
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        match self {
            RegistryError::InvalidInput(message) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            RegistryError::NotFound => {
                error_response(StatusCode::NOT_FOUND, "not_found", "resource not found")
            }
            RegistryError::InvalidState(message) => {
                error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            RegistryError::AddressUnavailable => error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "no address is currently available on this network",
            ),
        }
    }
}

/// `Authorization: Bearer <API_KEY>` gate (§6). A `None` configured key disables auth,
/// matching "except locally exposed read-only endpoints if configured".
async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };
    let supplied = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match supplied {
        Some(token) if token == expected => next.run(request).await,
        _ => error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid API key"),
    }
}

pub fn routes(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/v1/payment-sessions",
            post(create_session).get(list_sessions),
        )
        .route("/api/v1/payment-sessions/{id}", get(get_session))
        .route(
            "/api/v1/payment-sessions/{id}/recreate",
            post(recreate_session),
        )
        .route("/api/v1/transactions/{id}", get(get_transfer))
        .route("/api/v1/transactions", get(list_transfers))
        .route("/api/v1/system/network-status", get(network_status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

/// `GET /health`: ambient liveness probe, unauthenticated (§6 addendum).
async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    amount: String,
    currency: String,
    network: String,
    #[serde(default, rename = "expirationMinutes")]
    expiration_minutes: Option<u32>,
    #[serde(default, rename = "clientRefId")]
    client_ref_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    let input = CreateSessionInput {
        amount: body.amount,
        currency: body.currency,
        network: body.network,
        expiration_minutes: body.expiration_minutes,
        client_ref_id: body.client_ref_id,
        metadata: body.metadata,
    };
    match state.registry.create_session(input).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.registry.get_session(id).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListSessionsQuery {
    status: Option<String>,
    network: Option<String>,
    #[serde(rename = "clientRefId")]
    client_ref_id: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_sessions(State(state): State<AppState>, Query(q): Query<ListSessionsQuery>) -> Response {
    let status = match q.status.as_deref() {
        None => None,
        Some("PENDING") => Some(SessionStatus::Pending),
        Some("COMPLETED") => Some(SessionStatus::Completed),
        Some("EXPIRED") => Some(SessionStatus::Expired),
        Some("FAILED") => Some(SessionStatus::Failed),
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unknown status '{other}'"),
            )
        }
    };
    let network = match q.network.as_deref().map(ChainId::from_str) {
        None => None,
        Some(Ok(n)) => Some(n),
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "invalid network")
        }
    };
    let filter = SessionFilter {
        status,
        network,
        client_ref_id: q.client_ref_id,
        from_date: None,
        to_date: None,
    };
    let page = Page {
        page: q.page.unwrap_or(1),
        limit: q.limit.unwrap_or(10),
    };
    let (sessions, meta) = state.registry.list_sessions(filter, page).await;
    (StatusCode::OK, Json(json!({"data": sessions, "pagination": meta}))).into_response()
}

async fn recreate_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.registry.recreate_session(id).await {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_transfer(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.registry.get_transfer(id).await {
        Ok(transfer) => (StatusCode::OK, Json(transfer)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListTransfersQuery {
    network: Option<String>,
    status: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<Uuid>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_transfers(State(state): State<AppState>, Query(q): Query<ListTransfersQuery>) -> Response {
    let status = match q.status.as_deref() {
        None => None,
        Some("PENDING") => Some(TransferStatus::Pending),
        Some("CONFIRMED") => Some(TransferStatus::Confirmed),
        Some("FAILED") => Some(TransferStatus::Failed),
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unknown status '{other}'"),
            )
        }
    };
    let network = match q.network.as_deref().map(ChainId::from_str) {
        None => None,
        Some(Ok(n)) => Some(n),
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "invalid network")
        }
    };
    let filter = TransferFilter {
        network,
        status,
        session_id: q.session_id,
    };
    let page = Page {
        page: q.page.unwrap_or(1),
        limit: q.limit.unwrap_or(10),
    };
    let (transfers, meta) = state.registry.list_transfers(filter, page).await;
    (StatusCode::OK, Json(json!({"data": transfers, "pagination": meta}))).into_response()
}

#[derive(Debug, Serialize)]
struct NetworkStatusEntry {
    id: ChainId,
    status: &'static str,
    #[serde(rename = "lastBlock")]
    last_block: u64,
    #[serde(rename = "requiredConfirmations")]
    required_confirmations: u64,
}

async fn network_status(State(state): State<AppState>) -> Response {
    let snapshot = state.network_status.snapshot();
    let entries: Vec<NetworkStatusEntry> = state
        .chains
        .values()
        .map(|chain| {
            let observed = snapshot.iter().find(|v| v.network == chain.id);
            let status = match observed {
                None => "INACTIVE",
                Some(v) if v.status == ChainStatus::Active => "ACTIVE",
                Some(_) => "HALTED",
            };
            NetworkStatusEntry {
                id: chain.id.clone(),
                status,
                last_block: observed.map(|v| v.last_checked_block).unwrap_or(0),
                required_confirmations: chain.required_confirmations,
            }
        })
        .collect();
    (StatusCode::OK, Json(json!({"data": entries}))).into_response()
}
