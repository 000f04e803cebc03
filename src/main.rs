//! Chain-watch core HTTP entrypoint.
//!
//! This binary launches an axum-based HTTP server fronting a set of per-chain
//! `ChainWatcher`s, a single-writer `SessionRegistry`, an `ExpiryScanner`, and a typed
//! `EventBus` — the payment-session core described in `SPEC_FULL.md`.
//!
//! Endpoints:
//! - `POST/GET /api/v1/payment-sessions`, `GET /api/v1/payment-sessions/{id}`
//! - `POST /api/v1/payment-sessions/{id}/recreate`
//! - `GET /api/v1/transactions/{id}`, `GET /api/v1/transactions`
//! - `GET /api/v1/system/network-status`
//! - `GET /health` (ambient liveness probe, unauthenticated)
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT`, `ACTIVE_NETWORKS`, `API_KEY`, per-chain `<CHAIN>_*` vars
//! - `OTEL_*` variables enable tracing export

mod address_source;
mod amount;
mod chain_client;
mod chain_watcher;
mod config;
mod domain;
mod event_bus;
mod expiry_scanner;
mod handlers;
mod network_status;
mod registry;
mod sig_down;
mod store;
mod telemetry;
mod timestamp;

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors;

use crate::address_source::{AddressSource, FixedAddressSource};
use crate::chain_client::EvmChainClient;
use crate::chain_watcher::ChainWatcher;
use crate::config::CoreConfig;
use crate::domain::{Chain, ChainId};
use crate::event_bus::EventBus;
use crate::expiry_scanner::ExpiryScanner;
use crate::network_status::NetworkStatusTracker;
use crate::registry::{spawn_registry, RegistryHandle};
use crate::sig_down::SigDown;
use crate::store::{InMemoryStore, Store};
use crate::telemetry::Telemetry;

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub api_key: Option<String>,
    pub chains: HashMap<ChainId, Arc<Chain>>,
    pub network_status: NetworkStatusTracker,
}

/// Starts one `ChainClient`/`ChainWatcher` pair per configured chain and spawns its
/// polling loop as an independent task (§5: watchers share no mutable state).
fn spawn_watchers(
    chains: &HashMap<ChainId, Arc<Chain>>,
    registry: RegistryHandle,
    event_bus: EventBus,
    network_status: NetworkStatusTracker,
    cancellation_token: CancellationToken,
) {
    for chain in chains.values() {
        let client = match EvmChainClient::new(&chain.rpc_url) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::error!(network = %chain.id, error = %err, "failed to build chain client");
                continue;
            }
        };
        let watcher = ChainWatcher::new(
            chain.clone(),
            client,
            registry.clone(),
            event_bus.clone(),
            network_status.clone(),
            cancellation_token.clone(),
        );
        tokio::spawn(watcher.run());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let telemetry = Telemetry::new();

    let config = CoreConfig::load()?;
    let chains: HashMap<ChainId, Arc<Chain>> = config
        .chains
        .iter()
        .map(|(id, chain)| (id.clone(), Arc::new(chain.clone())))
        .collect();

    let event_bus = EventBus::new(config.event_bus_queue_capacity);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let address_source: Arc<dyn AddressSource> = Arc::new(FixedAddressSource);
    let registry = spawn_registry(chains.clone(), address_source, store, event_bus.clone());

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();

    let network_status = NetworkStatusTracker::new();
    spawn_watchers(
        &chains,
        registry.clone(),
        event_bus.clone(),
        network_status.clone(),
        cancellation_token.clone(),
    );

    let scanner = ExpiryScanner::new(
        registry.clone(),
        config.expiry_scan_interval,
        cancellation_token.clone(),
    );
    tokio::spawn(scanner.run());

    let state = AppState {
        registry,
        api_key: config.api_key.clone(),
        chains,
        network_status,
    };

    let http_endpoints = Router::new().merge(handlers::routes(state)).layer(telemetry.http_tracing()).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let shutdown_token = cancellation_token.clone();
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // Graceful shutdown (§5): watchers and the scanner have already stopped observing
    // the cancellation token; give in-flight event bus deliveries a window to drain.
    tokio::time::sleep(config.shutdown_flush_deadline).await;

    Ok(())
}
