//! `SessionRegistry` & state machine (§4.3): the single-writer authority for all
//! session and transfer state.
//!
//! Single-writer is structural, not disciplinary: one task owns every index and drains
//! an mpsc operation queue; callers get a cheap, cloneable [`RegistryHandle`] that sends
//! a request and awaits a oneshot reply. This keeps "never blocks the registry" (§5) true
//! by construction rather than by convention.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::address_source::AddressSource;
use crate::amount::{decimal_to_raw, raw_to_decimal_string, tolerance_floor, MoneyAmount};
use crate::domain::{
    address_key, Chain, ChainId, ObservedTransfer, Session, SessionStatus, Transfer,
    TransferKey, TransferStatus,
};
use crate::event_bus::{DomainEvent, EventBus};
use crate::store::Store;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found")]
    NotFound,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("address source could not issue a unique address")]
    AddressUnavailable,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionInput {
    pub amount: String,
    pub currency: String,
    pub network: String,
    pub expiration_minutes: Option<u32>,
    pub client_ref_id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub network: Option<ChainId>,
    pub client_ref_id: Option<String>,
    pub from_date: Option<UnixTimestamp>,
    pub to_date: Option<UnixTimestamp>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub network: Option<ChainId>,
    pub status: Option<TransferStatus>,
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Clamps to the §4.3 contract: `limit ∈ [1,100]` default 10, `page ≥ 1`.
    pub fn normalized(self) -> Self {
        Page {
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Page { page: 1, limit: 10 }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PaginationMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

enum Op {
    CreateSession {
        input: CreateSessionInput,
        reply: oneshot::Sender<Result<Session, RegistryError>>,
    },
    GetSession {
        id: Uuid,
        reply: oneshot::Sender<Result<Session, RegistryError>>,
    },
    ListSessions {
        filter: SessionFilter,
        page: Page,
        reply: oneshot::Sender<(Vec<Session>, PaginationMeta)>,
    },
    RecreateSession {
        id: Uuid,
        reply: oneshot::Sender<Result<Session, RegistryError>>,
    },
    Apply {
        transfer: ObservedTransfer,
        reply: oneshot::Sender<()>,
    },
    ExpireDue {
        now: UnixTimestamp,
        reply: oneshot::Sender<()>,
    },
    GetTransfer {
        id: Uuid,
        reply: oneshot::Sender<Result<Transfer, RegistryError>>,
    },
    ListTransfers {
        filter: TransferFilter,
        page: Page,
        reply: oneshot::Sender<(Vec<Transfer>, PaginationMeta)>,
    },
}

/// Cheap, cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<Op>,
}

impl RegistryHandle {
    async fn call<T>(&self, make_op: impl FnOnce(oneshot::Sender<T>) -> Op) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        let op = make_op(reply_tx);
        // The registry task only exits at process shutdown, after every handle is dropped;
        // a send failure here would mean a programmer error wiring the actor up.
        self.sender
            .send(op)
            .await
            .expect("registry actor task is not running");
        reply_rx.await.expect("registry actor dropped the reply channel")
    }

    pub async fn create_session(&self, input: CreateSessionInput) -> Result<Session, RegistryError> {
        self.call(|reply| Op::CreateSession { input, reply }).await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session, RegistryError> {
        self.call(|reply| Op::GetSession { id, reply }).await
    }

    pub async fn list_sessions(
        &self,
        filter: SessionFilter,
        page: Page,
    ) -> (Vec<Session>, PaginationMeta) {
        self.call(|reply| Op::ListSessions { filter, page, reply }).await
    }

    pub async fn recreate_session(&self, id: Uuid) -> Result<Session, RegistryError> {
        self.call(|reply| Op::RecreateSession { id, reply }).await
    }

    /// Called by watchers for every observed log (§4.2 step 7). Never fails the caller.
    pub async fn apply(&self, transfer: ObservedTransfer) {
        self.call(|reply| Op::Apply { transfer, reply }).await
    }

    pub async fn expire_due(&self, now: UnixTimestamp) {
        self.call(|reply| Op::ExpireDue { now, reply }).await
    }

    pub async fn get_transfer(&self, id: Uuid) -> Result<Transfer, RegistryError> {
        self.call(|reply| Op::GetTransfer { id, reply }).await
    }

    pub async fn list_transfers(
        &self,
        filter: TransferFilter,
        page: Page,
    ) -> (Vec<Transfer>, PaginationMeta) {
        self.call(|reply| Op::ListTransfers { filter, page, reply }).await
    }
}

/// Spawns the registry actor task and returns a handle to it.
pub fn spawn_registry(
    chains: HashMap<ChainId, Arc<Chain>>,
    address_source: Arc<dyn AddressSource>,
    store: Arc<dyn Store>,
    event_bus: EventBus,
) -> RegistryHandle {
    let (sender, receiver) = mpsc::channel(256);
    let registry = SessionRegistry {
        chains,
        address_source,
        store,
        event_bus,
        sessions_by_id: HashMap::new(),
        sessions_by_address: HashMap::new(),
        transfers_by_id: HashMap::new(),
        transfers_by_key: HashMap::new(),
        transfers_by_session: HashMap::new(),
        transfer_match: HashMap::new(),
    };
    tokio::spawn(registry.run(receiver));
    RegistryHandle { sender }
}

struct SessionRegistry {
    chains: HashMap<ChainId, Arc<Chain>>,
    address_source: Arc<dyn AddressSource>,
    store: Arc<dyn Store>,
    event_bus: EventBus,

    sessions_by_id: HashMap<Uuid, Session>,
    sessions_by_address: HashMap<(ChainId, String), Uuid>,
    transfers_by_id: HashMap<Uuid, Transfer>,
    transfers_by_key: HashMap<TransferKey, Uuid>,
    transfers_by_session: HashMap<Uuid, Vec<Uuid>>,
    /// Internal bookkeeping: whether a transfer passed the match gate, and why not if it
    /// didn't. Not part of the wire `Transfer` schema (§3) — needed so a later confirmation
    /// of an already-rejected transfer doesn't retroactively complete the session.
    transfer_match: HashMap<Uuid, (bool, Option<String>)>,
}

impl SessionRegistry {
    async fn run(mut self, mut receiver: mpsc::Receiver<Op>) {
        while let Some(op) = receiver.recv().await {
            match op {
                Op::CreateSession { input, reply } => {
                    let _ = reply.send(self.handle_create_session(input).await);
                }
                Op::GetSession { id, reply } => {
                    let _ = reply.send(self.handle_get_session(id));
                }
                Op::ListSessions { filter, page, reply } => {
                    let _ = reply.send(self.handle_list_sessions(filter, page));
                }
                Op::RecreateSession { id, reply } => {
                    let _ = reply.send(self.handle_recreate_session(id).await);
                }
                Op::Apply { transfer, reply } => {
                    self.handle_apply(transfer).await;
                    let _ = reply.send(());
                }
                Op::ExpireDue { now, reply } => {
                    self.handle_expire_due(now).await;
                    let _ = reply.send(());
                }
                Op::GetTransfer { id, reply } => {
                    let _ = reply.send(self.handle_get_transfer(id));
                }
                Op::ListTransfers { filter, page, reply } => {
                    let _ = reply.send(self.handle_list_transfers(filter, page));
                }
            }
        }
    }

    fn now(&self) -> UnixTimestamp {
        UnixTimestamp::try_now().expect("system clock before unix epoch")
    }

    async fn persist_session(&self, session: &Session) {
        if let Err(err) = self.store.put_session(session).await {
            tracing::warn!(session_id = %session.id, error = %err, "failed to persist session");
        }
    }

    async fn persist_transfer(&self, transfer: &Transfer) {
        if let Err(err) = self.store.put_transfer(transfer).await {
            tracing::warn!(transfer_id = %transfer.id, error = %err, "failed to persist transfer");
        }
    }

    #[tracing::instrument(skip(self, input), fields(network = %input.network))]
    async fn handle_create_session(
        &mut self,
        input: CreateSessionInput,
    ) -> Result<Session, RegistryError> {
        let amount: MoneyAmount = input
            .amount
            .parse()
            .map_err(|e| RegistryError::InvalidInput(format!("amount: {e}")))?;
        if input.currency != "USDT" {
            return Err(RegistryError::InvalidInput(
                "currency must be USDT".to_string(),
            ));
        }
        let network: ChainId = input
            .network
            .parse()
            .map_err(|_| RegistryError::InvalidInput(format!("invalid network '{}'", input.network)))?;
        if !self.chains.contains_key(&network) {
            return Err(RegistryError::InvalidInput(format!(
                "network '{network}' is not configured"
            )));
        }
        let expiration_minutes = input.expiration_minutes.unwrap_or(30);
        if !(1..=1440).contains(&expiration_minutes) {
            return Err(RegistryError::InvalidInput(
                "expirationMinutes must be in [1,1440]".to_string(),
            ));
        }

        let chain = self.chains.get(&network).cloned().expect("checked above");
        let id = Uuid::new_v4();
        let address = self.issue_address(&chain, id).await?;
        let now = self.now();
        let session = Session {
            id,
            amount: amount.to_string(),
            currency: "USDT".to_string(),
            network: network.clone(),
            address,
            status: SessionStatus::Pending,
            created_at: now,
            expires_at: now.plus_minutes(expiration_minutes),
            completed_at: None,
            client_ref_id: input.client_ref_id,
            metadata: input.metadata,
            original_session_id: None,
            matched_transfer_id: None,
        };
        self.insert_pending_session(session.clone());
        self.persist_session(&session).await;
        self.event_bus
            .publish(DomainEvent::SessionCreated { session: session.clone() });
        Ok(session)
    }

    /// Issues an address for a new session, failing with `AddressUnavailable` if it is
    /// already backing another open `PENDING` session (§4.3 CreateSession, §8 address
    /// uniqueness). With the reference [`crate::address_source::FixedAddressSource`] this
    /// is the chain's single recipient, so at most one session per chain can be open at a
    /// time; a pluggable multi-address source would instead retry here.
    async fn issue_address(
        &self,
        chain: &Chain,
        session_id: Uuid,
    ) -> Result<alloy_primitives::Address, RegistryError> {
        const MAX_ATTEMPTS: u32 = 3;
        for _ in 0..MAX_ATTEMPTS {
            let address = self
                .address_source
                .new_address(chain, session_id)
                .await
                .map_err(|_| RegistryError::AddressUnavailable)?;
            let key = (chain.id.clone(), address_key(&address));
            if !self.sessions_by_address.contains_key(&key) {
                return Ok(address);
            }
        }
        Err(RegistryError::AddressUnavailable)
    }

    fn insert_pending_session(&mut self, session: Session) {
        let key = (session.network.clone(), address_key(&session.address));
        self.sessions_by_address.insert(key, session.id);
        self.sessions_by_id.insert(session.id, session);
    }

    fn handle_get_session(&self, id: Uuid) -> Result<Session, RegistryError> {
        self.sessions_by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    fn handle_list_sessions(
        &self,
        filter: SessionFilter,
        page: Page,
    ) -> (Vec<Session>, PaginationMeta) {
        let page = page.normalized();
        let mut matches: Vec<&Session> = self
            .sessions_by_id
            .values()
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .filter(|s| filter.network.as_ref().is_none_or(|n| &s.network == n))
            .filter(|s| {
                filter
                    .client_ref_id
                    .as_ref()
                    .is_none_or(|c| s.client_ref_id.as_deref() == Some(c.as_str()))
            })
            .filter(|s| filter.from_date.is_none_or(|from| s.created_at >= from))
            .filter(|s| filter.to_date.is_none_or(|to| s.created_at <= to))
            .collect();
        // createdAt descending, id ascending tie-break (§4.3 ListSessions ordering).
        matches.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
        });
        let total = matches.len() as u64;
        let start = ((page.page - 1) as usize) * page.limit as usize;
        let page_items = matches
            .into_iter()
            .skip(start)
            .take(page.limit as usize)
            .cloned()
            .collect();
        (
            page_items,
            PaginationMeta {
                page: page.page,
                limit: page.limit,
                total,
            },
        )
    }

    #[tracing::instrument(skip(self))]
    async fn handle_recreate_session(&mut self, id: Uuid) -> Result<Session, RegistryError> {
        let original = self
            .sessions_by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        if original.status != SessionStatus::Expired {
            return Err(RegistryError::InvalidState(
                "session must be EXPIRED to recreate".to_string(),
            ));
        }
        let chain = self
            .chains
            .get(&original.network)
            .cloned()
            .ok_or(RegistryError::NotFound)?;
        let new_id = Uuid::new_v4();
        let address = self.issue_address(&chain, new_id).await?;
        let now = self.now();
        let session = Session {
            id: new_id,
            amount: original.amount.clone(),
            currency: original.currency.clone(),
            network: original.network.clone(),
            address,
            status: SessionStatus::Pending,
            created_at: now,
            // The default expiration window (§4.3 CreateSession) is reused since recreate
            // does not carry its own override.
            expires_at: now.plus_minutes(30),
            completed_at: None,
            client_ref_id: original.client_ref_id.clone(),
            metadata: original.metadata.clone(),
            original_session_id: Some(id),
            matched_transfer_id: None,
        };
        self.insert_pending_session(session.clone());
        self.persist_session(&session).await;
        self.event_bus.publish(DomainEvent::SessionRecreated {
            session: session.clone(),
            original_session_id: id,
        });
        Ok(session)
    }

    #[tracing::instrument(skip(self, observed), fields(network = %observed.network, block = observed.block_number))]
    async fn handle_apply(&mut self, observed: ObservedTransfer) {
        let Some(chain) = self.chains.get(&observed.network).cloned() else {
            tracing::warn!(network = %observed.network, "dropping transfer for unconfigured network");
            return;
        };

        let key = TransferKey {
            network: observed.network.clone(),
            tx_hash: observed.tx_hash,
            log_index: observed.log_index,
        };

        if let Some(&existing_id) = self.transfers_by_key.get(&key) {
            self.handle_existing_transfer(existing_id, &observed, &chain)
                .await;
            return;
        }

        self.handle_new_transfer(key, observed, &chain).await;
    }

    async fn handle_existing_transfer(&mut self, id: Uuid, observed: &ObservedTransfer, chain: &Chain) {
        let mut transfer = self.transfers_by_id[&id].clone();
        // Monotonic confirmations (§3, §8): ignore stale re-delivery.
        if observed.confirmations <= transfer.confirmations {
            return;
        }
        transfer.confirmations = observed.confirmations;
        self.transfers_by_id.insert(id, transfer.clone());
        self.persist_transfer(&transfer).await;
        self.event_bus.publish(DomainEvent::TransferUpdated {
            transfer_id: id,
            confirmations: transfer.confirmations,
        });

        if transfer.confirmations >= chain.required_confirmations
            && transfer.status == TransferStatus::Pending
        {
            self.confirm_transfer(id).await;
        }
    }

    async fn handle_new_transfer(
        &mut self,
        key: TransferKey,
        observed: ObservedTransfer,
        chain: &Chain,
    ) {
        let id = Uuid::new_v4();
        let now = self.now();
        let amount = raw_to_decimal_string(observed.raw_value, chain.token_decimals);
        let addr_key = (observed.network.clone(), address_key(&observed.to));
        let session_id = self.sessions_by_address.get(&addr_key).copied();

        let transfer = Transfer {
            id,
            tx_hash: observed.tx_hash,
            log_index: observed.log_index,
            network: observed.network.clone(),
            token_contract: observed.token_contract,
            from: observed.from,
            to: observed.to,
            raw_value: observed.raw_value.to_string(),
            amount,
            block_number: observed.block_number,
            first_seen_at: now,
            confirmations: observed.confirmations,
            status: TransferStatus::Pending,
            confirmed_at: None,
            session_id,
        };

        let (matched, reason) = match session_id {
            Some(sid) => self.evaluate_match_gate(sid, &observed, chain),
            None => (false, None),
        };
        self.transfer_match.insert(id, (matched, reason.clone()));

        self.transfers_by_key.insert(key, id);
        self.transfers_by_id.insert(id, transfer.clone());
        if let Some(sid) = session_id {
            self.transfers_by_session.entry(sid).or_default().push(id);
        }
        self.persist_transfer(&transfer).await;

        self.event_bus.publish(DomainEvent::TransferDetected {
            transfer: transfer.clone(),
            session_id,
            matched,
            reason,
        });

        if transfer.confirmations >= chain.required_confirmations {
            self.confirm_transfer(id).await;
        }
    }

    /// Match gate (§4.3): sender allowlist, then the −5% tolerance band against the
    /// effective target amount.
    fn evaluate_match_gate(
        &self,
        session_id: Uuid,
        observed: &ObservedTransfer,
        chain: &Chain,
    ) -> (bool, Option<String>) {
        let Some(session) = self.sessions_by_id.get(&session_id) else {
            return (false, Some("session_not_found".to_string()));
        };
        if session.status != SessionStatus::Pending {
            return (false, Some("session_not_pending".to_string()));
        }
        if !chain.sender_allowlist.is_empty() && !chain.sender_allowlist.contains(&observed.from) {
            return (false, Some("sender_not_allowed".to_string()));
        }
        let target = match &chain.target_amount {
            Some(t) => *t,
            None => match session.amount.parse::<MoneyAmount>() {
                Ok(m) => m,
                Err(_) => return (false, Some("invalid_session_amount".to_string())),
            },
        };
        let target_raw = match decimal_to_raw(&target, chain.token_decimals) {
            Ok(v) => v,
            Err(_) => return (false, Some("invalid_target_amount".to_string())),
        };
        let floor = tolerance_floor(target_raw);
        if observed.raw_value >= floor {
            (true, None)
        } else {
            (false, Some("amount_below_tolerance".to_string()))
        }
    }

    /// Transitions a transfer to `CONFIRMED` and, if it passed the match gate against a
    /// still-`PENDING` session, completes that session (§4.3 acceptance path, §8 ordering).
    ///
    /// Called only once `confirmations >= chain.requiredConfirmations`, checked by the caller.
    async fn confirm_transfer(&mut self, id: Uuid) {
        let mut transfer = self.transfers_by_id[&id].clone();
        if transfer.status != TransferStatus::Pending {
            return; // terminal absorption (§8): never regress a confirmed transfer
        }
        let now = self.now();
        transfer.status = TransferStatus::Confirmed;
        transfer.confirmed_at = Some(now);
        self.transfers_by_id.insert(id, transfer.clone());
        self.persist_transfer(&transfer).await;
        self.event_bus.publish(DomainEvent::TransferConfirmed {
            transfer_id: id,
            session_id: transfer.session_id,
        });

        let Some(session_id) = transfer.session_id else {
            return;
        };
        let (matched, _) = self.transfer_match.get(&id).copied().unwrap_or((false, None));
        if !matched {
            return;
        }
        let Some(session) = self.sessions_by_id.get(&session_id).cloned() else {
            return;
        };
        if session.status != SessionStatus::Pending {
            return; // e.g. expired already won the race (§8 S4)
        }
        let mut session = session;
        session.status = SessionStatus::Completed;
        session.completed_at = Some(now);
        session.matched_transfer_id = Some(id);
        self.sessions_by_address
            .remove(&(session.network.clone(), address_key(&session.address)));
        self.sessions_by_id.insert(session_id, session.clone());
        self.persist_session(&session).await;
        self.event_bus.publish(DomainEvent::SessionCompleted {
            session_id,
            transfer_id: id,
        });
    }

    #[tracing::instrument(skip(self))]
    async fn handle_expire_due(&mut self, now: UnixTimestamp) {
        let due: Vec<Uuid> = self
            .sessions_by_id
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.expires_at <= now)
            .map(|s| s.id)
            .collect();
        for id in due {
            let mut session = self.sessions_by_id[&id].clone();
            session.status = SessionStatus::Expired;
            self.sessions_by_address
                .remove(&(session.network.clone(), address_key(&session.address)));
            self.sessions_by_id.insert(id, session.clone());
            self.persist_session(&session).await;
            self.event_bus
                .publish(DomainEvent::SessionExpired { session_id: id });
        }
    }

    fn handle_get_transfer(&self, id: Uuid) -> Result<Transfer, RegistryError> {
        self.transfers_by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    fn handle_list_transfers(
        &self,
        filter: TransferFilter,
        page: Page,
    ) -> (Vec<Transfer>, PaginationMeta) {
        let page = page.normalized();
        let mut matches: Vec<&Transfer> = self
            .transfers_by_id
            .values()
            .filter(|t| filter.network.as_ref().is_none_or(|n| &t.network == n))
            .filter(|t| filter.status.is_none_or(|status| t.status == status))
            .filter(|t| filter.session_id.is_none_or(|sid| t.session_id == Some(sid)))
            .collect();
        matches.sort_by(|a, b| b.first_seen_at.cmp(&a.first_seen_at).then_with(|| a.id.cmp(&b.id)));
        let total = matches.len() as u64;
        let start = ((page.page - 1) as usize) * page.limit as usize;
        let page_items = matches
            .into_iter()
            .skip(start)
            .take(page.limit as usize)
            .cloned()
            .collect();
        (
            page_items,
            PaginationMeta {
                page: page.page,
                limit: page.limit,
                total,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_source::FixedAddressSource;
    use crate::store::InMemoryStore;
    use alloy_primitives::{Address, U256};
    use std::str::FromStr;

    fn test_chain(id: &str, required_confirmations: u64) -> Arc<Chain> {
        Arc::new(Chain {
            id: ChainId::from_str(id).unwrap(),
            rpc_url: "http://localhost:8545".to_string(),
            token_contract: Address::ZERO,
            token_decimals: 18,
            required_confirmations,
            poll_interval_ms: 5000,
            max_block_range: 500,
            recipient: Address::ZERO,
            target_amount: None,
            sender_allowlist: Default::default(),
        })
    }

    fn harness(chain: Arc<Chain>) -> RegistryHandle {
        let (registry, _event_bus) = harness_with_bus(chain);
        registry
    }

    fn harness_with_bus(chain: Arc<Chain>) -> (RegistryHandle, EventBus) {
        let mut chains = HashMap::new();
        chains.insert(chain.id.clone(), chain);
        let event_bus = EventBus::new(64);
        let registry = spawn_registry(
            chains,
            Arc::new(FixedAddressSource),
            Arc::new(InMemoryStore::new()),
            event_bus.clone(),
        );
        (registry, event_bus)
    }

    /// Drains every event currently queued for a subscription without blocking.
    fn drain_events(subscription: &mut crate::event_bus::Subscription) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        while let Ok(event) = subscription.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn s1_exact_amount_confirmation() {
        let chain = test_chain("BEP20_TESTNET", 2);
        let (registry, event_bus) = harness_with_bus(chain.clone());
        let mut subscription = event_bus.subscribe();

        let session = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(30),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        let observed = ObservedTransfer {
            network: chain.id.clone(),
            token_contract: chain.token_contract,
            from: Address::with_last_byte(1),
            to: session.address,
            raw_value: U256::from(1_000000000000000000u64),
            block_number: 100,
            tx_hash: Default::default(),
            log_index: 0,
            confirmations: 1,
        };
        registry.apply(observed.clone()).await;
        let after_first = registry.get_session(session.id).await.unwrap();
        assert_eq!(after_first.status, SessionStatus::Pending);

        registry
            .apply(ObservedTransfer {
                confirmations: 3,
                ..observed
            })
            .await;
        let completed = registry.get_session(session.id).await.unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);
        assert!(completed.matched_transfer_id.is_some());

        // §5's per-session ordering guarantee: session.created < transfer.detected <
        // transfer.confirmed < session.completed (§8 S1), and transfer.detected reports
        // the match gate's verdict on first sighting.
        let events = drain_events(&mut subscription);
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], DomainEvent::SessionCreated { session } if session.id == completed.id));
        assert!(matches!(
            &events[1],
            DomainEvent::TransferDetected { matched: true, reason: None, transfer, .. }
                if transfer.confirmations == 1
        ));
        assert!(matches!(&events[2], DomainEvent::TransferUpdated { confirmations: 3, .. }));
        assert!(matches!(&events[3], DomainEvent::TransferConfirmed { session_id: Some(sid), .. } if *sid == completed.id));
        assert!(matches!(&events[4], DomainEvent::SessionCompleted { session_id, .. } if *session_id == completed.id));
        assert_eq!(subscription.lagged.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn s2_below_tolerance_underpayment_does_not_complete() {
        let chain = test_chain("BEP20_TESTNET", 2);
        let (registry, event_bus) = harness_with_bus(chain.clone());
        let mut subscription = event_bus.subscribe();
        let session = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(30),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let session_id = session.id;

        registry
            .apply(ObservedTransfer {
                network: chain.id.clone(),
                token_contract: chain.token_contract,
                from: Address::with_last_byte(1),
                to: session.address,
                raw_value: U256::from(949999999999999999u64),
                block_number: 100,
                tx_hash: Default::default(),
                log_index: 0,
                confirmations: 3,
            })
            .await;

        let session = registry.get_session(session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        // The transfer still gets confirmed on-chain (confirmations meets the
        // threshold); it just never completes the session because it failed the
        // match gate.
        let events = drain_events(&mut subscription);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], DomainEvent::SessionCreated { session } if session.id == session_id));
        assert!(matches!(
            &events[1],
            DomainEvent::TransferDetected { matched: false, reason: Some(reason), session_id: Some(sid), .. }
                if reason == "amount_below_tolerance" && *sid == session_id
        ));
        assert!(matches!(&events[2], DomainEvent::TransferConfirmed { session_id: Some(sid), .. } if *sid == session_id));
    }

    #[tokio::test]
    async fn s3_overpayment_is_accepted() {
        let chain = test_chain("BEP20_TESTNET", 1);
        let (registry, event_bus) = harness_with_bus(chain.clone());
        let mut subscription = event_bus.subscribe();
        let session = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(30),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let session_id = session.id;

        registry
            .apply(ObservedTransfer {
                network: chain.id.clone(),
                token_contract: chain.token_contract,
                from: Address::with_last_byte(1),
                to: session.address,
                raw_value: U256::from(2_000000000000000000u64),
                block_number: 100,
                tx_hash: Default::default(),
                log_index: 0,
                confirmations: 1,
            })
            .await;

        let session = registry.get_session(session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        let events = drain_events(&mut subscription);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], DomainEvent::SessionCreated { session } if session.id == session_id));
        assert!(matches!(
            &events[1],
            DomainEvent::TransferDetected { matched: true, reason: None, session_id: Some(sid), .. }
                if *sid == session_id
        ));
        assert!(matches!(&events[2], DomainEvent::TransferConfirmed { session_id: Some(sid), .. } if *sid == session_id));
        assert!(matches!(&events[3], DomainEvent::SessionCompleted { session_id: sid, .. } if *sid == session_id));
    }

    #[tokio::test]
    async fn s4_expiry_wins_race() {
        let chain = test_chain("BEP20_TESTNET", 1);
        let (registry, event_bus) = harness_with_bus(chain.clone());
        let mut subscription = event_bus.subscribe();
        let session = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(1),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let session_id = session.id;

        registry.expire_due(session.expires_at.plus_minutes(1)).await;
        let expired = registry.get_session(session_id).await.unwrap();
        assert_eq!(expired.status, SessionStatus::Expired);

        registry
            .apply(ObservedTransfer {
                network: chain.id.clone(),
                token_contract: chain.token_contract,
                from: Address::with_last_byte(1),
                to: session.address,
                raw_value: U256::from(1_000000000000000000u64),
                block_number: 100,
                tx_hash: Default::default(),
                log_index: 0,
                confirmations: 1,
            })
            .await;

        // The expired session's address index entry is already gone, so the
        // transfer that arrives afterward is never linked to it.
        let events = drain_events(&mut subscription);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], DomainEvent::SessionCreated { session } if session.id == session_id));
        assert!(matches!(&events[1], DomainEvent::SessionExpired { session_id: sid } if *sid == session_id));
        assert!(matches!(
            &events[2],
            DomainEvent::TransferDetected { matched: false, reason: None, session_id: None, .. }
        ));
        assert!(matches!(&events[3], DomainEvent::TransferConfirmed { session_id: None, .. }));

        let still_expired = registry.get_session(session.id).await.unwrap();
        assert_eq!(still_expired.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn s5_recreate_chain_links_original() {
        let chain = test_chain("BEP20_TESTNET", 1);
        let registry = harness(chain.clone());
        let a = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(1),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        registry.expire_due(a.expires_at.plus_minutes(1)).await;

        let b = registry.recreate_session(a.id).await.unwrap();
        assert_eq!(b.original_session_id, Some(a.id));
        // Same chain ⇒ same fixed recipient address (§3 Glossary); sessions on one chain
        // are told apart by amount and lifecycle, not by address.
        assert_eq!(b.address, a.address);
        assert_eq!(b.status, SessionStatus::Pending);

        registry
            .apply(ObservedTransfer {
                network: chain.id.clone(),
                token_contract: chain.token_contract,
                from: Address::with_last_byte(1),
                to: b.address,
                raw_value: U256::from(1_000000000000000000u64),
                block_number: 100,
                tx_hash: Default::default(),
                log_index: 0,
                confirmations: 1,
            })
            .await;

        let a_after = registry.get_session(a.id).await.unwrap();
        let b_after = registry.get_session(b.id).await.unwrap();
        assert_eq!(a_after.status, SessionStatus::Expired);
        assert_eq!(b_after.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn second_pending_session_on_same_chain_is_rejected() {
        let chain = test_chain("BEP20_TESTNET", 1);
        let registry = harness(chain.clone());
        let input = || CreateSessionInput {
            amount: "1.0".to_string(),
            currency: "USDT".to_string(),
            network: "BEP20_TESTNET".to_string(),
            expiration_minutes: Some(30),
            client_ref_id: None,
            metadata: Default::default(),
        };
        registry.create_session(input()).await.unwrap();
        let second = registry.create_session(input()).await;
        assert!(matches!(second, Err(RegistryError::AddressUnavailable)));
    }

    #[tokio::test]
    async fn dedup_on_natural_key() {
        let chain = test_chain("BEP20_TESTNET", 5);
        let registry = harness(chain.clone());
        let session = registry
            .create_session(CreateSessionInput {
                amount: "1.0".to_string(),
                currency: "USDT".to_string(),
                network: "BEP20_TESTNET".to_string(),
                expiration_minutes: Some(30),
                client_ref_id: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let observed = ObservedTransfer {
            network: chain.id.clone(),
            token_contract: chain.token_contract,
            from: Address::with_last_byte(1),
            to: session.address,
            raw_value: U256::from(1_000000000000000000u64),
            block_number: 100,
            tx_hash: Default::default(),
            log_index: 0,
            confirmations: 1,
        };
        registry.apply(observed.clone()).await;
        registry.apply(observed.clone()).await;
        registry.apply(observed).await;

        let (transfers, meta) = registry
            .list_transfers(
                TransferFilter {
                    session_id: Some(session.id),
                    ..Default::default()
                },
                Page::default(),
            )
            .await;
        assert_eq!(meta.total, 1);
        assert_eq!(transfers.len(), 1);
    }
}
