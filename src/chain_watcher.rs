//! `ChainWatcher` (§4.2): the per-chain polling loop that turns chain head movement into
//! a stream of normalized [`ObservedTransfer`]s.
//!
//! Mirrors the bounded catch-up, skip-on-transient-error shape of a block-range indexing
//! loop: never advance the cursor past a range whose logs were not successfully processed.

use alloy_primitives::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain_client::{ChainClient, ChainClientError, LogFilter, RawLog};
use crate::domain::{Chain, ObservedTransfer};
use crate::event_bus::{DomainEvent, EventBus};
use crate::network_status::NetworkStatusTracker;
use crate::registry::RegistryHandle;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, thiserror::Error)]
pub enum ChainWatcherError {
    #[error("failed to initialize watcher for {network}: {source}")]
    Init {
        network: String,
        #[source]
        source: ChainClientError,
    },
}

const RANGE_TOO_WIDE_RETRIES: u32 = 3;

pub struct ChainWatcher<C: ChainClient> {
    chain: Arc<Chain>,
    client: Arc<C>,
    registry: RegistryHandle,
    event_bus: EventBus,
    status: NetworkStatusTracker,
    cancellation_token: CancellationToken,
}

impl<C: ChainClient + 'static> ChainWatcher<C> {
    pub fn new(
        chain: Arc<Chain>,
        client: Arc<C>,
        registry: RegistryHandle,
        event_bus: EventBus,
        status: NetworkStatusTracker,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            chain,
            client,
            registry,
            event_bus,
            status,
            cancellation_token,
        }
    }

    /// `Initialize()`: sets the cursor to the current head so the first poll only
    /// picks up blocks mined after startup.
    #[tracing::instrument(skip(self), fields(network = %self.chain.id), err)]
    pub async fn initialize(&self) -> Result<u64, ChainWatcherError> {
        self.client
            .block_number()
            .await
            .map_err(|source| ChainWatcherError::Init {
                network: self.chain.id.to_string(),
                source,
            })
    }

    /// Runs the tick loop until cancelled. Consumes `self` since nothing else may
    /// observe or share watcher state once the task owns the cursor (§5).
    pub async fn run(self) {
        let mut cursor = match self.initialize().await {
            Ok(head) => head,
            Err(err) => {
                tracing::error!(network = %self.chain.id, error = %err, "watcher failed to initialize");
                self.event_bus.publish(DomainEvent::ChainHalted {
                    network: self.chain.id.clone(),
                    reason: err.to_string(),
                });
                if let Ok(now) = UnixTimestamp::try_now() {
                    self.status.record_halted(&self.chain.id, err.to_string(), now);
                }
                return;
            }
        };
        tracing::info!(network = %self.chain.id, cursor, "watcher initialized");
        if let Ok(now) = UnixTimestamp::try_now() {
            self.status.record_tick(&self.chain.id, cursor, now);
        }

        let poll_interval = Duration::from_millis(self.chain.poll_interval_ms);
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!(network = %self.chain.id, "watcher stopping");
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            cursor = self.tick(cursor).await;
        }
    }

    /// `Tick()` (§4.2): the core polling algorithm. Returns the (possibly unchanged) cursor.
    #[tracing::instrument(skip(self), fields(network = %self.chain.id, cursor), err(level = "warn"))]
    async fn tick(&self, cursor: u64) -> u64 {
        match self.try_tick(cursor).await {
            Ok(new_cursor) => {
                if let Ok(now) = UnixTimestamp::try_now() {
                    self.status.record_tick(&self.chain.id, new_cursor, now);
                }
                new_cursor
            }
            Err(message) => {
                tracing::warn!(network = %self.chain.id, error = %message, "tick skipped");
                cursor
            }
        }
    }

    async fn try_tick(&self, cursor: u64) -> Result<u64, String> {
        // Step 1: head := client.BlockNumber(). Transient failure: skip, don't advance.
        let head = self
            .client
            .block_number()
            .await
            .map_err(|e| e.to_string())?;

        // Step 2: from := cursor + 1. No new blocks ⇒ no-op.
        let from = cursor + 1;
        if head < from {
            return Ok(cursor);
        }

        // Step 3: bounded catch-up (S6). Older gaps are deliberately sacrificed.
        let max_range = self.chain.max_block_range;
        let clamped_from = if head - from + 1 > max_range {
            head - max_range + 1
        } else {
            from
        };

        // Steps 4-5: build the filter, fetch logs, retry-with-halving on RangeTooWide.
        let logs = self.fetch_logs_with_retry(clamped_from, head).await?;

        // Steps 6-7: parse each log and hand it to the registry.
        for log in logs {
            match self.parse_log(&log, head) {
                Ok(observed) => self.registry.apply(observed).await,
                Err(reason) => {
                    tracing::warn!(network = %self.chain.id, reason, "skipping unparseable log");
                }
            }
        }

        // Step 8: only advance the cursor once 5-7 succeeded.
        Ok(head)
    }

    async fn fetch_logs_with_retry(&self, from: u64, to: u64) -> Result<Vec<RawLog>, String> {
        let mut from = from;
        for attempt in 0..=RANGE_TOO_WIDE_RETRIES {
            let filter = LogFilter::transfer_to(self.chain.token_contract, self.chain.recipient, from, to);
            match self.client.get_logs(&filter).await {
                Ok(logs) => return Ok(logs),
                Err(ChainClientError::RangeTooWide) if attempt < RANGE_TOO_WIDE_RETRIES => {
                    let span = to - from + 1;
                    let half = (span / 2).max(1);
                    from = to - half + 1;
                    tracing::warn!(network = %self.chain.id, new_span = half, "range too wide, halving window");
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        Err("range too wide after max retries".to_string())
    }

    fn parse_log(&self, log: &RawLog, head: u64) -> Result<ObservedTransfer, String> {
        if log.removed {
            return Err("log marked removed (reorg)".to_string());
        }
        if log.topics.len() != 3 {
            return Err(format!("expected 3 topics for Transfer, got {}", log.topics.len()));
        }
        let from = alloy_primitives::Address::from_slice(&log.topics[1].as_slice()[12..]);
        let to = alloy_primitives::Address::from_slice(&log.topics[2].as_slice()[12..]);
        // Defensive: the topic filter should already guarantee this (§4.2 step 6).
        if to != self.chain.recipient {
            return Err("log 'to' does not match configured recipient".to_string());
        }
        let raw_value = U256::from_be_slice(&log.data);
        let block_number = log.block_number.to::<u64>();
        let confirmations = head.saturating_sub(block_number) + 1;
        Ok(ObservedTransfer {
            network: self.chain.id.clone(),
            token_contract: log.address,
            from,
            to,
            raw_value,
            block_number,
            tx_hash: log.transaction_hash,
            log_index: log.log_index.to::<u64>(),
            confirmations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_source::FixedAddressSource;
    use crate::chain_client::ReceiptInfo;
    use crate::domain::ChainId;
    use crate::registry::spawn_registry;
    use crate::store::InMemoryStore;
    use alloy_primitives::{Address, B256};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct FakeChainClient {
        head: u64,
        logs: Vec<RawLog>,
        range_too_wide_until_span: Option<u64>,
        captured_filters: Mutex<Vec<LogFilter>>,
        get_logs_calls: AtomicU64,
    }

    impl FakeChainClient {
        fn new(head: u64) -> Self {
            FakeChainClient {
                head,
                logs: Vec::new(),
                range_too_wide_until_span: None,
                captured_filters: Mutex::new(Vec::new()),
                get_logs_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChainClient {
        async fn block_number(&self) -> Result<u64, ChainClientError> {
            Ok(self.head)
        }

        async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainClientError> {
            self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
            self.captured_filters.lock().unwrap().push(filter.clone());
            let from = u64::from_str_radix(filter.from_block.trim_start_matches("0x"), 16).unwrap();
            let to = u64::from_str_radix(filter.to_block.trim_start_matches("0x"), 16).unwrap();
            let span = to - from + 1;
            if let Some(threshold) = self.range_too_wide_until_span {
                if span > threshold {
                    return Err(ChainClientError::RangeTooWide);
                }
            }
            Ok(self.logs.clone())
        }

        async fn get_receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptInfo>, ChainClientError> {
            Ok(None)
        }
    }

    fn test_watcher(chain: Arc<Chain>, client: FakeChainClient) -> ChainWatcher<FakeChainClient> {
        let mut chains = HashMap::new();
        chains.insert(chain.id.clone(), chain.clone());
        let registry = spawn_registry(
            chains,
            Arc::new(FixedAddressSource),
            Arc::new(InMemoryStore::new()),
            EventBus::new(64),
        );
        ChainWatcher::new(
            chain,
            Arc::new(client),
            registry,
            EventBus::new(64),
            NetworkStatusTracker::new(),
            CancellationToken::new(),
        )
    }

    fn test_chain() -> Arc<Chain> {
        Arc::new(Chain {
            id: ChainId::from_str("BEP20_TESTNET").unwrap(),
            rpc_url: "http://localhost:8545".to_string(),
            token_contract: Address::ZERO,
            token_decimals: 18,
            required_confirmations: 1,
            poll_interval_ms: 5000,
            max_block_range: 500,
            recipient: Address::ZERO,
            target_amount: None,
            sender_allowlist: Default::default(),
        })
    }

    #[tokio::test]
    async fn no_new_blocks_is_a_no_op() {
        let watcher = test_watcher(test_chain(), FakeChainClient::new(100));
        let cursor = watcher.tick(100).await;
        assert_eq!(cursor, 100);
    }

    /// S6: a 2000-block gap with `maxBlockRange=500` clamps `from` to `head-499`, advances
    /// the cursor to `head`, and emits nothing for the sacrificed range.
    #[tokio::test]
    async fn s6_large_restart_gap_is_clamped() {
        let client = FakeChainClient::new(2000);
        let watcher = test_watcher(test_chain(), client);
        let cursor = watcher.tick(0).await;
        assert_eq!(cursor, 2000);

        let filters = watcher.client.captured_filters.lock().unwrap();
        assert_eq!(filters.len(), 1);
        let from = u64::from_str_radix(filters[0].from_block.trim_start_matches("0x"), 16).unwrap();
        let to = u64::from_str_radix(filters[0].to_block.trim_start_matches("0x"), 16).unwrap();
        assert_eq!(from, 2000 - 500 + 1);
        assert_eq!(to, 2000);
    }

    #[tokio::test]
    async fn range_too_wide_halves_the_window_until_it_fits() {
        let mut client = FakeChainClient::new(1000);
        client.range_too_wide_until_span = Some(100);
        let watcher = test_watcher(test_chain(), client);
        let cursor = watcher.tick(0).await;
        assert_eq!(cursor, 1000);
        // Halving 1001 repeatedly until the span is <= 100 takes more than one call.
        assert!(watcher.client.get_logs_calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn block_number_error_does_not_advance_cursor() {
        struct FailingClient;
        #[async_trait]
        impl ChainClient for FailingClient {
            async fn block_number(&self) -> Result<u64, ChainClientError> {
                Err(ChainClientError::Transient("rpc down".to_string()))
            }
            async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<RawLog>, ChainClientError> {
                Ok(Vec::new())
            }
            async fn get_receipt(&self, _tx_hash: B256) -> Result<Option<ReceiptInfo>, ChainClientError> {
                Ok(None)
            }
        }

        let chain = test_chain();
        let mut chains = HashMap::new();
        chains.insert(chain.id.clone(), chain.clone());
        let registry = spawn_registry(
            chains,
            Arc::new(FixedAddressSource),
            Arc::new(InMemoryStore::new()),
            EventBus::new(64),
        );
        let watcher = ChainWatcher::new(
            chain,
            Arc::new(FailingClient),
            registry,
            EventBus::new(64),
            NetworkStatusTracker::new(),
            CancellationToken::new(),
        );
        let cursor = watcher.tick(50).await;
        assert_eq!(cursor, 50);
    }
}
