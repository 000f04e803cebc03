//! Shared, read-mostly view of each watcher's health, for the
//! `GET /api/v1/system/network-status` facade (§6).
//!
//! Deliberately separate from [`crate::registry`]: this is watcher/cursor health, not
//! session/transfer state, and reading it must never compete with the registry's mailbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::ChainId;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainStatus {
    Active,
    Halted,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainStatusView {
    pub network: ChainId,
    pub status: ChainStatus,
    pub last_checked_block: u64,
    pub last_polled_at: UnixTimestamp,
    pub halted_reason: Option<String>,
}

#[derive(Clone, Default)]
pub struct NetworkStatusTracker {
    inner: Arc<Mutex<HashMap<ChainId, ChainStatusView>>>,
}

impl NetworkStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, network: &ChainId, last_checked_block: u64, now: UnixTimestamp) {
        self.inner.lock().unwrap().insert(
            network.clone(),
            ChainStatusView {
                network: network.clone(),
                status: ChainStatus::Active,
                last_checked_block,
                last_polled_at: now,
                halted_reason: None,
            },
        );
    }

    pub fn record_halted(&self, network: &ChainId, reason: String, now: UnixTimestamp) {
        let mut guard = self.inner.lock().unwrap();
        let last_checked_block = guard.get(network).map(|v| v.last_checked_block).unwrap_or(0);
        guard.insert(
            network.clone(),
            ChainStatusView {
                network: network.clone(),
                status: ChainStatus::Halted,
                last_checked_block,
                last_polled_at: now,
                halted_reason: Some(reason),
            },
        );
    }

    pub fn snapshot(&self) -> Vec<ChainStatusView> {
        let mut views: Vec<ChainStatusView> = self.inner.lock().unwrap().values().cloned().collect();
        views.sort_by(|a, b| a.network.cmp(&b.network));
        views
    }
}
