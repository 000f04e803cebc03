//! `Store`: the persistence boundary the registry writes through.
//!
//! The core only depends on this trait; durability across restart is a deployment
//! choice (§1, §9), not a core responsibility. The reference deployment below is
//! volatile: a restart loses all sessions and transfers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Session, Transfer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Durability boundary for sessions and transfers.
///
/// The registry calls through this trait after each committed mutation; it never
/// reads the store back into its own indices except at startup.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn put_transfer(&self, transfer: &Transfer) -> Result<(), StoreError>;
    async fn load_sessions(&self) -> Result<Vec<Session>, StoreError>;
    async fn load_transfers(&self) -> Result<Vec<Transfer>, StoreError>;
}

/// Volatile in-memory `Store`. Restart resets watcher cursors to current head and
/// loses all sessions/transfers, which is acceptable for the reference deployment (§9).
#[derive(Default)]
pub struct InMemoryStore {
    sessions: tokio::sync::Mutex<std::collections::HashMap<Uuid, Session>>,
    transfers: tokio::sync::Mutex<std::collections::HashMap<Uuid, Transfer>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn put_transfer(&self, transfer: &Transfer) -> Result<(), StoreError> {
        self.transfers
            .lock()
            .await
            .insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.sessions.lock().await.values().cloned().collect())
    }

    async fn load_transfers(&self) -> Result<Vec<Transfer>, StoreError> {
        Ok(self.transfers.lock().await.values().cloned().collect())
    }
}
