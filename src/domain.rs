//! Core data model: [`Chain`] static configuration, and the [`Session`] / [`Transfer`]
//! records the registry owns and mutates.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::amount::MoneyAmount;
use crate::timestamp::UnixTimestamp;

/// A stable chain tag, e.g. `BEP20`, `BEP20_TESTNET`, `POLYGON`, `AMOY`.
///
/// Also doubles as the `<CHAIN>` prefix in per-chain environment variables (§6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("chain id '{0}' must be non-empty and contain only uppercase letters, digits, and underscores")]
pub struct ChainIdError(String);

impl FromStr for ChainId {
    type Err = ChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(ChainId(s.to_string()))
        } else {
            Err(ChainIdError(s.to_string()))
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ChainId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Static, per-chain configuration. One instance per entry in `ACTIVE_NETWORKS`.
#[derive(Debug, Clone)]
pub struct Chain {
    pub id: ChainId,
    pub rpc_url: String,
    pub token_contract: Address,
    pub token_decimals: u8,
    pub required_confirmations: u64,
    pub poll_interval_ms: u64,
    pub max_block_range: u64,
    pub recipient: Address,
    pub target_amount: Option<MoneyAmount>,
    pub sender_allowlist: BTreeSet<Address>,
}

impl Chain {
    /// `tokenDecimals ∈ [0,30]`; `requiredConfirmations ≥ 1` (§3 invariant).
    pub fn validate(&self) -> Result<(), String> {
        if self.token_decimals > 30 {
            return Err(format!(
                "{}: tokenDecimals {} is out of range [0,30]",
                self.id, self.token_decimals
            ));
        }
        if self.required_confirmations < 1 {
            return Err(format!(
                "{}: requiredConfirmations must be >= 1",
                self.id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Pending,
    Completed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub amount: String,
    pub currency: String,
    pub network: ChainId,
    pub address: Address,
    pub status: SessionStatus,
    pub created_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
    pub completed_at: Option<UnixTimestamp>,
    pub client_ref_id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub original_session_id: Option<Uuid>,
    pub matched_transfer_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub tx_hash: B256,
    pub log_index: u64,
    pub network: ChainId,
    pub token_contract: Address,
    pub from: Address,
    pub to: Address,
    pub raw_value: String,
    pub amount: String,
    pub block_number: u64,
    pub first_seen_at: UnixTimestamp,
    pub confirmations: u64,
    pub status: TransferStatus,
    pub confirmed_at: Option<UnixTimestamp>,
    pub session_id: Option<Uuid>,
}

/// Natural key the registry deduplicates `Transfer` records on (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub network: ChainId,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl Transfer {
    pub fn key(&self) -> TransferKey {
        TransferKey {
            network: self.network.clone(),
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }
}

/// A parsed `Transfer(address,address,uint256)` log, as emitted by a watcher's
/// [`crate::chain_watcher::ChainWatcher::tick`] for [`crate::registry::RegistryHandle::apply`] (§4.2 step 7).
#[derive(Debug, Clone)]
pub struct ObservedTransfer {
    pub network: ChainId,
    pub token_contract: Address,
    pub from: Address,
    pub to: Address,
    pub raw_value: alloy_primitives::U256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub confirmations: u64,
}

/// Lowercases an address for use as an index key, matching `sessionsByAddress`'s
/// `(network, lowercase(address))` key shape (§3).
pub fn address_key(address: &Address) -> String {
    format!("{address:#x}")
}
