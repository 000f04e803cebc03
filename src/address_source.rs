//! `AddressSource`: the pluggable boundary that issues a session's receiving address.
//!
//! Every session on a chain is paid to that chain's single configured `recipient` (§3
//! Glossary: "the single destination address the watcher filters logs for on a given
//! chain") — the watcher's `getLogs` filter only ever has one address to search for.
//! This is why at most one `PENDING` session may exist per `(network, address)`: with a
//! single address per chain, that collapses to at most one open session per chain at a
//! time, and sessions are told apart by amount rather than by address. A deployment that
//! wants concurrent sessions swaps in an `AddressSource` backed by an HD wallet or address
//! pool; that mechanism is out of scope here (§1) and specified only at this boundary.

use alloy_primitives::Address;
use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Chain, ChainId};

#[derive(Debug, thiserror::Error)]
pub enum AddressSourceError {
    #[error("address source exhausted for network {0}")]
    Exhausted(ChainId),
}

#[async_trait]
pub trait AddressSource: Send + Sync {
    async fn new_address(&self, chain: &Chain, session_id: Uuid) -> Result<Address, AddressSourceError>;
}

/// Reference `AddressSource`: every session is assigned the chain's configured recipient.
#[derive(Default)]
pub struct FixedAddressSource;

#[async_trait]
impl AddressSource for FixedAddressSource {
    async fn new_address(&self, chain: &Chain, _session_id: Uuid) -> Result<Address, AddressSourceError> {
        Ok(chain.recipient)
    }
}
