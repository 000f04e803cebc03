//! `ChainClient` (§4.1): a thin, typed wrapper over a single EVM JSON-RPC endpoint.
//!
//! Pure request/response: no retry policy lives here, only in [`crate::chain_watcher`].

use alloy_primitives::{Address, B256};
use alloy_rpc_client::{ClientBuilder, RpcClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("transient RPC error: {0}")]
    Transient(String),
    #[error("requested block range is too wide")]
    RangeTooWide,
    #[error("fatal RPC client error: {0}")]
    Fatal(String),
}

/// `getLogs` filter, matching §6's exact on-wire log filter.
#[derive(Debug, Clone, Serialize)]
pub struct LogFilter {
    pub address: Address,
    /// `topics[0] = keccak256("Transfer(address,address,uint256)")`, `topics[2] = pad32(recipient)`.
    pub topics: Vec<Option<B256>>,
    #[serde(rename = "fromBlock")]
    pub from_block: String,
    #[serde(rename = "toBlock")]
    pub to_block: String,
}

impl LogFilter {
    pub fn transfer_to(address: Address, recipient: Address, from_block: u64, to_block: u64) -> Self {
        let transfer_topic = alloy_primitives::keccak256(b"Transfer(address,address,uint256)");
        let recipient_topic = B256::left_padding_from(recipient.as_slice());
        LogFilter {
            address,
            topics: vec![Some(transfer_topic), None, Some(recipient_topic)],
            from_block: format!("0x{from_block:x}"),
            to_block: format!("0x{to_block:x}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: alloy_primitives::Bytes,
    #[serde(rename = "blockNumber")]
    pub block_number: alloy_primitives::U64,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: B256,
    #[serde(rename = "logIndex")]
    pub log_index: alloy_primitives::U64,
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Clone)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub status: bool,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainClientError>;
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainClientError>;
    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, ChainClientError>;
}

/// The production `ChainClient`: a single JSON-RPC HTTP endpoint per chain.
pub struct EvmChainClient {
    client: RpcClient,
    timeout: Duration,
}

impl EvmChainClient {
    pub fn new(rpc_url: &str) -> Result<Self, ChainClientError> {
        let url = rpc_url
            .parse()
            .map_err(|e| ChainClientError::Fatal(format!("invalid RPC URL '{rpc_url}': {e}")))?;
        let client = ClientBuilder::default().http(url);
        Ok(Self {
            client,
            timeout: DEFAULT_RPC_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<P, R>(&self, method: &'static str, params: P) -> Result<R, ChainClientError>
    where
        P: Serialize + Send + Sync + Clone + 'static,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        let fut = self.client.request(method, params);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let message = err.to_string();
                if message.contains("range") && message.contains("large")
                    || message.contains("block range")
                {
                    Err(ChainClientError::RangeTooWide)
                } else {
                    Err(ChainClientError::Transient(message))
                }
            }
            Err(_) => Err(ChainClientError::Transient(format!(
                "{method} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    #[tracing::instrument(skip(self), err)]
    async fn block_number(&self) -> Result<u64, ChainClientError> {
        let hex: alloy_primitives::U64 = self.call("eth_blockNumber", ()).await?;
        Ok(hex.to::<u64>())
    }

    #[tracing::instrument(skip(self, filter), err)]
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainClientError> {
        self.call("eth_getLogs", (filter.clone(),)).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, ChainClientError> {
        #[derive(Deserialize)]
        struct Receipt {
            #[serde(rename = "blockNumber")]
            block_number: alloy_primitives::U64,
            status: Option<alloy_primitives::U64>,
        }
        let receipt: Option<Receipt> = self
            .call("eth_getTransactionReceipt", (tx_hash,))
            .await?;
        Ok(receipt.map(|r| ReceiptInfo {
            block_number: r.block_number.to::<u64>(),
            status: r.status.map(|s| s.to::<u64>() == 1).unwrap_or(false),
        }))
    }
}
