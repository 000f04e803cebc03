//! `CoreConfig` (§6, §9): environment-driven configuration for the chain-watch core.
//!
//! Built once at startup into an immutable struct and passed by reference — replacing
//! ad-hoc `env::var` lookups scattered through the codebase with one validated surface
//! that fails fast before any watcher starts.

use alloy_primitives::Address;
use clap::Parser;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::amount::MoneyAmount;
use crate::domain::{Chain, ChainId};

pub mod defaults {
    pub const PORT: u16 = 8080;
    pub const HOST: &str = "0.0.0.0";
    pub const MAX_BLOCK_RANGE: u64 = 500;
    pub const EVENT_BUS_QUEUE_CAPACITY: usize = 1024;
    pub const SHUTDOWN_FLUSH_DEADLINE_MS: u64 = 5000;
    pub const EXPIRY_SCAN_INTERVAL_MS: u64 = 30_000;
    pub const MAX_EXPIRY_SCAN_INTERVAL_MS: u64 = 30_000;
    pub const EXPIRATION_MINUTES: u32 = 30;
}

#[derive(Parser, Debug)]
#[command(name = "chainwatch-core")]
#[command(about = "Multi-chain USDT payment session core")]
struct CliArgs {
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,
    /// Comma-separated chain ids; empty means no watchers, API only (§6).
    #[arg(long, env = "ACTIVE_NETWORKS", default_value = "")]
    active_networks: String,
    #[arg(long, env = "API_KEY")]
    api_key: Option<String>,
    /// Overrides every session's completion target amount when set (§3, §4.3).
    #[arg(long, env = "TARGET_USDT_AMOUNT")]
    target_usdt_amount: Option<String>,
    /// A single allowlisted sender address, applied to every configured chain.
    #[arg(long, env = "SENDER_ADDRESS")]
    sender_address: Option<String>,
    #[arg(long, env = "EVENT_BUS_QUEUE_CAPACITY", default_value = "1024")]
    event_bus_queue_capacity: usize,
    #[arg(long, env = "SHUTDOWN_FLUSH_DEADLINE_MS", default_value = "5000")]
    shutdown_flush_deadline_ms: u64,
    #[arg(long, env = "EXPIRY_SCAN_INTERVAL_MS", default_value = "30000")]
    expiry_scan_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid CLI/environment arguments: {0}")]
    Args(#[from] clap::Error),
    #[error("missing required environment variable {0}")]
    MissingEnv(String),
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
    #[error("invalid chain id '{0}' in ACTIVE_NETWORKS")]
    InvalidChainId(String),
    #[error("{0}")]
    ChainInvariant(String),
    #[error("EXPIRY_SCAN_INTERVAL_MS must be in (0,{max}], got {value}", max = defaults::MAX_EXPIRY_SCAN_INTERVAL_MS)]
    ExpiryIntervalOutOfRange { value: u64 },
}

/// Immutable, fully-validated configuration, built once at startup (§9).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub host: IpAddr,
    pub port: u16,
    pub api_key: Option<String>,
    pub chains: HashMap<ChainId, Chain>,
    pub event_bus_queue_capacity: usize,
    pub shutdown_flush_deadline: Duration,
    pub expiry_scan_interval: Duration,
    pub default_expiration_minutes: u32,
}

fn require_env(var: &str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))
}

fn optional_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.is_empty())
}

fn parse_env<T: FromStr>(var: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        message: format!("could not parse '{raw}'"),
    })
}

impl CoreConfig {
    /// Parses CLI args/environment (clap, per-process globals) then resolves the
    /// per-chain `<CHAIN>_*` variables named in `ACTIVE_NETWORKS` (§6).
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::try_parse()?;
        Self::from_args(args)
    }

    fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let host: IpAddr = args
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                var: "HOST".to_string(),
                message: format!("'{}' is not a valid IP address", args.host),
            })?;

        let global_target_amount = args
            .target_usdt_amount
            .as_deref()
            .map(|raw| {
                raw.parse::<MoneyAmount>().map_err(|e| ConfigError::InvalidValue {
                    var: "TARGET_USDT_AMOUNT".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        let global_sender = args
            .sender_address
            .as_deref()
            .map(|raw| {
                Address::from_str(raw).map_err(|e| ConfigError::InvalidValue {
                    var: "SENDER_ADDRESS".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        let mut chains = HashMap::new();
        for raw_id in args.active_networks.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let chain_id = ChainId::from_str(raw_id)
                .map_err(|_| ConfigError::InvalidChainId(raw_id.to_string()))?;
            let chain = Self::load_chain(&chain_id, global_target_amount, global_sender)?;
            chain
                .validate()
                .map_err(ConfigError::ChainInvariant)?;
            chains.insert(chain_id, chain);
        }

        if args.expiry_scan_interval_ms == 0
            || args.expiry_scan_interval_ms > defaults::MAX_EXPIRY_SCAN_INTERVAL_MS
        {
            return Err(ConfigError::ExpiryIntervalOutOfRange {
                value: args.expiry_scan_interval_ms,
            });
        }

        Ok(CoreConfig {
            host,
            port: args.port,
            api_key: args.api_key,
            chains,
            event_bus_queue_capacity: args.event_bus_queue_capacity,
            shutdown_flush_deadline: Duration::from_millis(args.shutdown_flush_deadline_ms),
            expiry_scan_interval: Duration::from_millis(args.expiry_scan_interval_ms),
            default_expiration_minutes: defaults::EXPIRATION_MINUTES,
        })
    }

    fn load_chain(
        chain_id: &ChainId,
        global_target_amount: Option<MoneyAmount>,
        global_sender: Option<Address>,
    ) -> Result<Chain, ConfigError> {
        let prefix = chain_id.as_str();
        let rpc_url = require_env(&format!("{prefix}_RPC_URL"))?;
        let token_contract_raw = require_env(&format!("{prefix}_TOKEN_CONTRACT"))?;
        let token_contract =
            Address::from_str(&token_contract_raw).map_err(|e| ConfigError::InvalidValue {
                var: format!("{prefix}_TOKEN_CONTRACT"),
                message: e.to_string(),
            })?;
        let recipient_raw = require_env(&format!("{prefix}_RECIPIENT"))?;
        let recipient = Address::from_str(&recipient_raw).map_err(|e| ConfigError::InvalidValue {
            var: format!("{prefix}_RECIPIENT"),
            message: e.to_string(),
        })?;
        let token_decimals: u8 = parse_env(
            &format!("{prefix}_TOKEN_DECIMALS"),
            &require_env(&format!("{prefix}_TOKEN_DECIMALS"))?,
        )?;
        let required_confirmations: u64 = parse_env(
            &format!("{prefix}_REQUIRED_CONFIRMATIONS"),
            &require_env(&format!("{prefix}_REQUIRED_CONFIRMATIONS"))?,
        )?;
        let poll_interval_ms: u64 = optional_env(&format!("{prefix}_POLL_INTERVAL_MS"))
            .map(|raw| parse_env(&format!("{prefix}_POLL_INTERVAL_MS"), &raw))
            .transpose()?
            .unwrap_or(5_000);
        let max_block_range: u64 = optional_env(&format!("{prefix}_MAX_BLOCK_RANGE"))
            .map(|raw| parse_env(&format!("{prefix}_MAX_BLOCK_RANGE"), &raw))
            .transpose()?
            .unwrap_or(defaults::MAX_BLOCK_RANGE);

        let mut sender_allowlist: BTreeSet<Address> = BTreeSet::new();
        if let Some(sender) = global_sender {
            sender_allowlist.insert(sender);
        }

        Ok(Chain {
            id: chain_id.clone(),
            rpc_url,
            token_contract,
            token_decimals,
            required_confirmations,
            poll_interval_ms,
            max_block_range,
            recipient,
            target_amount: global_target_amount,
            sender_allowlist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests must not run concurrently with each other (they share
    // process-global state); a single mutex-guarded test keeps them serialized.
    static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn clear_chain_env(prefix: &str) {
        for suffix in [
            "RPC_URL",
            "TOKEN_CONTRACT",
            "TOKEN_DECIMALS",
            "RECIPIENT",
            "REQUIRED_CONFIRMATIONS",
            "POLL_INTERVAL_MS",
            "MAX_BLOCK_RANGE",
        ] {
            unsafe { std::env::remove_var(format!("{prefix}_{suffix}")) };
        }
    }

    #[test]
    fn loads_a_single_configured_chain() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_chain_env("TESTCHAIN");
        unsafe {
            std::env::set_var("TESTCHAIN_RPC_URL", "http://localhost:8545");
            std::env::set_var(
                "TESTCHAIN_TOKEN_CONTRACT",
                "0x0000000000000000000000000000000000000001",
            );
            std::env::set_var(
                "TESTCHAIN_RECIPIENT",
                "0x0000000000000000000000000000000000000002",
            );
            std::env::set_var("TESTCHAIN_TOKEN_DECIMALS", "18");
            std::env::set_var("TESTCHAIN_REQUIRED_CONFIRMATIONS", "2");
        }

        let args = CliArgs {
            port: 8080,
            host: "0.0.0.0".to_string(),
            active_networks: "TESTCHAIN".to_string(),
            api_key: None,
            target_usdt_amount: None,
            sender_address: None,
            event_bus_queue_capacity: 1024,
            shutdown_flush_deadline_ms: 5000,
            expiry_scan_interval_ms: 30000,
        };
        let config = CoreConfig::from_args(args).unwrap();
        let chain_id = ChainId::from_str("TESTCHAIN").unwrap();
        let chain = config.chains.get(&chain_id).unwrap();
        assert_eq!(chain.token_decimals, 18);
        assert_eq!(chain.required_confirmations, 2);
        assert_eq!(chain.max_block_range, defaults::MAX_BLOCK_RANGE);

        clear_chain_env("TESTCHAIN");
    }

    #[test]
    fn rejects_expiry_interval_above_thirty_seconds() {
        let _guard = ENV_GUARD.lock().unwrap();
        let args = CliArgs {
            port: 8080,
            host: "0.0.0.0".to_string(),
            active_networks: String::new(),
            api_key: None,
            target_usdt_amount: None,
            sender_address: None,
            event_bus_queue_capacity: 1024,
            shutdown_flush_deadline_ms: 5000,
            expiry_scan_interval_ms: 60_000,
        };
        assert!(matches!(
            CoreConfig::from_args(args),
            Err(ConfigError::ExpiryIntervalOutOfRange { .. })
        ));
    }
}
