use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;
use clap::ValueEnum;
use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;

use crate::indexer::decoder::{Borrow, EventSchema, EventSpec, Mint};
use crate::indexer::types::EventKind;
use crate::utils::retry_policy::ExponentialBackoff;

/// Default database location
const DEFAULT_DATABASE_URL: &str = "sqlite://points.db?mode=rwc";

/// Default checkpoint file
const DEFAULT_CHECKPOINT_PATH: &str = "last_block.txt";

/// Default number of blocks per backfill window
const DEFAULT_BACKFILL_WINDOW_SIZE: u64 = 10;

/// Default fetch attempts per backfill window
const DEFAULT_BACKFILL_MAX_ATTEMPTS: u64 = 3;

/// Default delay between backfill fetch attempts in milliseconds
const DEFAULT_BACKFILL_RETRY_DELAY_MS: u64 = 1_000;

/// Default delay before re-subscribing after a transport error in milliseconds
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Default timeout for a single RPC call in milliseconds
const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

/// Default HTTP server port
const DEFAULT_SERVER_PORT: u16 = 8082;

/// Configuration errors, fatal at startup
#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where ingestion starts when no checkpoint has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartBlock {
    /// A fixed block height
    Number(u64),
    /// The node's head at engine start
    Latest,
}

impl FromStr for StartBlock {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            Ok(StartBlock::Latest)
        } else {
            s.parse().map(StartBlock::Number)
        }
    }
}

/// Which ingestion phases to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum IngestionMode {
    /// Catch up to the head sampled at start, then stop
    Backfill,
    /// Stream new logs only
    Live,
    /// Catch up, then stream
    Full,
}

/// Where the checkpoint is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CheckpointBackend {
    File(PathBuf),
    Sqlite,
}

/// Ingestion configuration
#[derive(Debug, Clone)]
pub(crate) struct IngestionConfig {
    /// JSON-RPC HTTP endpoint of the chain node
    rpc_url: String,

    /// JSON-RPC WebSocket endpoint of the chain node
    ws_url: String,

    /// Contracts whose logs are ingested
    contract_addresses: BTreeSet<Address>,

    /// Mint event signature hash
    mint_signature: B256,

    /// Borrow event signature hash
    borrow_signature: B256,

    /// Points multiplier for Mint events
    mint_multiplier: i64,

    /// Points multiplier for Borrow events
    borrow_multiplier: i64,

    /// Start block when no checkpoint exists
    start_block: StartBlock,

    /// SQLite database URL
    database_url: String,

    /// Checkpoint persistence
    checkpoint_backend: CheckpointBackend,

    /// Blocks per backfill window
    backfill_window_size: u64,

    /// Fetch attempts per backfill window
    backfill_max_attempts: u64,

    /// Delay between backfill fetch attempts
    backfill_retry_delay: Duration,

    /// Delay before re-subscribing
    reconnect_delay: Duration,

    /// Timeout for a single RPC call
    rpc_timeout: Duration,

    /// Phases to run
    mode: IngestionMode,
}

impl IngestionConfig {
    /// Load from the process environment (and `.env` if present).
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup("RPC_URL").ok_or(ConfigError::Missing("RPC_URL"))?;
        let ws_url = lookup("WS_URL").unwrap_or_else(|| derive_ws_url(&rpc_url));

        let contract_addresses = lookup("CONTRACT_ADDRESSES")
            .ok_or(ConfigError::Missing("CONTRACT_ADDRESSES"))?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Address::from_str(s).map_err(|e| invalid("CONTRACT_ADDRESSES", s, e))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        if contract_addresses.is_empty() {
            return Err(ConfigError::Missing("CONTRACT_ADDRESSES"));
        }

        let mint_signature =
            parse_or("MINT_EVENT_SIGNATURE", &lookup, Mint::SIGNATURE_HASH, B256::from_str)?;
        let borrow_signature =
            parse_or("BORROW_EVENT_SIGNATURE", &lookup, Borrow::SIGNATURE_HASH, B256::from_str)?;
        if mint_signature == borrow_signature {
            return Err(invalid(
                "BORROW_EVENT_SIGNATURE",
                &format!("{borrow_signature:#x}"),
                "same signature as MINT_EVENT_SIGNATURE",
            ));
        }

        let mint_multiplier = parse_or("MINT_MULTIPLIER", &lookup, 1, i64::from_str)?;
        let borrow_multiplier = parse_or("BORROW_MULTIPLIER", &lookup, 2, i64::from_str)?;
        let start_block = parse_or("START_BLOCK", &lookup, StartBlock::Latest, StartBlock::from_str)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let checkpoint_backend = match lookup("CHECKPOINT_BACKEND").as_deref() {
            None | Some("file") => CheckpointBackend::File(PathBuf::from(
                lookup("CHECKPOINT_PATH").unwrap_or_else(|| DEFAULT_CHECKPOINT_PATH.to_string()),
            )),
            Some("sqlite") => CheckpointBackend::Sqlite,
            Some(other) => {
                return Err(invalid("CHECKPOINT_BACKEND", other, "expected `file` or `sqlite`"))
            }
        };

        let backfill_window_size =
            parse_or("BACKFILL_WINDOW_SIZE", &lookup, DEFAULT_BACKFILL_WINDOW_SIZE, u64::from_str)?;
        if backfill_window_size == 0 {
            return Err(invalid("BACKFILL_WINDOW_SIZE", "0", "must be at least 1"));
        }
        let backfill_max_attempts =
            parse_or("BACKFILL_MAX_ATTEMPTS", &lookup, DEFAULT_BACKFILL_MAX_ATTEMPTS, u64::from_str)?
                .max(1);
        let backfill_retry_delay = Duration::from_millis(parse_or(
            "BACKFILL_RETRY_DELAY_MS",
            &lookup,
            DEFAULT_BACKFILL_RETRY_DELAY_MS,
            u64::from_str,
        )?);
        let reconnect_delay = Duration::from_millis(parse_or(
            "RECONNECT_DELAY_MS",
            &lookup,
            DEFAULT_RECONNECT_DELAY_MS,
            u64::from_str,
        )?);
        let rpc_timeout = Duration::from_millis(parse_or(
            "RPC_TIMEOUT_MS",
            &lookup,
            DEFAULT_RPC_TIMEOUT_MS,
            u64::from_str,
        )?);

        let mode = match lookup("INGESTION_MODE") {
            Some(s) => IngestionMode::from_str(&s, true)
                .map_err(|e| invalid("INGESTION_MODE", &s, e))?,
            None => IngestionMode::Full,
        };

        info!(
            %rpc_url,
            %ws_url,
            ?contract_addresses,
            ?start_block,
            ?checkpoint_backend,
            ?mode,
            "Loaded ingestion config:"
        );

        Ok(IngestionConfig {
            rpc_url,
            ws_url,
            contract_addresses,
            mint_signature,
            borrow_signature,
            mint_multiplier,
            borrow_multiplier,
            start_block,
            database_url,
            checkpoint_backend,
            backfill_window_size,
            backfill_max_attempts,
            backfill_retry_delay,
            reconnect_delay,
            rpc_timeout,
            mode,
        })
    }

    /// Signature table for the decoder.
    pub(crate) fn event_schema(&self) -> EventSchema {
        EventSchema::new([
            (
                self.mint_signature,
                EventSpec {
                    kind: EventKind::Mint,
                    multiplier: self.mint_multiplier,
                },
            ),
            (
                self.borrow_signature,
                EventSpec {
                    kind: EventKind::Borrow,
                    multiplier: self.borrow_multiplier,
                },
            ),
        ])
    }

    /// Retry policy for one backfill window fetch.
    pub(crate) fn window_retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::fixed(self.backfill_max_attempts, self.backfill_retry_delay)
    }

    /// Override the configured mode (e.g. from the command line).
    pub(crate) fn set_mode(&mut self, mode: IngestionMode) {
        self.mode = mode;
    }

    /// Getter for `rpc_url`
    pub(crate) fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Getter for `ws_url`
    pub(crate) fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Getter for `contract_addresses`
    pub(crate) fn contract_addresses(&self) -> &BTreeSet<Address> {
        &self.contract_addresses
    }

    /// Getter for `start_block`
    pub(crate) fn start_block(&self) -> StartBlock {
        self.start_block
    }

    /// Getter for `database_url`
    pub(crate) fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Getter for `checkpoint_backend`
    pub(crate) fn checkpoint_backend(&self) -> &CheckpointBackend {
        &self.checkpoint_backend
    }

    /// Getter for `backfill_window_size`
    pub(crate) fn backfill_window_size(&self) -> u64 {
        self.backfill_window_size
    }

    /// Getter for `reconnect_delay`
    pub(crate) fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Getter for `rpc_timeout`
    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Getter for `mode`
    pub(crate) fn mode(&self) -> IngestionMode {
        self.mode
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub(crate) struct ServerConfig {
    /// Port the query API listens on
    port: u16,
}

impl ServerConfig {
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        let port = parse_or(
            "SERVER_PORT",
            &|key: &str| std::env::var(key).ok(),
            DEFAULT_SERVER_PORT,
            u16::from_str,
        )?;
        Ok(ServerConfig { port })
    }

    /// Getter for `port`
    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

fn parse_or<T, E, F, P>(key: &'static str, lookup: &F, default: T, parse: P) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse(raw.trim()).map_err(|e| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// `http(s)://host` → `ws(s)://host`
fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        rpc_url.to_string()
    }
}
