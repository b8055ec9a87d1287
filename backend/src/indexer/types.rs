use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteTypeInfo, Encode, Sqlite, Type};
use std::{collections::BTreeSet, fmt::Display, ops::Deref};

/// An Ethereum log entry as returned by `eth_getLogs` or pushed by `eth_subscribe("logs")`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub(crate) struct RawLogRecord {
    /// The emitting contract address
    #[serde(deserialize_with = "from_hex_address")]
    pub(crate) address: Address,

    /// Indexed event parameters; `topics[0]` is the event signature hash
    #[serde(deserialize_with = "from_hex_b256_vec")]
    pub(crate) topics: Vec<B256>,

    /// ABI-encoded non-indexed event parameters
    #[serde(deserialize_with = "from_hex_bytes")]
    pub(crate) data: Bytes,

    /// Block number containing the log
    #[serde(rename = "blockNumber", deserialize_with = "from_hex_u64")]
    pub(crate) block_number: u64,

    /// Hash of the emitting transaction
    #[serde(rename = "transactionHash", deserialize_with = "from_hex_b256")]
    pub(crate) tx_hash: B256,

    /// Position of the log within its block
    #[serde(rename = "logIndex", deserialize_with = "from_hex_u64")]
    pub(crate) log_index: u64,

    /// Set by the node when the log was dropped by a reorg
    #[serde(default)]
    pub(crate) removed: bool,
}

pub(crate) fn from_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str: String = Deserialize::deserialize(deserializer)?;
    parse_hex_u64(&hex_str).map_err(D::Error::custom)
}

/// Parses a `0x`-prefixed hex quantity.
pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn from_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let hex: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex.trim_start_matches("0x"))
        .map_err(|e| D::Error::custom(format!("invalid hex: {e}")))?;
    Address::try_from(bytes.as_slice())
        .map_err(|e| D::Error::custom(format!("invalid address: {e}")))
}

/// Parses a hex string into `B256`
fn from_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let hex: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex.trim_start_matches("0x"))
        .map_err(|e| D::Error::custom(format!("invalid hex: {e}")))?;
    B256::try_from(bytes.as_slice())
        .map_err(|_| D::Error::custom(format!("expected 32 bytes, got {}", bytes.len())))
}

fn from_hex_bytes<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let hex: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex.trim_start_matches("0x"))
        .map_err(|e| D::Error::custom(format!("invalid hex: {e}")))?;
    Ok(Bytes::from(bytes))
}

fn from_hex_b256_vec<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_vec: Vec<String> = Deserialize::deserialize(deserializer)?;
    hex_vec
        .into_iter()
        .map(|s| from_hex_b256(serde::de::IntoDeserializer::into_deserializer(s)))
        .collect()
}

/// Address and topic filter for one scan or subscribe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogFilter {
    pub(crate) contract_addresses: BTreeSet<Address>,
    pub(crate) topic_signatures: BTreeSet<B256>,
    pub(crate) from_block: u64,
    pub(crate) to_block: Option<u64>,
}

impl LogFilter {
    pub(crate) fn new(
        contract_addresses: BTreeSet<Address>,
        topic_signatures: BTreeSet<B256>,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Self {
        Self {
            contract_addresses,
            topic_signatures,
            from_block,
            to_block,
        }
    }

    /// Filter object for `eth_subscribe("logs", ...)`, which takes no block range.
    pub(crate) fn subscription_params(&self) -> Value {
        let addresses: Vec<String> = self
            .contract_addresses
            .iter()
            .map(|a| format!("{a:#x}"))
            .collect();
        let signatures: Vec<String> = self
            .topic_signatures
            .iter()
            .map(|t| format!("{t:#x}"))
            .collect();

        json!({
            "address": addresses,
            "topics": [signatures],
        })
    }

    /// Filter object for `eth_getLogs`.
    pub(crate) fn range_params(&self) -> Value {
        let mut params = self.subscription_params();
        params["fromBlock"] = json!(format!("{:#x}", self.from_block));
        params["toBlock"] = match self.to_block {
            Some(to) => json!(format!("{to:#x}")),
            None => json!("latest"),
        };
        params
    }

    /// Copy of this filter restricted to `[from, to]`.
    pub(crate) fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block: Some(to_block),
            ..self.clone()
        }
    }
}

/// Kind of points-bearing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EventKind {
    Mint,
    Borrow,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Mint => "Mint",
            EventKind::Borrow => "Borrow",
        };
        write!(f, "{}", s)
    }
}

/// A points-bearing event extracted from a [`RawLogRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DecodedEvent {
    pub(crate) kind: EventKind,
    /// Account credited with the points
    pub(crate) account: Address,
    pub(crate) amount_wei: U256,
    pub(crate) points_multiplier: i64,
    pub(crate) source: RawLogRecord,
}

/// Transaction hash stored as a 32-byte BLOB in SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbTxHash(Vec<u8>);

impl From<B256> for DbTxHash {
    fn from(hash: B256) -> Self {
        Self(hash.to_vec())
    }
}

/// ───── Block number ────────────────────────────────────────────────────
/// SQLite's INTEGER is signed i64, so wrap that.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbBlockNumber(i64);

impl Deref for DbBlockNumber {
    type Target = i64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for DbBlockNumber {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        i64::try_from(value).map(Self)
    }
}

impl TryFrom<DbBlockNumber> for u64 {
    type Error = std::num::TryFromIntError;

    fn try_from(value: DbBlockNumber) -> Result<Self, Self::Error> {
        u64::try_from(value.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum IndexerTaskId {
    PointsIngestion,
}

impl Display for IndexerTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexerTaskId::PointsIngestion => "points_ingestion",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DbTaskId(pub(crate) IndexerTaskId);

impl From<IndexerTaskId> for DbTaskId {
    fn from(task_id: IndexerTaskId) -> Self {
        DbTaskId(task_id)
    }
}

impl Type<Sqlite> for DbTaskId {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'q> Encode<'q, Sqlite> for DbTaskId {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Encode::<Sqlite>::encode_by_ref(&self.0.to_string(), buf)
    }
}

/// Timestamp of a ledger or checkpoint write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbTimestamp(DateTime<Utc>);

impl From<DateTime<Utc>> for DbTimestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}
