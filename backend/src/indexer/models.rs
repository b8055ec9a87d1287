use alloy_primitives::{keccak256, Address, B256};
use chrono::{DateTime, Utc};

use crate::indexer::types::{DecodedEvent, EventKind};

/// One points award, uniquely keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PointsLedgerEntry {
    /// Account credited with the points
    pub(crate) address: Address,

    pub(crate) points: i64,

    pub(crate) event_kind: EventKind,

    /// Block containing the source log
    pub(crate) block_number: u64,

    /// Hash of the transaction that emitted the source log
    pub(crate) tx_hash: B256,

    /// Position of the source log within its block
    pub(crate) log_index: u64,

    /// Decoded amount in wei, kept as a decimal string since it may exceed 64 bits
    pub(crate) amount_wei: String,

    /// Contract that emitted the source log
    pub(crate) contract: Address,

    /// keccak-256 of the raw log data, for auditing against the node
    pub(crate) data_hash: B256,

    /// When the points were computed
    pub(crate) computed_at: DateTime<Utc>,
}

impl PointsLedgerEntry {
    pub(crate) fn new(event: &DecodedEvent, points: i64, computed_at: DateTime<Utc>) -> Self {
        Self {
            address: event.account,
            points,
            event_kind: event.kind,
            block_number: event.source.block_number,
            tx_hash: event.source.tx_hash,
            log_index: event.source.log_index,
            amount_wei: event.amount_wei.to_string(),
            contract: event.source.address,
            data_hash: keccak256(&event.source.data),
            computed_at,
        }
    }
}
