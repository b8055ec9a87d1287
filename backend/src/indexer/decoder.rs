//! Turns raw logs into points-bearing events.
//!
//! Amounts are decoded with the event's ABI layout first. When that fails the
//! first 32-byte word of the data segment is read as a big-endian `uint256`,
//! which is where the ABI places the first non-indexed numeric parameter.

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{sol, SolEvent};
use std::collections::HashMap;

use crate::indexer::types::{DecodedEvent, EventKind, RawLogRecord};

sol! {
    /// Supply-side event: `account` deposited `amount` wei.
    event Mint(address indexed account, uint256 amount);

    /// Debt-side event: `account` borrowed `amount` wei.
    event Borrow(address indexed account, uint256 amount);
}

/// Size of one ABI word
const WORD_SIZE: usize = 32;

/// Kind and multiplier attached to a signature hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EventSpec {
    pub(crate) kind: EventKind,
    pub(crate) multiplier: i64,
}

/// Signature hash → event spec table, built once from configuration.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSchema {
    entries: HashMap<B256, EventSpec>,
}

impl EventSchema {
    pub(crate) fn new(entries: impl IntoIterator<Item = (B256, EventSpec)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub(crate) fn lookup(&self, signature: &B256) -> Option<&EventSpec> {
        self.entries.get(signature)
    }

    /// All signature hashes the schema recognises.
    pub(crate) fn signatures(&self) -> impl Iterator<Item = &B256> {
        self.entries.keys()
    }
}

/// Why a log produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    NoTopics,
    UnknownSignature,
    DataTooShort,
    ZeroAmount,
}

/// Outcome of decoding one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    Event(DecodedEvent),
    Skip(SkipReason),
}

/// Decodes `raw` against `schema`.
pub(crate) fn decode(raw: RawLogRecord, schema: &EventSchema) -> Decoded {
    let Some(signature) = raw.topics.first() else {
        return Decoded::Skip(SkipReason::NoTopics);
    };
    let Some(spec) = schema.lookup(signature).copied() else {
        return Decoded::Skip(SkipReason::UnknownSignature);
    };

    let Some(amount_wei) = decode_amount(spec.kind, &raw.data).or_else(|| raw_word_amount(&raw.data))
    else {
        return Decoded::Skip(SkipReason::DataTooShort);
    };
    if amount_wei.is_zero() {
        return Decoded::Skip(SkipReason::ZeroAmount);
    }

    // Indexed account parameter when present, the emitting contract otherwise.
    let account = raw
        .topics
        .get(1)
        .map(|topic| Address::from_word(*topic))
        .unwrap_or(raw.address);

    Decoded::Event(DecodedEvent {
        kind: spec.kind,
        account,
        amount_wei,
        points_multiplier: spec.multiplier,
        source: raw,
    })
}

/// Schema-driven decode of the non-indexed data tuple.
fn decode_amount(kind: EventKind, data: &[u8]) -> Option<U256> {
    match kind {
        EventKind::Mint => Mint::abi_decode_data(data, true).ok().map(|(amount,)| amount),
        EventKind::Borrow => Borrow::abi_decode_data(data, true).ok().map(|(amount,)| amount),
    }
}

/// First data word as a big-endian unsigned integer.
fn raw_word_amount(data: &[u8]) -> Option<U256> {
    data.get(..WORD_SIZE).map(U256::from_be_slice)
}
