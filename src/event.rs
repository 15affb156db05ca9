//! The typed event that handlers are dispatched with, and that the Pattern
//! Matcher reads fields from.
//!
//! The event decoder that produces these values is an external collaborator
//! (see the crate-level docs); this module only defines the shape both the
//! cache and the pattern matcher agree on.

use crate::common::ChainId;
use serde_json::Value as JsonValue;

/// One on-chain occurrence dispatched to a handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub chain_id: ChainId,
    /// Deterministic checkpoint identifying this event's position in the
    /// stream; used for crash recovery and commit-boundary bookkeeping.
    pub checkpoint: String,
    /// The handler name this event is routed to; the unit of the pattern
    /// matcher's per-event-name LRU and sampling counters.
    pub name: String,
    pub variant: EventVariant,
    /// Named call arguments, when the triggering log/trace decodes to an
    /// object; arrays and nested objects are not addressable by the pattern
    /// matcher (see `pattern::FieldAccessor::Arg`).
    pub args: Option<JsonValue>,
    /// Named return values from a simulated/decoded call result, same
    /// addressability rule as `args`.
    pub result: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub enum EventVariant {
    Block(BlockData),
    Transaction(TransactionData),
    Log(LogData),
    Trace(TraceData),
    Transfer(TransferData),
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub hash: String,
    pub number: u64,
    pub timestamp: u64,
    pub miner: String,
}

#[derive(Debug, Clone)]
pub struct ReceiptData {
    pub contract_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionData {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub transaction_index: u64,
    /// A transaction event may carry its receipt; absent when the handler
    /// fires ahead of receipt availability.
    pub receipt: Option<ReceiptData>,
}

#[derive(Debug, Clone)]
pub struct LogData {
    pub address: String,
    pub log_index: u64,
}

#[derive(Debug, Clone)]
pub struct TraceData {
    pub from: String,
    pub to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferData {
    pub from: String,
    pub to: String,
}
