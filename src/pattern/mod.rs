//! Pattern Matcher: discovers whether a request's address/arguments are
//! constants, or derive deterministically from fields of the triggering
//! event, and emits a reusable pattern.
//!
//! Field accessors are modeled as a tagged enum (`FieldAccessor`) rather
//! than strings evaluated at runtime, per the design notes: this makes
//! patterns comparable by value and keeps the LRU's keys cheap to hash.
//! Grounded on the teacher's `common::bounded_map::BoundedHashMap` for the
//! constant-pattern LRU, and on `cache::query_cache`'s key/entry split for
//! the overall cache-of-learned-facts shape.

use crate::common::bounded_map::BoundedHashMap;
use crate::common::Value;
use crate::error::{CacheError, Result};
use crate::event::{Event, EventVariant};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A timestamp bucketing transform, applied to `block.timestamp` before
/// comparison — used to recognize rolling time-bucket keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampBucket {
    None,
    Sixty,
    ThreeThousandSixHundred,
    EightySixThousandFour,
}

impl TimestampBucket {
    fn apply(self, timestamp: u64) -> u64 {
        match self {
            TimestampBucket::None => timestamp,
            TimestampBucket::Sixty => timestamp / 60,
            TimestampBucket::ThreeThousandSixHundred => timestamp / 3600,
            TimestampBucket::EightySixThousandFour => timestamp / 86_400,
        }
    }
}

/// A single event-relative field access. Covers every path enumerated in
/// the component design: chain id, event id, the block/transaction/
/// receipt/log/trace/transfer variant fields, and named scalar entries of
/// `args`/`result`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldAccessor {
    ChainId,
    EventId,
    BlockHash,
    BlockNumber,
    BlockTimestamp(TimestampBucket),
    BlockMiner,
    TransactionHash,
    TransactionFrom,
    TransactionTo,
    TransactionIndex,
    ReceiptContractAddress,
    LogAddress,
    LogIndex,
    TraceFrom,
    TraceTo,
    TransferFrom,
    TransferTo,
    /// A named, scalar (non-array, non-object) entry of `event.args`.
    Arg(String),
    /// A named, scalar entry of `event.result`.
    Result(String),
}

fn json_scalar_to_value(json: &JsonValue) -> Option<Value> {
    match json {
        JsonValue::Null => Some(Value::Null),
        JsonValue::Bool(b) => Some(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else {
                n.as_f64().map(Value::Float)
            }
        }
        JsonValue::String(s) => Some(Value::Text(s.clone())),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

fn named_scalar_entries(object: &Option<JsonValue>) -> Vec<(String, Value)> {
    let Some(JsonValue::Object(map)) = object else { return Vec::new() };
    map.iter().filter_map(|(k, v)| json_scalar_to_value(v).map(|v| (k.clone(), v))).collect()
}

impl FieldAccessor {
    /// Resolves this accessor against an event, returning `None` when the
    /// event's variant doesn't carry the requested field.
    pub fn resolve(&self, event: &Event) -> Option<Value> {
        match self {
            FieldAccessor::ChainId => Some(Value::Int(event.chain_id as i64)),
            FieldAccessor::EventId => Some(Value::Text(event.checkpoint.clone())),
            FieldAccessor::BlockHash => block(event).map(|b| Value::Text(b.hash.clone())),
            FieldAccessor::BlockNumber => block(event).map(|b| Value::Int(b.number as i64)),
            FieldAccessor::BlockTimestamp(bucket) => {
                block(event).map(|b| Value::Int(bucket.apply(b.timestamp) as i64))
            }
            FieldAccessor::BlockMiner => block(event).map(|b| Value::Text(b.miner.clone())),
            FieldAccessor::TransactionHash => transaction(event).map(|t| Value::Text(t.hash.clone())),
            FieldAccessor::TransactionFrom => transaction(event).map(|t| Value::Text(t.from.clone())),
            FieldAccessor::TransactionTo => {
                transaction(event).and_then(|t| t.to.clone()).map(Value::Text)
            }
            FieldAccessor::TransactionIndex => {
                transaction(event).map(|t| Value::Int(t.transaction_index as i64))
            }
            FieldAccessor::ReceiptContractAddress => transaction(event)
                .and_then(|t| t.receipt.as_ref())
                .and_then(|r| r.contract_address.clone())
                .map(Value::Text),
            FieldAccessor::LogAddress => log(event).map(|l| Value::Text(l.address.clone())),
            FieldAccessor::LogIndex => log(event).map(|l| Value::Int(l.log_index as i64)),
            FieldAccessor::TraceFrom => trace(event).map(|t| Value::Text(t.from.clone())),
            FieldAccessor::TraceTo => trace(event).and_then(|t| t.to.clone()).map(Value::Text),
            FieldAccessor::TransferFrom => transfer(event).map(|t| Value::Text(t.from.clone())),
            FieldAccessor::TransferTo => transfer(event).map(|t| Value::Text(t.to.clone())),
            FieldAccessor::Arg(name) => named_scalar_entries(&event.args)
                .into_iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v),
            FieldAccessor::Result(name) => named_scalar_entries(&event.result)
                .into_iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v),
        }
    }
}

fn block(event: &Event) -> Option<&crate::event::BlockData> {
    match &event.variant {
        EventVariant::Block(b) => Some(b),
        _ => None,
    }
}

fn transaction(event: &Event) -> Option<&crate::event::TransactionData> {
    match &event.variant {
        EventVariant::Transaction(t) => Some(t),
        _ => None,
    }
}

fn log(event: &Event) -> Option<&crate::event::LogData> {
    match &event.variant {
        EventVariant::Log(l) => Some(l),
        _ => None,
    }
}

fn trace(event: &Event) -> Option<&crate::event::TraceData> {
    match &event.variant {
        EventVariant::Trace(t) => Some(t),
        _ => None,
    }
}

fn transfer(event: &Event) -> Option<&crate::event::TransferData> {
    match &event.variant {
        EventVariant::Transfer(t) => Some(t),
        _ => None,
    }
}

/// Accessors tried in priority order, per §4.3: chain id, event id, then
/// variant-specific fields for whichever variant this event carries, then
/// named scalar entries of `args` and `result`.
fn ordered_candidates(event: &Event) -> Vec<FieldAccessor> {
    use FieldAccessor::*;
    let mut out = vec![ChainId, EventId];
    match &event.variant {
        EventVariant::Block(_) => {
            out.extend([
                BlockHash,
                BlockNumber,
                BlockTimestamp(TimestampBucket::None),
                BlockTimestamp(TimestampBucket::Sixty),
                BlockTimestamp(TimestampBucket::ThreeThousandSixHundred),
                BlockTimestamp(TimestampBucket::EightySixThousandFour),
                BlockMiner,
            ]);
        }
        EventVariant::Transaction(_) => {
            out.extend([TransactionHash, TransactionFrom, TransactionTo, TransactionIndex, ReceiptContractAddress]);
        }
        EventVariant::Log(_) => out.extend([LogAddress, LogIndex]),
        EventVariant::Trace(_) => out.extend([TraceFrom, TraceTo]),
        EventVariant::Transfer(_) => out.extend([TransferFrom, TransferTo]),
    }
    out.extend(named_scalar_entries(&event.args).into_iter().map(|(k, _)| FieldAccessor::Arg(k)));
    out.extend(named_scalar_entries(&event.result).into_iter().map(|(k, _)| FieldAccessor::Result(k)));
    out
}

/// Renders a value in the same textual form used for cache-key comparison,
/// restricted to the scalar kinds that realistically appear as contract
/// addresses, call arguments, or table keys.
fn loose_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(b) => b.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => format!("0x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        Value::Enum(s) => s.clone(),
        Value::Timestamp(t) => t.to_rfc3339(),
        other => format!("{other:?}"),
    }
}

/// Delimiters tried, in order, when recognizing a delimited concatenation
/// of field values — this exact order is preserved per the design notes'
/// open question rather than re-derived.
const CONCAT_DELIMITERS: [char; 5] = ['-', '_', ':', '#', '$'];

fn match_single(value: &Value, candidates: &[FieldAccessor], event: &Event) -> Option<FieldAccessor> {
    let text = loose_text(value);
    candidates.iter().find(|c| c.resolve(event).map(|v| loose_text(&v)) == Some(text.clone())).cloned()
}

fn match_concat(value: &Value, candidates: &[FieldAccessor], event: &Event) -> Option<(Vec<FieldAccessor>, char)> {
    let Value::Text(text) = value else { return None };
    for delim in CONCAT_DELIMITERS {
        let parts: Vec<&str> = text.split(delim).collect();
        if parts.len() < 2 {
            continue;
        }
        let mut accessors = Vec::with_capacity(parts.len());
        let mut all_matched = true;
        for part in &parts {
            match match_single(&Value::Text((*part).to_string()), candidates, event) {
                Some(acc) => accessors.push(acc),
                None => {
                    all_matched = false;
                    break;
                }
            }
        }
        if all_matched {
            return Some((accessors, delim));
        }
    }
    None
}

/// A pattern atom: a fixed constant, a single derived field, or a
/// delimited concatenation of several derived fields.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternAtom {
    Constant(Value),
    Derived(FieldAccessor),
    Concat(Vec<FieldAccessor>, char),
}

impl PatternAtom {
    fn is_constant(&self) -> bool {
        matches!(self, PatternAtom::Constant(_))
    }

    fn resolve(&self, event: &Event) -> Result<Value> {
        match self {
            PatternAtom::Constant(v) => Ok(v.clone()),
            PatternAtom::Derived(accessor) => accessor.resolve(event).ok_or_else(|| {
                CacheError::Internal(format!("pattern accessor {accessor:?} has no value on this event"))
            }),
            PatternAtom::Concat(accessors, delim) => {
                let mut parts = Vec::with_capacity(accessors.len());
                for accessor in accessors {
                    let v = accessor.resolve(event).ok_or_else(|| {
                        CacheError::Internal(format!("pattern accessor {accessor:?} has no value on this event"))
                    })?;
                    parts.push(loose_text(&v));
                }
                Ok(Value::Text(parts.join(&delim.to_string())))
            }
        }
    }
}

fn match_atom(value: &Value, candidates: &[FieldAccessor], event: &Event) -> PatternAtom {
    if let Some(accessor) = match_single(value, candidates, event) {
        return PatternAtom::Derived(accessor);
    }
    if let Some((accessors, delim)) = match_concat(value, candidates, event) {
        return PatternAtom::Concat(accessors, delim);
    }
    PatternAtom::Constant(value.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Immutable,
}

/// A request to be recovered from a pattern: either a contract call
/// (`address` is the callee, `args` the call arguments) or a table lookup
/// (`address` holds the table name, `args` the primary-key column values),
/// per §4.3's note that the Prefetch Controller reuses the same machinery
/// for row-access patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// `"<event-name>::<function>"` for an RPC pattern, or
    /// `"<event-name>::table:<table>"` for a row-access pattern.
    pub target: String,
    pub address: Value,
    pub args: Vec<Value>,
    pub function_name: String,
    pub abi_fingerprint: String,
    pub cache_mode: Option<CacheMode>,
}

/// A reusable, learned template relating an event to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub target: String,
    pub address: PatternAtom,
    pub args: Vec<PatternAtom>,
    pub function_name: String,
    pub abi_fingerprint: String,
    pub cache_mode: Option<CacheMode>,
    pub hit_count: u64,
}

impl Pattern {
    fn has_constant_atom(&self) -> bool {
        self.address.is_constant() || self.args.iter().any(|a| a.is_constant())
    }
}

/// Substitutes a pattern's atoms against an event, reconstructing the call
/// it predicts.
pub fn recover(pattern: &Pattern, event: &Event) -> Result<Call> {
    Ok(Call {
        target: pattern.target.clone(),
        address: pattern.address.resolve(event)?,
        args: pattern.args.iter().map(|a| a.resolve(event)).collect::<Result<Vec<_>>>()?,
        function_name: pattern.function_name.clone(),
        abi_fingerprint: pattern.abi_fingerprint.clone(),
        cache_mode: pattern.cache_mode,
    })
}

fn calls_key_equal(a: &Call, b: &Call) -> bool {
    loose_text(&a.address) == loose_text(&b.address)
        && a.args.len() == b.args.len()
        && a.args.iter().zip(b.args.iter()).all(|(x, y)| loose_text(x) == loose_text(y))
}

/// Learns and recovers patterns, generic over what is being predicted — a
/// contract call or a table-access key — per the target string's
/// namespace. Holds one LRU of constant-bearing patterns per event name
/// (bounded, since a handler may call varying fixed addresses) and an
/// unbounded map of fully-derived patterns (reusable across events by
/// construction, so no eviction pressure).
pub struct PatternMatcher {
    sampling_rate: u64,
    max_constant_pattern_count: usize,
    derived: HashMap<String, HashMap<String, Pattern>>,
    constants: HashMap<String, BoundedHashMap<String, Pattern>>,
    events_seen: HashMap<String, u64>,
}

impl PatternMatcher {
    pub fn new(sampling_rate: u64, max_constant_pattern_count: usize) -> Self {
        Self {
            sampling_rate: sampling_rate.max(1),
            max_constant_pattern_count,
            derived: HashMap::new(),
            constants: HashMap::new(),
            events_seen: HashMap::new(),
        }
    }

    fn find_hint(&mut self, event: &Event, call: &Call) -> Option<Pattern> {
        if let Some(p) = self.derived.get(&event.name).and_then(|m| m.get(&call.target)) {
            if let Ok(reconstructed) = recover(p, event) {
                if calls_key_equal(&reconstructed, call) {
                    return Some(p.clone());
                }
            }
        }
        if let Some(m) = self.constants.get_mut(&event.name) {
            if let Some(p) = m.get(&call.target) {
                if let Ok(reconstructed) = recover(p, event) {
                    if calls_key_equal(&reconstructed, call) {
                        return Some(p.clone());
                    }
                }
            }
        }
        None
    }

    fn bump_hit_count(&mut self, event_name: &str, target: &str) {
        if let Some(p) = self.derived.get_mut(event_name).and_then(|m| m.get_mut(target)) {
            p.hit_count += 1;
            return;
        }
        if let Some(m) = self.constants.get_mut(event_name) {
            if let Some(p) = m.get(&target.to_string()) {
                let mut updated = p.clone();
                updated.hit_count += 1;
                m.insert(target.to_string(), updated);
            }
        }
    }

    fn store(&mut self, event_name: &str, pattern: Pattern) {
        if pattern.has_constant_atom() {
            self.constants
                .entry(event_name.to_string())
                .or_insert_with(|| BoundedHashMap::new(self.max_constant_pattern_count))
                .insert(pattern.target.clone(), pattern);
        } else {
            self.derived.entry(event_name.to_string()).or_default().insert(pattern.target.clone(), pattern);
        }
    }

    /// Attempts to recognize `call` as an instance of a known or newly
    /// derivable pattern for `event`. Pattern bookkeeping (new-pattern
    /// learning, hit-count updates) only happens on a 1-in-`sampling_rate`
    /// sample of invocations per event name, to amortize recording cost;
    /// hint matching against already-learned patterns always runs since it
    /// is cheap and every invocation should benefit from a hit if one
    /// exists.
    pub fn record(&mut self, event: &Event, call: &Call) -> Option<Pattern> {
        let seen = self.events_seen.entry(event.name.clone()).or_insert(0);
        *seen += 1;
        let sampled = *seen % self.sampling_rate == 0;

        if let Some(hint) = self.find_hint(event, call) {
            if sampled {
                self.bump_hit_count(&event.name, &call.target);
            }
            return Some(hint);
        }

        if !sampled {
            return None;
        }

        let candidates = ordered_candidates(event);
        let address = match_atom(&call.address, &candidates, event);
        let args = call.args.iter().map(|a| match_atom(a, &candidates, event)).collect();
        let pattern = Pattern {
            target: call.target.clone(),
            address,
            args,
            function_name: call.function_name.clone(),
            abi_fingerprint: call.abi_fingerprint.clone(),
            cache_mode: call.cache_mode,
            hit_count: 0,
        };
        self.store(&event.name, pattern.clone());
        Some(pattern)
    }

    /// All patterns currently known for `event_name`, used by the prefetch
    /// controller to recover predicted calls ahead of dispatch.
    pub fn patterns_for(&self, event_name: &str) -> Vec<Pattern> {
        let mut out: Vec<Pattern> = self.derived.get(event_name).map(|m| m.values().cloned().collect()).unwrap_or_default();
        if let Some(m) = self.constants.get(event_name) {
            out.extend(m.iter().map(|(_, p)| p.clone()));
        }
        out
    }

    /// `(hit_count × sampling_rate) / events_seen_for_this_event_name`, the
    /// expected-value estimate the Prefetch Controller uses to decide
    /// whether to prefetch a recovered call.
    pub fn expected_value(&self, event_name: &str, pattern: &Pattern) -> f64 {
        let seen = *self.events_seen.get(event_name).unwrap_or(&0);
        if seen == 0 {
            0.0
        } else {
            (pattern.hit_count as f64 * self.sampling_rate as f64) / seen as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BlockData, EventVariant, TransferData};

    fn transfer_event(name: &str, checkpoint: &str, from: &str, to: &str) -> Event {
        Event {
            chain_id: 1,
            checkpoint: checkpoint.to_string(),
            name: name.to_string(),
            variant: EventVariant::Transfer(TransferData { from: from.to_string(), to: to.to_string() }),
            args: None,
            result: None,
        }
    }

    fn balance_of_call(address: &str) -> Call {
        Call {
            target: "Transfer::balanceOf".to_string(),
            address: Value::Text(address.to_string()),
            args: vec![],
            function_name: "balanceOf".to_string(),
            abi_fingerprint: "balanceOf(address)".to_string(),
            cache_mode: None,
        }
    }

    #[test]
    fn derives_pattern_from_transfer_to_field() {
        let mut matcher = PatternMatcher::new(1, 10);
        let event = transfer_event("Transfer", "1-0", "alice", "bob");
        let call = Call {
            target: "Transfer::table:account".to_string(),
            address: Value::Text("account".to_string()),
            args: vec![Value::Text("bob".to_string())],
            function_name: String::new(),
            abi_fingerprint: String::new(),
            cache_mode: None,
        };
        let pattern = matcher.record(&event, &call).unwrap();
        assert_eq!(pattern.args[0], PatternAtom::Derived(FieldAccessor::TransferTo));

        let event2 = transfer_event("Transfer", "2-0", "carol", "dave");
        let recovered = recover(&pattern, &event2).unwrap();
        assert_eq!(recovered.args[0], Value::Text("dave".to_string()));
    }

    #[test]
    fn falls_back_to_constant_when_no_field_matches() {
        let mut matcher = PatternMatcher::new(1, 10);
        let event = transfer_event("Transfer", "1-0", "alice", "bob");
        let call = balance_of_call("0xFeeCollector");
        let pattern = matcher.record(&event, &call).unwrap();
        assert_eq!(pattern.address, PatternAtom::Constant(Value::Text("0xFeeCollector".to_string())));
    }

    #[test]
    fn recover_round_trips_up_to_abi_fingerprint() {
        let mut matcher = PatternMatcher::new(1, 10);
        let event = transfer_event("Transfer", "1-0", "alice", "bob");
        let call = Call {
            target: "Transfer::table:account".to_string(),
            address: Value::Text("account".to_string()),
            args: vec![Value::Text("bob".to_string()), Value::Text("alice-bob".to_string())],
            function_name: String::new(),
            abi_fingerprint: "x".to_string(),
            cache_mode: None,
        };
        let pattern = matcher.record(&event, &call).unwrap();
        let recovered = recover(&pattern, &event).unwrap();
        assert_eq!(recovered.address, call.address);
        assert_eq!(recovered.args, call.args);
    }

    #[test]
    fn sampling_gates_new_pattern_learning() {
        let mut matcher = PatternMatcher::new(3, 10);
        let call = balance_of_call("0xabc");
        let e1 = transfer_event("Transfer", "1-0", "a", "b");
        let e2 = transfer_event("Transfer", "2-0", "a", "b");
        assert!(matcher.record(&e1, &call).is_none());
        assert!(matcher.record(&e2, &call).is_none());
        let e3 = transfer_event("Transfer", "3-0", "a", "b");
        assert!(matcher.record(&e3, &call).is_some());
    }

    #[test]
    fn constant_pattern_lru_evicts_oldest_per_event_name() {
        let mut matcher = PatternMatcher::new(1, 2);
        let event = transfer_event("Transfer", "1-0", "a", "b");
        for i in 0..3 {
            let call = Call {
                target: format!("Transfer::fn{i}"),
                address: Value::Text(format!("0xconst{i}")),
                args: vec![],
                function_name: format!("fn{i}"),
                abi_fingerprint: String::new(),
                cache_mode: None,
            };
            matcher.record(&event, &call);
        }
        let patterns = matcher.patterns_for("Transfer");
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn block_timestamp_bucket_is_matched() {
        let mut matcher = PatternMatcher::new(1, 10);
        let event = Event {
            chain_id: 1,
            checkpoint: "1-0".to_string(),
            name: "BlockTick".to_string(),
            variant: EventVariant::Block(BlockData { hash: "0xb".to_string(), number: 100, timestamp: 3660, miner: "0xm".to_string() }),
            args: None,
            result: None,
        };
        let call = Call {
            target: "BlockTick::table:hourly".to_string(),
            address: Value::Text("hourly".to_string()),
            args: vec![Value::Int(1)],
            function_name: String::new(),
            abi_fingerprint: String::new(),
            cache_mode: None,
        };
        let pattern = matcher.record(&event, &call).unwrap();
        assert_eq!(pattern.args[0], PatternAtom::Derived(FieldAccessor::BlockTimestamp(TimestampBucket::ThreeThousandSixHundred)));
    }
}
