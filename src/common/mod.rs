//! Shared value and identifier types used across the cache, codec, pattern
//! matcher and store modules.
//!
//! Values are represented as a closed, typed enum rather than a
//! string-keyed document, matching the one-value-per-logical-column-type
//! mapping in the table descriptor. Rows are positional (`Row`, a
//! `Vec<Value>` indexed by a table's column order) rather than string-keyed
//! maps, so hot paths (cache key construction, byte estimation, flush
//! encoding) never pay for a hash lookup per column.

pub mod bounded_map;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Identifies a table by name; tables are looked up by name rather than a
/// numeric id since the schema is supplied by the caller (the schema DSL is
/// an external collaborator, not owned by this crate).
pub type TableName = String;

/// A chain identifier, as used to partition the RPC cache.
pub type ChainId = u64;

/// A 2D point, stored as (x, y).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An ordered sequence of points.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Line(pub Vec<Point>);

/// A typed domain value. Every column in a table descriptor accepts values
/// of exactly one `Value` variant (plus `Null` when the column is nullable).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision integer; used for columns whose domain exceeds
    /// 64 bits (chain amounts, token balances, etc.).
    BigInt(BigInt),
    Float(f64),
    Text(String),
    /// Hex/byte-string columns; rendered as `0x`-prefixed hex in textual
    /// contexts, stored here as raw bytes.
    Bytes(Vec<u8>),
    Json(JsonValue),
    Enum(String),
    Timestamp(DateTime<Utc>),
    Point(Point),
    Line(Line),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Enum(_) => "enum",
            Value::Timestamp(_) => "timestamp",
            Value::Point(_) => "point",
            Value::Line(_) => "line",
            Value::Array(_) => "array",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Point(a), Value::Point(b)) => a.x.to_bits() == b.x.to_bits() && a.y.to_bits() == b.y.to_bits(),
            (Value::Line(a), Value::Line(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// A positional row: one value per column, in table-column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An ordered, possibly-partial set of column assignments keyed by column
/// name, as supplied by user code through the store façade (`insert`,
/// `update().set(...)`). The Normalizer turns this into a full positional
/// `Row`.
#[derive(Debug, Clone, Default)]
pub struct PartialRow(pub Vec<(String, Value)>);

impl PartialRow {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        if let Some(slot) = self.0.iter_mut().find(|(c, _)| *c == column) {
            slot.1 = value;
        } else {
            self.0.push((column, value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|(c, _)| c == column)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let pos = self.0.iter().position(|(c, _)| c == column)?;
        Some(self.0.remove(pos).1)
    }
}

/// A user-facing row view keyed by column name, returned from `find`/`get`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMap(pub Vec<(String, Value)>);

impl RowMap {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }
}
