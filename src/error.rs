//! Error taxonomy for the indexing cache.
//!
//! Mirrors the error kinds enumerated in the write-back cache design: codec
//! and normalizer failures are synchronous and non-retryable, flush failures
//! abort the batch, and RPC failures carry a retry budget before they reach
//! the handler. See `rpc::RpcErrorKind` for the RPC-specific sub-taxonomy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("big integer cannot be serialized into a JSON column")]
    BigIntSerialization,

    #[error("not-null constraint violated for column {column} in table {table}")]
    NotNull { table: String, column: String },

    #[error("primary key is immutable: update to {table}/{key} attempted to change a primary-key column")]
    PrimaryKeyImmutable { table: String, key: String },

    #[error("flush failed for table {table}: {source}")]
    Flush {
        table: String,
        #[source]
        source: Box<CacheError>,
    },

    #[error("deferred insert collided with an existing row at flush time: {0}")]
    DelayedInsert(String),

    #[error("not-null constraint violation reported by the database: {0}")]
    NotNullConstraint(String),

    #[error("unique constraint violation reported by the database: {0}")]
    UniqueConstraint(String),

    #[error("check constraint violation reported by the database: {0}")]
    CheckConstraint(String),

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("row not found: {table}/{key}")]
    NotFound { table: String, key: String },

    #[error("shutdown requested")]
    Shutdown,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CacheError {
    /// Whether the runtime may retry the batch this error occurred in.
    /// Every cache-level error kind is non-retryable by construction; only
    /// RPC errors (see `rpc::RpcErrorKind`) carry a retry budget.
    pub fn retryable(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
