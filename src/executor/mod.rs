//! The SQL-side boundary: a narrow `Executor`/`Transaction` trait pair the
//! Indexing Cache's flush protocol drives, plus a Postgres implementation
//! over `sqlx` and an in-memory mock used by the test suite.
//!
//! Grounded on the teacher's `storage::StorageEngine` (a thin façade the
//! rest of the crate drives without knowing the concrete backing store);
//! generalized here to an async trait so the flush protocol can run
//! against either a live Postgres connection or the mock without a
//! compile-time fork.

use crate::codec::{to_copy_field, Column, DriverValue, Table};
use crate::common::{Row, Value};
use crate::error::{CacheError, Result};
use async_trait::async_trait;

pub mod postgres;

/// One buffered mutation ready to flush.
#[derive(Debug, Clone)]
pub struct BufferedRow {
    pub key: String,
    pub row: Row,
}

/// The transaction-scoped operations the flush protocol needs: bulk
/// COPY-style inserts, a temp-table-backed bulk update, passthrough reads,
/// and passthrough deletes.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Bulk-loads `rows` into `table` via `COPY <schema>.<table> FROM
    /// STDIN`, translating known constraint violations into the matching
    /// `CacheError` variant.
    async fn copy_insert(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()>;

    /// Creates a transaction-scoped temp table shaped like `table`, bulk
    /// loads `rows` into it, then runs `UPDATE target SET ... FROM temp AS
    /// source WHERE <primary-key equality>`. The temp table is dropped on
    /// transaction commit (`ON COMMIT DROP`).
    async fn copy_update(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()>;

    /// A passthrough SELECT by primary key; returns `None` for a
    /// confirmed absence, translated by the cache into a tombstone.
    async fn select_by_key(&mut self, table: &Table, key: &str) -> Result<Option<Row>>;

    /// A passthrough `DELETE ... RETURNING`; returns whether a row was
    /// actually removed.
    async fn delete_by_key(&mut self, table: &Table, key: &str) -> Result<bool>;

    /// A bulk multi-key SELECT used by the prefetch controller's row
    /// prefetch; misses are simply absent from the returned vector.
    async fn select_many(&mut self, table: &Table, keys: &[String]) -> Result<Vec<(String, Row)>>;

    /// The `sql` escape hatch: an arbitrary statement bypassing the cache.
    async fn raw_sql(&mut self, statement: &str) -> Result<Vec<Row>>;
}

/// Owns (or borrows) the connection/transaction the cache's flush and
/// passthrough reads run within; never held across batch boundaries.
#[async_trait]
pub trait Executor: Send + Sync {
    type Tx<'a>: Transaction
    where
        Self: 'a;

    async fn begin(&self) -> Result<Self::Tx<'_>>;
}

/// Translates a raw driver error message into the constraint-violation
/// taxonomy, falling back to a generic `Flush` wrapper. Postgres reports
/// constraint kind via the error code prefix; this crate matches on the
/// textual message instead since it never links against `libpq` directly.
pub fn classify_constraint_violation(table: &str, message: &str) -> CacheError {
    let lower = message.to_lowercase();
    if lower.contains("not-null constraint") || lower.contains("not null constraint") {
        CacheError::NotNullConstraint(message.to_string())
    } else if lower.contains("unique constraint") || lower.contains("duplicate key") {
        CacheError::UniqueConstraint(message.to_string())
    } else if lower.contains("check constraint") {
        CacheError::CheckConstraint(message.to_string())
    } else {
        CacheError::Flush { table: table.to_string(), source: Box::new(CacheError::Internal(message.to_string())) }
    }
}

/// Renders a batch of buffered rows to the bulk-load text format (tab
/// separated, LF terminated, `\N` for null) consumed by `COPY FROM
/// STDIN`.
pub fn render_copy_stream(table: &Table, rows: &[BufferedRow]) -> Result<String> {
    let mut out = String::new();
    for buffered in rows {
        let mut fields = Vec::with_capacity(table.columns.len());
        for (idx, column) in table.columns.iter().enumerate() {
            let value = buffered.row.get(idx).cloned().unwrap_or(Value::Null);
            fields.push(to_copy_field(column, &value)?);
        }
        out.push_str(&fields.join("\t"));
        out.push('\n');
    }
    Ok(out)
}

/// An in-memory implementation of `Executor`/`Transaction`, used by the
/// crate's own test suite and exposed to host applications under the
/// `testutil` feature so they can write handler-level tests without a
/// live database.
#[cfg(any(test, feature = "testutil"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct TableData {
        rows: HashMap<String, Row>,
    }

    /// A process-local SQL store: tables keyed by name, rows keyed by the
    /// cache key. Constraint checking is limited to not-null, since the
    /// Normalizer is the documented single enforcement point for that and
    /// the mock exists to exercise the cache's own protocol, not a real
    /// schema engine.
    #[derive(Default, Clone)]
    pub struct MockExecutor {
        tables: Arc<Mutex<HashMap<String, TableData>>>,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn row_count(&self, table: &str) -> usize {
            self.tables.lock().get(table).map(|t| t.rows.len()).unwrap_or(0)
        }

        pub fn get_row(&self, table: &str, key: &str) -> Option<Row> {
            self.tables.lock().get(table).and_then(|t| t.rows.get(key).cloned())
        }
    }

    pub struct MockTransaction {
        tables: Arc<Mutex<HashMap<String, TableData>>>,
    }

    #[async_trait]
    impl Transaction for MockTransaction {
        async fn copy_insert(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()> {
            let mut tables = self.tables.lock();
            let data = tables.entry(table.name.clone()).or_default();
            for buffered in rows {
                if data.rows.contains_key(&buffered.key) {
                    return Err(CacheError::DelayedInsert(format!(
                        "{}/{} already exists at flush time",
                        table.name, buffered.key
                    )));
                }
                data.rows.insert(buffered.key.clone(), buffered.row.clone());
            }
            Ok(())
        }

        async fn copy_update(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()> {
            let mut tables = self.tables.lock();
            let data = tables.entry(table.name.clone()).or_default();
            for buffered in rows {
                data.rows.insert(buffered.key.clone(), buffered.row.clone());
            }
            Ok(())
        }

        async fn select_by_key(&mut self, table: &Table, key: &str) -> Result<Option<Row>> {
            let tables = self.tables.lock();
            Ok(tables.get(&table.name).and_then(|t| t.rows.get(key).cloned()))
        }

        async fn delete_by_key(&mut self, table: &Table, key: &str) -> Result<bool> {
            let mut tables = self.tables.lock();
            Ok(tables.get_mut(&table.name).map(|t| t.rows.remove(key).is_some()).unwrap_or(false))
        }

        async fn select_many(&mut self, table: &Table, keys: &[String]) -> Result<Vec<(String, Row)>> {
            let tables = self.tables.lock();
            let Some(data) = tables.get(&table.name) else { return Ok(Vec::new()) };
            Ok(keys.iter().filter_map(|k| data.rows.get(k).map(|r| (k.clone(), r.clone()))).collect())
        }

        async fn raw_sql(&mut self, _statement: &str) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        type Tx<'a> = MockTransaction;

        async fn begin(&self) -> Result<Self::Tx<'_>> {
            Ok(MockTransaction { tables: self.tables.clone() })
        }
    }

    /// Exercises the `DriverValue` shape even though the mock stores
    /// `Row`s directly, so tests that assert on a flushed driver
    /// representation have something to call.
    pub fn row_to_driver_values(table: &Table, row: &Row) -> Result<Vec<DriverValue>> {
        table.columns.iter().enumerate().map(|(i, c)| crate::codec::to_driver(c, row.get(i).unwrap_or(&Value::Null))).collect()
    }
}
