//! Historical Indexing Store: the user-facing façade over the Indexing
//! Cache. `find`/`insert`/`update`/`delete` all route through the cache;
//! `sql` is the escape hatch that bypasses it.
//!
//! Grounded on the teacher's `execution` query-builder layer (a thin
//! fluent surface over the storage engine that resolves to a handful of
//! concrete operations) — generalized here so `insert`/`update` return
//! builder structs that borrow the façade for their lifetime and execute
//! against the cache on a terminal `.execute()`/`.await`, rather than
//! holding a `&mut` across suspension points implicitly.

use crate::cache::IndexingCache;
use crate::codec::Table;
use crate::common::{PartialRow, Row, RowMap, Value};
use crate::error::{CacheError, Result};
use crate::event::Event;
use crate::executor::Transaction;
use crate::pattern::{Call, PatternMatcher};
use std::sync::Arc;

fn row_to_map(table: &Table, row: &Row) -> RowMap {
    RowMap(table.columns.iter().zip(row.0.iter()).map(|(c, v)| (c.name.clone(), v.clone())).collect())
}

/// Computes the cache key for an about-to-be-inserted row directly from
/// its partial row, without going through the Normalizer: primary-key
/// columns are always not-null (see `Column::primary_key`), so a well
/// formed insert supplies them verbatim.
fn partial_row_cache_key(table: &Table, partial: &PartialRow) -> Result<String> {
    let mut parts = Vec::with_capacity(table.primary_key_indices().len());
    for idx in table.primary_key_indices() {
        let column = &table.columns[idx];
        let value = partial
            .get(&column.name)
            .ok_or_else(|| CacheError::NotNull { table: table.name.clone(), column: column.name.clone() })?;
        parts.push(crate::codec::canonical_key(column, value)?);
    }
    Ok(parts.join("_"))
}

/// Merges a user patch on top of the currently committed row: columns the
/// patch touches win, columns carrying an `on_update` thunk are always
/// left out (so the Normalizer's thunk branch fires unconditionally), and
/// every other column keeps its committed value. See DESIGN.md for why
/// this merge lives in the façade rather than the cache or Normalizer.
fn build_update_partial(table: &Table, current: &Row, patch: &PartialRow) -> PartialRow {
    let mut merged = PartialRow::new();
    for (idx, column) in table.columns.iter().enumerate() {
        if column.on_update.is_some() {
            continue;
        }
        if let Some(value) = patch.get(&column.name) {
            merged.set(column.name.clone(), value.clone());
        } else if let Some(value) = current.get(idx) {
            merged.set(column.name.clone(), value.clone());
        }
    }
    merged
}

/// On-conflict behavior for `insert`.
pub enum OnConflict {
    /// The default: a colliding primary key is a unique-constraint error.
    Error,
    /// Returns `None` for the colliding row, leaves the existing row alone.
    DoNothing,
    /// Receives the currently committed row and returns a patch, applied
    /// the same way `update` applies one.
    DoUpdate(Arc<dyn Fn(&RowMap) -> PartialRow + Send + Sync>),
}

/// The patch form accepted by `update`: a static partial row, or a
/// function of the currently committed row.
pub enum UpdatePatch {
    Static(PartialRow),
    Fn(Arc<dyn Fn(&RowMap) -> PartialRow + Send + Sync>),
}

impl From<PartialRow> for UpdatePatch {
    fn from(value: PartialRow) -> Self {
        UpdatePatch::Static(value)
    }
}

struct PatternContext<'a> {
    matcher: &'a mut PatternMatcher,
    event: &'a Event,
}

/// The façade user handlers interact with. Borrows the cache and the
/// active transaction for the duration of one batch; never retained
/// across a commit boundary.
pub struct HistoricalIndexingStore<'a, T: Transaction> {
    cache: &'a mut IndexingCache,
    tx: &'a mut T,
    pattern: Option<PatternContext<'a>>,
}

impl<'a, T: Transaction> HistoricalIndexingStore<'a, T> {
    pub fn new(cache: &'a mut IndexingCache, tx: &'a mut T) -> Self {
        Self { cache, tx, pattern: None }
    }

    /// Same as `new`, but `find` calls also feed the Pattern Matcher so the
    /// Prefetch Controller can later learn this event's row-access shape
    /// (§4.7's reuse of the pattern machinery for table lookups).
    pub fn with_pattern_context(
        cache: &'a mut IndexingCache,
        tx: &'a mut T,
        matcher: &'a mut PatternMatcher,
        event: &'a Event,
    ) -> Self {
        Self { cache, tx, pattern: Some(PatternContext { matcher, event }) }
    }

    fn table(&self, name: &str) -> Result<Table> {
        self.cache.schema().get(name).cloned().ok_or_else(|| CacheError::UnknownTable(name.to_string()))
    }

    pub async fn find(&mut self, table: &str, key: &str) -> Result<Option<RowMap>> {
        let table_desc = self.table(table)?;
        let row = self.cache.get(self.tx, table, key).await?;
        if let (Some(row), Some(ctx)) = (&row, self.pattern.as_mut()) {
            let args: Vec<Value> = table_desc.primary_key_indices().into_iter().filter_map(|i| row.get(i).cloned()).collect();
            let call = Call {
                target: format!("{}::table:{}", ctx.event.name, table),
                address: Value::Text(table.to_string()),
                args,
                function_name: String::new(),
                abi_fingerprint: String::new(),
                cache_mode: None,
            };
            ctx.matcher.record(ctx.event, &call);
        }
        Ok(row.map(|r| row_to_map(&table_desc, &r)))
    }

    pub fn insert(&mut self, table: &str) -> InsertBuilder<'_, 'a, T> {
        InsertBuilder { store: self, table: table.to_string(), rows: Vec::new(), conflict: OnConflict::Error }
    }

    pub fn update(&mut self, table: &str, key: &str) -> UpdateBuilder<'_, 'a, T> {
        UpdateBuilder { store: self, table: table.to_string(), key: key.to_string(), patch: None }
    }

    pub async fn delete(&mut self, table: &str, key: &str) -> Result<bool> {
        self.cache.delete(self.tx, table, key).await
    }

    /// Bypasses the cache entirely. Always flushes pending buffers first
    /// (so a raw read can't observe stale pre-write state and a raw write
    /// can't race a buffered one for the same row). `write_table`, when
    /// given, names the table the statement writes to: its cached rows are
    /// dropped and `isCacheComplete` is cleared globally, since an
    /// arbitrary statement may have inserted keys the cache has no way to
    /// know about otherwise.
    pub async fn sql(&mut self, statement: &str, write_table: Option<&str>) -> Result<Vec<Row>> {
        self.cache.flush(self.tx).await?;
        let rows = self.tx.raw_sql(statement).await?;
        if let Some(table) = write_table {
            self.cache.invalidate_table(table);
            self.cache.invalidate();
        }
        Ok(rows)
    }

    async fn execute_insert(&mut self, table: &str, rows: Vec<PartialRow>, conflict: OnConflict) -> Result<Vec<Option<RowMap>>> {
        let table_desc = self.table(table)?;
        let mut out = Vec::with_capacity(rows.len());
        for partial in rows {
            let key = partial_row_cache_key(&table_desc, &partial)?;
            let existing = self.cache.get(self.tx, table, &key).await?;
            if let Some(current) = existing {
                match &conflict {
                    OnConflict::Error => {
                        return Err(CacheError::UniqueConstraint(format!("{table}/{key} already exists")));
                    }
                    OnConflict::DoNothing => {
                        out.push(None);
                        continue;
                    }
                    OnConflict::DoUpdate(f) => {
                        let patch = f(&row_to_map(&table_desc, &current));
                        let merged = build_update_partial(&table_desc, &current, &patch);
                        let row = self.cache.set(table, &key, &merged, true)?;
                        out.push(Some(row_to_map(&table_desc, &row)));
                        continue;
                    }
                }
            }
            let row = self.cache.set(table, &key, &partial, false)?;
            out.push(Some(row_to_map(&table_desc, &row)));
        }
        Ok(out)
    }

    async fn execute_update(&mut self, table: &str, key: &str, patch: UpdatePatch) -> Result<RowMap> {
        let table_desc = self.table(table)?;
        let current = self
            .cache
            .get(self.tx, table, key)
            .await?
            .ok_or_else(|| CacheError::NotFound { table: table.to_string(), key: key.to_string() })?;
        let patch_partial = match patch {
            UpdatePatch::Static(p) => p,
            UpdatePatch::Fn(f) => f(&row_to_map(&table_desc, &current)),
        };
        let merged = build_update_partial(&table_desc, &current, &patch_partial);
        let row = self.cache.set(table, key, &merged, true)?;
        Ok(row_to_map(&table_desc, &row))
    }
}

/// Fluent insert builder returned by `HistoricalIndexingStore::insert`.
pub struct InsertBuilder<'s, 'a, T: Transaction> {
    store: &'s mut HistoricalIndexingStore<'a, T>,
    table: String,
    rows: Vec<PartialRow>,
    conflict: OnConflict,
}

impl<'s, 'a, T: Transaction> InsertBuilder<'s, 'a, T> {
    pub fn values(mut self, rows: Vec<PartialRow>) -> Self {
        self.rows = rows;
        self
    }

    pub fn value(mut self, row: PartialRow) -> Self {
        self.rows.push(row);
        self
    }

    pub fn on_conflict_do_nothing(mut self) -> Self {
        self.conflict = OnConflict::DoNothing;
        self
    }

    pub fn on_conflict_do_update(mut self, f: impl Fn(&RowMap) -> PartialRow + Send + Sync + 'static) -> Self {
        self.conflict = OnConflict::DoUpdate(Arc::new(f));
        self
    }

    /// Runs the insert. A single `.value(...)` call returns its one row
    /// (or `None` on a `DoNothing` conflict) as `.execute_one()` for
    /// convenience; multi-row callers use `execute`.
    pub async fn execute(self) -> Result<Vec<Option<RowMap>>> {
        self.store.execute_insert(&self.table, self.rows, self.conflict).await
    }

    pub async fn execute_one(self) -> Result<Option<RowMap>> {
        let mut rows = self.store.execute_insert(&self.table, self.rows, self.conflict).await?;
        Ok(rows.pop().flatten())
    }
}

/// Fluent update builder returned by `HistoricalIndexingStore::update`.
pub struct UpdateBuilder<'s, 'a, T: Transaction> {
    store: &'s mut HistoricalIndexingStore<'a, T>,
    table: String,
    key: String,
    patch: Option<UpdatePatch>,
}

impl<'s, 'a, T: Transaction> UpdateBuilder<'s, 'a, T> {
    pub fn set(mut self, patch: impl Into<UpdatePatch>) -> Self {
        self.patch = Some(patch.into());
        self
    }

    pub fn set_with(mut self, f: impl Fn(&RowMap) -> PartialRow + Send + Sync + 'static) -> Self {
        self.patch = Some(UpdatePatch::Fn(Arc::new(f)));
        self
    }

    pub async fn execute(self) -> Result<RowMap> {
        let patch = self.patch.unwrap_or_else(|| UpdatePatch::Static(PartialRow::new()));
        self.store.execute_update(&self.table, &self.key, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Column, ColumnType, Schema};
    use crate::config::Config;
    use crate::executor::mock::MockExecutor;
    use crate::executor::Executor;

    fn account_schema() -> Schema {
        Schema::with_tables(vec![Table::new(
            "public",
            "account",
            vec![
                Column::new("address", ColumnType::Text).primary_key(),
                Column::new("balance", ColumnType::BigInt).not_null().default_constant(Value::BigInt(0.into())),
                Column::new(
                    "touched_count",
                    ColumnType::Int,
                )
                .not_null()
                .default_constant(Value::Int(0))
                .on_update(Arc::new(|| Value::Int(1))),
            ],
        )])
    }

    fn insert_patch(address: &str, balance: i64) -> PartialRow {
        let mut p = PartialRow::new();
        p.set("address", Value::Text(address.to_string()));
        p.set("balance", Value::BigInt(balance.into()));
        p
    }

    #[tokio::test]
    async fn insert_then_find_same_batch() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        let mut store = HistoricalIndexingStore::new(&mut cache, &mut tx);

        let inserted = store.insert("account").value(insert_patch("0xabc", 10)).execute_one().await.unwrap();
        assert_eq!(inserted.unwrap().get("balance"), Some(&Value::BigInt(10.into())));

        let found = store.find("account", "0xabc").await.unwrap().unwrap();
        assert_eq!(found.get("balance"), Some(&Value::BigInt(10.into())));
    }

    #[tokio::test]
    async fn update_preserves_untouched_columns_and_fires_on_update_thunk() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        let mut store = HistoricalIndexingStore::new(&mut cache, &mut tx);
        store.insert("account").value(insert_patch("0xabc", 10)).execute().await.unwrap();

        let mut patch = PartialRow::new();
        patch.set("balance", Value::BigInt(99.into()));
        let updated = store.update("account", "0xabc").set(patch).execute().await.unwrap();
        assert_eq!(updated.get("balance"), Some(&Value::BigInt(99.into())));
        assert_eq!(updated.get("touched_count"), Some(&Value::Int(1)));
        assert_eq!(updated.get("address"), Some(&Value::Text("0xabc".to_string())));
    }

    #[tokio::test]
    async fn update_with_primary_key_in_patch_is_immutable() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        let mut store = HistoricalIndexingStore::new(&mut cache, &mut tx);
        store.insert("account").value(insert_patch("0xabc", 10)).execute().await.unwrap();

        let mut patch = PartialRow::new();
        patch.set("address", Value::Text("0xdef".to_string()));
        let err = store.update("account", "0xabc").set(patch).execute().await.unwrap_err();
        assert!(matches!(err, CacheError::PrimaryKeyImmutable { .. }));
    }

    #[tokio::test]
    async fn insert_on_conflict_do_nothing_returns_none_and_keeps_existing() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        let mut store = HistoricalIndexingStore::new(&mut cache, &mut tx);
        store.insert("account").value(insert_patch("0xabc", 10)).execute().await.unwrap();

        let result = store
            .insert("account")
            .value(insert_patch("0xabc", 999))
            .on_conflict_do_nothing()
            .execute_one()
            .await
            .unwrap();
        assert!(result.is_none());
        let found = store.find("account", "0xabc").await.unwrap().unwrap();
        assert_eq!(found.get("balance"), Some(&Value::BigInt(10.into())));
    }

    #[tokio::test]
    async fn insert_on_conflict_do_update_applies_function_patch() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        let mut store = HistoricalIndexingStore::new(&mut cache, &mut tx);
        store.insert("account").value(insert_patch("0xabc", 10)).execute().await.unwrap();

        let result = store
            .insert("account")
            .value(insert_patch("0xabc", 5))
            .on_conflict_do_update(|current| {
                let mut p = PartialRow::new();
                let Some(Value::BigInt(b)) = current.get("balance") else { unreachable!() };
                p.set("balance", Value::BigInt(b + 5));
                p
            })
            .execute_one()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.get("balance"), Some(&Value::BigInt(15.into())));
    }
}
