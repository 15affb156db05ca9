//! Indexing Cache: the per-table write-back overlay over the SQL store —
//! the central component of this crate.
//!
//! Grounded on the teacher's `storage` buffer-pool idiom (a fixed set of
//! in-memory tiers fronting durable storage, with an explicit flush/evict
//! boundary) generalized from pages to rows: four tiers per table
//! (`cache`, `spillover`, `insertBuffer`, `updateBuffer`), an LRU clock
//! (`op_index`) assigned on every touch, and a byte-budget eviction pass
//! that runs at commit time rather than on every write.
//!
//! Single-threaded by design (§5): every method here takes `&mut self`.
//! There is no internal locking — the runtime that owns an `IndexingCache`
//! is responsible for never calling into it concurrently.

use crate::codec::{self, Schema, Table};
use crate::common::{PartialRow, Row, Value};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::executor::{BufferedRow, Transaction};
use crate::normalizer;
use std::collections::HashMap;
use tracing::instrument;

/// Base per-entry byte overhead (metadata: key, tier bookkeeping), per
/// §4.5.3. The estimate is intentionally rough — monotone in size, not
/// exact.
const ENTRY_BASE_BYTES: u64 = 13;

fn value_bytes(value: &Value) -> u64 {
    match value {
        Value::Null => 8,
        Value::Bool(_) => 4,
        Value::Int(_) => 8,
        Value::Float(_) => 8,
        Value::BigInt(_) => 48,
        Value::Text(s) => 2 * s.len() as u64,
        Value::Bytes(b) => 2 * b.len() as u64,
        Value::Enum(s) => 2 * s.len() as u64,
        Value::Timestamp(_) => 8,
        Value::Json(j) => json_bytes(j),
        Value::Point(_) => 16,
        Value::Line(l) => l.0.len() as u64 * 16,
        Value::Array(items) => items.iter().map(value_bytes).sum(),
    }
}

fn json_bytes(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Null => 8,
        serde_json::Value::Bool(_) => 4,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => 2 * s.len() as u64,
        serde_json::Value::Array(items) => items.iter().map(json_bytes).sum(),
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| 2 * k.len() as u64 + json_bytes(v)).sum(),
    }
}

fn row_bytes(row: &Row) -> u64 {
    ENTRY_BASE_BYTES + row.0.iter().map(value_bytes).sum::<u64>()
}

fn tombstone_bytes() -> u64 {
    ENTRY_BASE_BYTES
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: u64,
    op_index: u64,
    /// `None` is a tombstone: a confirmed absence in the database.
    row: Option<Row>,
}

#[derive(Debug, Clone)]
struct BufferEntry {
    row: Row,
}

#[derive(Default)]
struct TableTiers {
    cache: HashMap<String, CacheEntry>,
    spillover: HashMap<String, CacheEntry>,
    insert_buffer: HashMap<String, BufferEntry>,
    update_buffer: HashMap<String, BufferEntry>,
}

/// The write-back cache for one schema's worth of tables.
pub struct IndexingCache {
    schema: Schema,
    config: Config,
    tables: HashMap<String, TableTiers>,
    is_cache_complete: bool,
    cache_bytes: u64,
    spillover_bytes: u64,
    total_cache_ops: u64,
}

impl IndexingCache {
    /// `is_cache_complete` should be `true` only when the cache is created
    /// at chain genesis with no prior checkpoint — see §3's Lifecycle.
    pub fn new(schema: Schema, config: Config, is_cache_complete: bool) -> Self {
        let tables = schema.iter().map(|t| (t.name.clone(), TableTiers::default())).collect();
        Self { schema, config, tables, is_cache_complete, cache_bytes: 0, spillover_bytes: 0, total_cache_ops: 0 }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_cache_complete(&self) -> bool {
        self.is_cache_complete
    }

    pub fn cache_bytes(&self) -> u64 {
        self.cache_bytes
    }

    pub fn spillover_bytes(&self) -> u64 {
        self.spillover_bytes
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.schema.get(name).ok_or_else(|| CacheError::UnknownTable(name.to_string()))
    }

    fn next_op_index(&mut self) -> u64 {
        self.total_cache_ops += 1;
        self.total_cache_ops
    }

    /// True if any tier already has an opinion about `(table, key)` — a
    /// confirmed row, a tombstone, or a buffered mutation — or the cache is
    /// known complete (meaning a miss everywhere is itself conclusive: the
    /// database need not be consulted, per I3). This answers "would `get`
    /// need to suspend on I/O", not "does the row exist" — a tombstone
    /// counts as a hit here.
    pub fn has(&self, table: &str, key: &str) -> bool {
        if self.is_cache_complete {
            return true;
        }
        let Some(tiers) = self.tables.get(table) else { return false };
        tiers.update_buffer.contains_key(key)
            || tiers.insert_buffer.contains_key(key)
            || tiers.spillover.contains_key(key)
            || tiers.cache.contains_key(key)
    }

    /// Looks the key up across tiers in I1's precedence order
    /// (updateBuffer > insertBuffer > spillover > cache), refreshing the
    /// LRU clock on a `spillover`/`cache` hit. Returns `None` if no tier has
    /// an opinion; `Some(None)` is a tombstone hit.
    fn tier_lookup(&mut self, table: &str, key: &str) -> Option<Option<Row>> {
        let tiers = self.tables.get(table)?;
        if let Some(e) = tiers.update_buffer.get(key) {
            return Some(Some(e.row.clone()));
        }
        if let Some(e) = tiers.insert_buffer.get(key) {
            return Some(Some(e.row.clone()));
        }
        if tiers.spillover.contains_key(key) {
            let op_index = self.next_op_index();
            let tiers = self.tables.get_mut(table).unwrap();
            let entry = tiers.spillover.get_mut(key).unwrap();
            entry.op_index = op_index;
            return Some(entry.row.clone());
        }
        if tiers.cache.contains_key(key) {
            let op_index = self.next_op_index();
            let tiers = self.tables.get_mut(table).unwrap();
            let entry = tiers.cache.get_mut(key).unwrap();
            entry.op_index = op_index;
            return Some(entry.row.clone());
        }
        None
    }

    /// Returns the freshest tier's row for `(table, key)`, falling back to
    /// a passthrough `SELECT` by primary key (installed into `spillover`)
    /// when every tier misses and the cache is not known complete.
    #[instrument(skip(self, tx))]
    pub async fn get<T: Transaction>(&mut self, tx: &mut T, table: &str, key: &str) -> Result<Option<Row>> {
        if !self.tables.contains_key(table) {
            return Err(CacheError::UnknownTable(table.to_string()));
        }
        if let Some(hit) = self.tier_lookup(table, key) {
            return Ok(hit);
        }
        if self.is_cache_complete {
            return Ok(None);
        }
        let table_desc = self.table(table)?.clone();
        let fetched = tx.select_by_key(&table_desc, key).await?;
        let bytes = fetched.as_ref().map(row_bytes).unwrap_or_else(tombstone_bytes);
        let op_index = self.next_op_index();
        let tiers = self.tables.get_mut(table).unwrap();
        tiers.spillover.insert(key.to_string(), CacheEntry { bytes, op_index, row: fetched.clone() });
        self.spillover_bytes += bytes;
        Ok(fetched)
    }

    /// Normalizes `partial_row` and buffers it for the next flush. On an
    /// update, a patch that would change a primary-key column relative to
    /// `key` is a hard error (I4) and mutates no tier.
    ///
    /// A key already sitting in `insertBuffer` (inserted earlier this batch,
    /// flushed or not) that receives a further update stays in
    /// `insertBuffer` with its row replaced, rather than moving to
    /// `updateBuffer` — see DESIGN.md for why this deviates from a literal
    /// reading of the state diagram in §4.5.4: an UPDATE statement against
    /// a row that was never actually inserted would silently affect zero
    /// rows. An insert call on a key currently in `updateBuffer` does move
    /// it back to `insertBuffer`, matching the diagram.
    pub fn set(&mut self, table: &str, key: &str, partial_row: &PartialRow, is_update: bool) -> Result<Row> {
        let table_desc = self.table(table)?.clone();
        let row = normalizer::normalize(&table_desc, partial_row, is_update)?;
        if is_update {
            let actual_key = codec::cache_key(&table_desc, &row.0)?;
            if actual_key != key {
                return Err(CacheError::PrimaryKeyImmutable { table: table.to_string(), key: key.to_string() });
            }
        }
        let tiers = self.tables.get_mut(table).unwrap();
        if is_update {
            if let Some(existing) = tiers.insert_buffer.get_mut(key) {
                existing.row = row.clone();
            } else {
                tiers.update_buffer.insert(key.to_string(), BufferEntry { row: row.clone() });
            }
        } else {
            tiers.update_buffer.remove(key);
            tiers.insert_buffer.insert(key.to_string(), BufferEntry { row: row.clone() });
        }
        Ok(row)
    }

    /// Installs a tombstone in `cache`. If a prior tier lookup already
    /// established the row's presence/absence (a `spillover` or `cache`
    /// hit), that answer is returned directly; otherwise a passthrough
    /// `DELETE ... RETURNING` resolves it. Any buffered insert/update for
    /// this key is dropped, and any `spillover` entry for this key is
    /// removed rather than left behind — per I1's precedence, `spillover`
    /// outranks `cache` on lookup, so a stale pre-delete row left in
    /// `spillover` would otherwise resurface on the next `get` and then get
    /// merged back over the tombstone at the next `commit`. Within one
    /// sequentially-processed batch, a later `delete` supersedes an earlier
    /// unflushed mutation for the same key (an engineering decision
    /// recorded in DESIGN.md; spec.md is silent on the interaction).
    #[instrument(skip(self, tx))]
    pub async fn delete<T: Transaction>(&mut self, tx: &mut T, table: &str, key: &str) -> Result<bool> {
        let table_desc = self.table(table)?.clone();
        let removed_spillover = {
            let tiers = self.tables.get_mut(table).unwrap();
            tiers.insert_buffer.remove(key);
            tiers.update_buffer.remove(key);
            tiers.spillover.remove(key)
        };
        let spillover_known = removed_spillover.as_ref().map(|e| e.row.is_some());
        if let Some(old) = &removed_spillover {
            self.spillover_bytes = self.spillover_bytes.saturating_sub(old.bytes);
        }
        let cache_known = self.tables.get(table).unwrap().cache.get(key).map(|e| e.row.is_some());
        let known = spillover_known.or(cache_known);
        let existed = match known {
            Some(existed) => existed,
            None => tx.delete_by_key(&table_desc, key).await?,
        };
        let bytes = tombstone_bytes();
        let op_index = self.next_op_index();
        let tiers = self.tables.get_mut(table).unwrap();
        if let Some(old) = tiers.cache.insert(key.to_string(), CacheEntry { bytes, op_index, row: None }) {
            self.cache_bytes = self.cache_bytes.saturating_sub(old.bytes);
        }
        self.cache_bytes += bytes;
        Ok(existed)
    }

    /// Directly installs a row (or tombstone) into `spillover`, as the
    /// prefetch controller does for its predicted row lookups (§4.7.1), so
    /// that the first handler `get` for that key is a hit.
    pub fn install_spillover(&mut self, table: &str, key: &str, row: Option<Row>) {
        let bytes = row.as_ref().map(row_bytes).unwrap_or_else(tombstone_bytes);
        let op_index = self.next_op_index();
        let Some(tiers) = self.tables.get_mut(table) else { return };
        if let Some(old) = tiers.spillover.insert(key.to_string(), CacheEntry { bytes, op_index, row }) {
            self.spillover_bytes = self.spillover_bytes.saturating_sub(old.bytes);
        }
        self.spillover_bytes += bytes;
    }

    /// Flushes every table's buffers to the database, in schema iteration
    /// order (§5's ordering guarantee). Buffers are left populated — per
    /// I5, only `commit` drains them — so a subsequent failure in the same
    /// transaction can still `rollback`.
    #[instrument(skip(self, tx))]
    pub async fn flush<T: Transaction>(&mut self, tx: &mut T) -> Result<()> {
        for table_desc in self.schema.iter() {
            let name = table_desc.name.clone();
            let insert_rows: Vec<BufferedRow> = {
                let tiers = self.tables.get(&name).unwrap();
                tiers.insert_buffer.iter().map(|(k, e)| BufferedRow { key: k.clone(), row: e.row.clone() }).collect()
            };
            if !insert_rows.is_empty() {
                tx.copy_insert(table_desc, &insert_rows).await.map_err(|e| wrap_flush_error(&name, e))?;
            }
            let update_rows: Vec<BufferedRow> = {
                let tiers = self.tables.get(&name).unwrap();
                tiers.update_buffer.iter().map(|(k, e)| BufferedRow { key: k.clone(), row: e.row.clone() }).collect()
            };
            if !update_rows.is_empty() {
                tx.copy_update(table_desc, &update_rows).await.map_err(|e| wrap_flush_error(&name, e))?;
            }
        }
        Ok(())
    }

    /// Merges `spillover` into `cache`, drains both buffers into `cache`
    /// with fresh `op_index`es, and then runs eviction if the byte budget
    /// is exceeded (§4.5.2). Eviction runs last so the rows just committed
    /// this batch are themselves eligible — otherwise a single-row batch
    /// under a byte ceiling smaller than one row could never shrink. This
    /// is the only place `insertBuffer` and `updateBuffer` are cleared.
    #[instrument(skip(self))]
    pub fn commit(&mut self) {
        self.merge_spillover_into_cache();
        self.drain_buffers_into_cache();
        self.maybe_evict();
    }

    /// Runs the byte-budget eviction pass immediately, without waiting for
    /// a full commit boundary. Used by the Prefetch Controller right after
    /// a flush, when the rows it just installed may have pushed bytes over
    /// budget ahead of the batch's own commit.
    pub fn evict_if_over_budget(&mut self) {
        self.maybe_evict();
    }

    /// Evicts `cache` entries oldest-`op_index`-first until both the
    /// §4.5.2 top-quartile retention target and the hard byte ceiling are
    /// satisfied. The quartile threshold alone can round a tiny cache up to
    /// "keep everything" (e.g. a single entry retains itself), which would
    /// leave the cache over `indexing_cache_max_bytes` whenever that ceiling
    /// is smaller than one row's worth of bytes — so eviction keeps walking
    /// oldest-first past the quartile count until the byte budget holds too.
    fn maybe_evict(&mut self) {
        if self.cache_bytes + self.spillover_bytes <= self.config.indexing_cache_max_bytes {
            return;
        }
        self.is_cache_complete = false;
        let mut entries: Vec<(String, String, u64, u64)> = Vec::new();
        for (table, tiers) in &self.tables {
            for (key, entry) in &tiers.cache {
                entries.push((table.clone(), key.clone(), entry.op_index, entry.bytes));
            }
        }
        entries.sort_by_key(|(_, _, op_index, _)| *op_index);

        let keep = (entries.len() as f64 * (1.0 - self.config.indexing_cache_flush_ratio)).round() as usize;
        let quartile_evict_count = entries.len().saturating_sub(keep);

        for (idx, (table, key, _, bytes)) in entries.iter().enumerate() {
            let within_budget = self.cache_bytes + self.spillover_bytes <= self.config.indexing_cache_max_bytes;
            if idx >= quartile_evict_count && within_budget {
                break;
            }
            if let Some(tiers) = self.tables.get_mut(table) {
                if tiers.cache.remove(key).is_some() {
                    self.cache_bytes = self.cache_bytes.saturating_sub(*bytes);
                }
            }
        }
    }

    fn merge_spillover_into_cache(&mut self) {
        let mut delta: i64 = 0;
        for tiers in self.tables.values_mut() {
            for (key, entry) in tiers.spillover.drain() {
                delta += entry.bytes as i64;
                if let Some(old) = tiers.cache.insert(key, entry) {
                    delta -= old.bytes as i64;
                }
            }
        }
        self.cache_bytes = (self.cache_bytes as i64 + delta).max(0) as u64;
        self.spillover_bytes = 0;
    }

    fn drain_buffers_into_cache(&mut self) {
        let mut total_cache_ops = self.total_cache_ops;
        let mut delta: i64 = 0;
        for tiers in self.tables.values_mut() {
            let inserts: Vec<(String, Row)> = tiers.insert_buffer.drain().map(|(k, e)| (k, e.row)).collect();
            let updates: Vec<(String, Row)> = tiers.update_buffer.drain().map(|(k, e)| (k, e.row)).collect();
            for (key, row) in inserts.into_iter().chain(updates.into_iter()) {
                total_cache_ops += 1;
                let bytes = row_bytes(&row);
                delta += bytes as i64;
                if let Some(old) = tiers.cache.insert(key, CacheEntry { bytes, op_index: total_cache_ops, row: Some(row) }) {
                    delta -= old.bytes as i64;
                }
            }
        }
        self.total_cache_ops = total_cache_ops;
        self.cache_bytes = (self.cache_bytes as i64 + delta).max(0) as u64;
    }

    /// Clears `spillover` and both buffers, used on handler failure mid
    /// batch. `cache` and the op-index clock are untouched.
    pub fn rollback(&mut self) {
        for tiers in self.tables.values_mut() {
            tiers.spillover.clear();
            tiers.insert_buffer.clear();
            tiers.update_buffer.clear();
        }
        self.spillover_bytes = 0;
    }

    /// Empties every tier. Used by tests to force a cold cache without
    /// dropping the struct.
    pub fn clear(&mut self) {
        for tiers in self.tables.values_mut() {
            tiers.cache.clear();
            tiers.spillover.clear();
            tiers.insert_buffer.clear();
            tiers.update_buffer.clear();
        }
        self.cache_bytes = 0;
        self.spillover_bytes = 0;
    }

    /// Marks the cache as no longer covering all possible keys; called by
    /// the runtime when a reorg or a raw `sql` write makes that assumption
    /// unsafe.
    pub fn invalidate(&mut self) {
        self.is_cache_complete = false;
    }

    /// Drops every cached row and buffered mutation for one table, used by
    /// the store façade's `sql` escape hatch when a raw write may have
    /// touched rows this cache doesn't know about.
    pub fn invalidate_table(&mut self, table: &str) {
        let Some(tiers) = self.tables.get_mut(table) else { return };
        let cache_bytes: u64 = tiers.cache.values().map(|e| e.bytes).sum();
        let spillover_bytes: u64 = tiers.spillover.values().map(|e| e.bytes).sum();
        tiers.cache.clear();
        tiers.spillover.clear();
        tiers.insert_buffer.clear();
        tiers.update_buffer.clear();
        self.cache_bytes = self.cache_bytes.saturating_sub(cache_bytes);
        self.spillover_bytes = self.spillover_bytes.saturating_sub(spillover_bytes);
    }
}

fn wrap_flush_error(table: &str, err: CacheError) -> CacheError {
    match err {
        CacheError::NotNullConstraint(_) | CacheError::UniqueConstraint(_) | CacheError::CheckConstraint(_) | CacheError::DelayedInsert(_) => err,
        other => CacheError::Flush { table: table.to_string(), source: Box::new(other) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Column, ColumnType};
    use crate::executor::mock::MockExecutor;
    use crate::executor::Executor;

    fn account_schema() -> Schema {
        Schema::with_tables(vec![Table::new(
            "public",
            "account",
            vec![
                Column::new("address", ColumnType::Text).primary_key(),
                Column::new("balance", ColumnType::BigInt).not_null().default_constant(Value::BigInt(0.into())),
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
    async fn tier_precedence_update_over_insert_over_spillover_over_cache() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();

        // Nothing anywhere: DB miss, cache not complete -> None, installed
        // into spillover as a tombstone.
        assert_eq!(cache.get(&mut tx, "account", "0xabc").await.unwrap(), None);

        // set(insert) must win over the spillover tombstone.
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        let row = cache.get(&mut tx, "account", "0xabc").await.unwrap().unwrap();
        assert_eq!(row.get(1), Some(&Value::BigInt(10.into())));

        // set(update) must win over the buffered insert (folded into
        // insertBuffer per the documented deviation).
        cache.set("account", "0xabc", &insert_patch("0xabc", 20), true).unwrap();
        let row = cache.get(&mut tx, "account", "0xabc").await.unwrap().unwrap();
        assert_eq!(row.get(1), Some(&Value::BigInt(20.into())));
    }

    #[tokio::test]
    async fn flush_then_commit_moves_buffers_into_cache() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();

        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        cache.flush(&mut tx).await.unwrap();
        assert_eq!(executor.get_row("account", "0xabc").unwrap().get(1), Some(&Value::BigInt(10.into())));

        cache.commit();
        assert!(cache.has("account", "0xabc"));

        // A fresh cache backed by the same (already-flushed) store must
        // still resolve the row via passthrough read.
        let mut fresh = IndexingCache::new(account_schema(), Config::default(), false);
        let mut tx2 = executor.begin().await.unwrap();
        let row = fresh.get(&mut tx2, "account", "0xabc").await.unwrap().unwrap();
        assert_eq!(row.get(1), Some(&Value::BigInt(10.into())));
    }

    #[tokio::test]
    async fn primary_key_immutable_on_update_with_different_key() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        let err = cache.set("account", "0xabc", &insert_patch("0xdef", 10), true).unwrap_err();
        assert!(matches!(err, CacheError::PrimaryKeyImmutable { .. }));
    }

    #[tokio::test]
    async fn commit_evicts_under_zero_byte_budget() {
        let mut config = Config::default();
        config.indexing_cache_max_bytes = 0;
        let mut cache = IndexingCache::new(account_schema(), config, false);
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();
        assert!(!cache.has("account", "0xabc"));
        assert!(!cache.is_cache_complete());
    }

    #[tokio::test]
    async fn rollback_clears_spillover_and_buffers_but_not_cache() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();
        assert!(cache.has("account", "0xabc"));

        cache.set("account", "0xdef", &insert_patch("0xdef", 5), false).unwrap();
        cache.rollback();
        assert!(!cache.has("account", "0xdef"));
        assert!(cache.has("account", "0xabc"));
    }

    #[tokio::test]
    async fn delete_without_prior_knowledge_consults_db() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();

        let mut tx2 = executor.begin().await.unwrap();
        let existed = cache.delete(&mut tx2, "account", "0xabc").await.unwrap();
        assert!(existed);
        assert_eq!(cache.get(&mut tx2, "account", "0xabc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_clears_stale_spillover_so_it_cannot_resurface() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.set("account", "0xabc", &insert_patch("0xabc", 10), false).unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();
        cache.clear();

        // A passthrough read mid-iteration materializes the row into
        // `spillover` before the handler deletes it.
        assert_eq!(cache.get(&mut tx, "account", "0xabc").await.unwrap(), Some(Row::new(vec![
            Value::Text("0xabc".to_string()),
            Value::BigInt(10.into()),
        ])));
        cache.delete(&mut tx, "account", "0xabc").await.unwrap();

        // The stale spillover entry must not outrank the fresh tombstone:
        // a later `get` in the same batch must miss, and a `commit` must
        // not resurrect the row into `cache`.
        assert_eq!(cache.get(&mut tx, "account", "0xabc").await.unwrap(), None);
        cache.commit();
        assert!(!cache.has("account", "0xabc"));
    }
}
