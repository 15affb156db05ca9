//! Prefetch Controller: recovers every learned pattern for a batch of
//! events ahead of dispatch, resolving row-access patterns against the
//! Indexing Cache and delegating RPC-call patterns to the RPC Cache.
//!
//! Grounded on the teacher's `cache::prefetcher` (a post-flush pass that
//! warms the buffer pool for pages the workload is about to touch again)
//! generalized from pages to rows and to a second resource (RPC responses)
//! entirely, reusing the Pattern Matcher both consumers already share.

use crate::cache::IndexingCache;
use crate::codec::{canonical_key, Table};
use crate::common::{ChainId, Value};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::event::Event;
use crate::executor::Transaction;
use crate::pattern::{self, Pattern, PatternMatcher};
use crate::rpc::{RequestResultStore, RpcCache, RpcTransport};
use std::collections::{HashMap, HashSet};

fn row_pattern_table(pattern: &Pattern) -> Option<&str> {
    pattern.target.split_once("::table:").map(|(_, table)| table)
}

/// Joins a recovered call's args against `table`'s primary-key columns in
/// order, the same way `store::partial_row_cache_key` builds the key for
/// an insert — the two must agree since a row cached under one has to be
/// found under the other.
fn row_key(table: &Table, args: &[Value]) -> Result<String> {
    let indices = table.primary_key_indices();
    if indices.len() != args.len() {
        return Err(CacheError::Internal(format!(
            "recovered pattern arg count ({}) doesn't match {}'s primary key column count ({})",
            args.len(),
            table.name,
            indices.len()
        )));
    }
    let mut parts = Vec::with_capacity(args.len());
    for (idx, value) in indices.iter().zip(args.iter()) {
        parts.push(canonical_key(&table.columns[*idx], value)?);
    }
    Ok(parts.join("_"))
}

/// Recovers every row-access pattern known for `events`, sums expected
/// value per `(table, key)` across events and patterns, and bulk-fetches
/// the candidates clearing the `db_prediction_threshold` bar that the
/// cache doesn't already have an opinion about. A candidate the bulk
/// fetch doesn't return is installed as a tombstone, same as a
/// passthrough single-key miss.
pub async fn prefetch_rows<T: Transaction>(
    cache: &mut IndexingCache,
    tx: &mut T,
    events: &[Event],
    patterns: &PatternMatcher,
    config: &Config,
) -> Result<()> {
    let mut candidates: HashMap<String, HashMap<String, f64>> = HashMap::new();

    for event in events {
        for pattern in patterns.patterns_for(&event.name) {
            let Some(table) = row_pattern_table(&pattern) else { continue };
            let Some(table_desc) = cache.schema().get(table) else { continue };
            let Ok(call) = pattern::recover(&pattern, event) else { continue };
            let Ok(key) = row_key(table_desc, &call.args) else { continue };
            if cache.has(table, &key) {
                continue;
            }
            let ev = patterns.expected_value(&event.name, &pattern);
            *candidates.entry(table.to_string()).or_default().entry(key).or_insert(0.0) += ev;
        }
    }

    for (table, keys) in candidates {
        let wanted: Vec<String> =
            keys.into_iter().filter(|(_, ev)| *ev > config.db_prediction_threshold).map(|(key, _)| key).collect();
        if wanted.is_empty() {
            continue;
        }
        let table_desc = cache.schema().get(&table).expect("validated during candidate collection").clone();
        let found = tx.select_many(&table_desc, &wanted).await?;
        let found_keys: HashSet<String> = found.iter().map(|(key, _)| key.clone()).collect();
        for (key, row) in found {
            cache.install_spillover(&table, &key, Some(row));
        }
        for key in wanted {
            if !found_keys.contains(&key) {
                cache.install_spillover(&table, &key, None);
            }
        }
    }

    Ok(())
}

/// Runs row prefetch followed by RPC prefetch for one batch of events,
/// against the same `PatternMatcher` both share.
pub async fn run<Tx, Rt, Rs>(
    cache: &mut IndexingCache,
    tx: &mut Tx,
    rpc_cache: &RpcCache<Rt, Rs>,
    chain_id: ChainId,
    events: &[Event],
    patterns: &PatternMatcher,
    config: &Config,
) -> Result<()>
where
    Tx: Transaction,
    Rt: RpcTransport + 'static,
    Rs: RequestResultStore + 'static,
{
    prefetch_rows(cache, tx, events, patterns, config).await?;
    rpc_cache.prefetch(chain_id, events, patterns).await?;
    Ok(())
}

/// Triggers the cache's byte-budget eviction immediately after a flush,
/// rather than waiting for the batch's own commit — the rows prefetch
/// just installed via `install_spillover` count against the same budget.
pub fn evict_after_flush(cache: &mut IndexingCache) {
    cache.evict_if_over_budget();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Column, ColumnType, Schema};
    use crate::common::PartialRow;
    use crate::event::{EventVariant, TransferData};
    use crate::executor::mock::MockExecutor;
    use crate::executor::Executor;
    use crate::pattern::PatternMatcher;
    use crate::store::HistoricalIndexingStore;

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

    fn transfer_event(checkpoint: &str, from: &str, to: &str) -> Event {
        Event {
            chain_id: 1,
            checkpoint: checkpoint.to_string(),
            name: "Transfer".to_string(),
            variant: EventVariant::Transfer(TransferData { from: from.to_string(), to: to.to_string() }),
            args: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn row_prefetch_installs_spillover_for_predicted_key() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.set("account", "bob", &insert_patch("bob", 10), false).unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();

        let mut matcher = PatternMatcher::new(1, 10);
        let e1 = transfer_event("1-0", "alice", "bob");
        let e2 = transfer_event("2-0", "alice", "bob");
        {
            let mut store = HistoricalIndexingStore::with_pattern_context(&mut cache, &mut tx, &mut matcher, &e1);
            store.find("account", "bob").await.unwrap();
        }
        {
            let mut store = HistoricalIndexingStore::with_pattern_context(&mut cache, &mut tx, &mut matcher, &e2);
            store.find("account", "bob").await.unwrap();
        }

        let predicted = transfer_event("3-0", "carol", "dave");
        assert!(!cache.has("account", "dave"));
        prefetch_rows(&mut cache, &mut tx, &[predicted], &matcher, &Config::default()).await.unwrap();
        assert!(cache.has("account", "dave"));
    }

    #[tokio::test]
    async fn low_expected_value_pattern_is_not_prefetched() {
        let mut cache = IndexingCache::new(account_schema(), Config::default(), false);
        let executor = MockExecutor::new();
        let mut tx = executor.begin().await.unwrap();
        cache.set("account", "bob", &insert_patch("bob", 10), false).unwrap();
        cache.flush(&mut tx).await.unwrap();
        cache.commit();

        let mut matcher = PatternMatcher::new(1, 10);
        let e1 = transfer_event("1-0", "alice", "bob");
        {
            let mut store = HistoricalIndexingStore::with_pattern_context(&mut cache, &mut tx, &mut matcher, &e1);
            store.find("account", "bob").await.unwrap();
        }

        let predicted = transfer_event("2-0", "carol", "dave");
        prefetch_rows(&mut cache, &mut tx, &[predicted], &matcher, &Config::default()).await.unwrap();
        assert!(!cache.has("account", "dave"));
    }
}
