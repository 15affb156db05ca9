//! The durable half of the RPC cache: an append-only table indexed by
//! `(chain_id, fingerprint, block_number)`, backed by `sqlx`'s Postgres
//! pool — the same driver the indexing cache's own flush protocol uses.
//!
//! Grounded on `executor::postgres::PostgresExecutor`'s connection
//! handling; the store itself is a single narrow table rather than a
//! generic schema, so it reads and writes through hand-written SQL instead
//! of going through `codec::Table`.

use crate::common::ChainId;
use crate::error::{CacheError, Result};
use crate::rpc::RequestResultStore;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

/// Backed by a table shaped like:
///
/// ```sql
/// CREATE TABLE rpc_request_results (
///     chain_id BIGINT NOT NULL,
///     fingerprint TEXT NOT NULL,
///     block_number BIGINT,
///     response TEXT NOT NULL,
///     PRIMARY KEY (chain_id, fingerprint, block_number)
/// );
/// ```
///
/// Writes are `ON CONFLICT DO NOTHING`: a response already on record for a
/// given request is immutable, matching the in-memory cache's own
/// value-once-set semantics.
pub struct PostgresRequestResultStore {
    pool: PgPool,
    table: String,
}

impl PostgresRequestResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, table: "rpc_request_results".to_string() }
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self { pool, table: table.into() }
    }
}

#[async_trait]
impl RequestResultStore for PostgresRequestResultStore {
    async fn get(&self, chain_id: ChainId, fingerprint: &str, block_number: Option<u64>) -> Result<Option<String>> {
        let statement = format!(
            "SELECT response FROM \"{}\" WHERE chain_id = $1 AND fingerprint = $2 AND block_number IS NOT DISTINCT FROM $3",
            self.table
        );
        let row = sqlx::query(&statement)
            .bind(chain_id as i64)
            .bind(fingerprint)
            .bind(block_number.map(|b| b as i64))
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::Database)?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("response").map_err(CacheError::Database)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, chain_id: ChainId, fingerprint: &str, block_number: Option<u64>, response: &str) -> Result<()> {
        let statement = format!(
            "INSERT INTO \"{}\" (chain_id, fingerprint, block_number, response) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            self.table
        );
        sqlx::query(&statement)
            .bind(chain_id as i64)
            .bind(fingerprint)
            .bind(block_number.map(|b| b as i64))
            .bind(response)
            .execute(&self.pool)
            .await
            .map_err(CacheError::Database)?;
        Ok(())
    }
}
