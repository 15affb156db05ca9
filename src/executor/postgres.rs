//! The concrete `Executor`/`Transaction` implementation over `sqlx`'s
//! Postgres driver: the only place this crate issues real SQL.
//!
//! Every non-insert column is read back via a server-side `::text` cast so
//! a single decode path (`codec::from_sql_text`) covers every column type,
//! including the two (`Point`, `Line`) this crate encodes itself rather
//! than handing to a native Postgres geometric type — the schema DSL is an
//! external collaborator and is free to declare those columns as plain
//! `text`.

use crate::codec::{from_sql_text, Table};
use crate::common::Row;
use crate::error::{CacheError, Result};
use crate::executor::{render_copy_stream, BufferedRow, Executor, Transaction};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

fn column_list(table: &Table) -> String {
    table.columns.iter().map(|c| format!("\"{}\"", c.name)).collect::<Vec<_>>().join(", ")
}

fn primary_key_predicate(table: &Table, param_offset: usize) -> String {
    table
        .primary_key_indices()
        .iter()
        .enumerate()
        .map(|(i, &idx)| format!("\"{}\" = ${}", table.columns[idx].name, param_offset + i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn row_from_pg(table: &Table, row: &sqlx::postgres::PgRow) -> Result<Row> {
    use sqlx::Row as _;
    let mut values = Vec::with_capacity(table.columns.len());
    for (idx, column) in table.columns.iter().enumerate() {
        let text: Option<String> = row.try_get(idx).map_err(CacheError::Database)?;
        values.push(from_sql_text(column, text.as_deref())?);
    }
    Ok(Row::new(values))
}

/// Owns the pool; `begin` hands out one `PostgresTransaction` per batch.
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(CacheError::Database)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Executor for PostgresExecutor {
    type Tx<'a> = PostgresTransaction<'a>;

    async fn begin(&self) -> Result<Self::Tx<'_>> {
        let tx = self.pool.begin().await.map_err(CacheError::Database)?;
        Ok(PostgresTransaction { tx })
    }
}

pub struct PostgresTransaction<'a> {
    tx: sqlx::Transaction<'a, Postgres>,
}

#[async_trait]
impl<'a> Transaction for PostgresTransaction<'a> {
    async fn copy_insert(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let statement = format!("COPY {} ({}) FROM STDIN", table.qualified_name(), column_list(table));
        let data = render_copy_stream(table, rows)?;
        let mut copy_in = self.tx.copy_in_raw(&statement).await.map_err(|e| classify_copy_error(table, e))?;
        copy_in.send(data.into_bytes()).await.map_err(|e| classify_copy_error(table, e))?;
        copy_in.finish().await.map_err(|e| classify_copy_error(table, e))?;
        Ok(())
    }

    async fn copy_update(&mut self, table: &Table, rows: &[BufferedRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let temp_table = format!("indexing_cache_update_{}", table.name);
        let create = format!(
            "CREATE TEMP TABLE \"{temp_table}\" (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            table.qualified_name()
        );
        sqlx::query(&create).execute(&mut *self.tx).await.map_err(CacheError::Database)?;

        let copy_statement = format!("COPY \"{temp_table}\" ({}) FROM STDIN", column_list(table));
        let data = render_copy_stream(table, rows)?;
        let mut copy_in = self.tx.copy_in_raw(&copy_statement).await.map_err(|e| classify_copy_error(table, e))?;
        copy_in.send(data.into_bytes()).await.map_err(|e| classify_copy_error(table, e))?;
        copy_in.finish().await.map_err(|e| classify_copy_error(table, e))?;

        let assignments: Vec<String> = table
            .columns
            .iter()
            .filter(|c| !c.primary_key)
            .map(|c| format!("\"{}\" = source.\"{}\"", c.name, c.name))
            .collect();
        let key_predicate: Vec<String> = table
            .primary_key_indices()
            .iter()
            .map(|&idx| format!("target.\"{}\" = source.\"{}\"", table.columns[idx].name, table.columns[idx].name))
            .collect();
        let update = format!(
            "UPDATE {} AS target SET {} FROM \"{temp_table}\" AS source WHERE {}",
            table.qualified_name(),
            assignments.join(", "),
            key_predicate.join(" AND "),
        );
        sqlx::query(&update).execute(&mut *self.tx).await.map_err(|e| crate::executor::classify_constraint_violation(&table.name, &e.to_string()))?;
        Ok(())
    }

    async fn select_by_key(&mut self, table: &Table, key: &str) -> Result<Option<Row>> {
        let parts: Vec<&str> = key.split('_').collect();
        let pk_indices = table.primary_key_indices();
        if parts.len() != pk_indices.len() {
            return Err(CacheError::Internal(format!("key {key:?} does not split into {} parts", pk_indices.len())));
        }
        let statement = format!(
            "SELECT {} FROM {} WHERE {}",
            table.columns.iter().map(|c| format!("\"{}\"::text", c.name)).collect::<Vec<_>>().join(", "),
            table.qualified_name(),
            primary_key_predicate(table, 0),
        );
        let mut query = sqlx::query(&statement);
        for part in &parts {
            query = query.bind(*part);
        }
        let row = query.fetch_optional(&mut *self.tx).await.map_err(CacheError::Database)?;
        match row {
            Some(row) => Ok(Some(row_from_pg(table, &row).await?)),
            None => Ok(None),
        }
    }

    async fn delete_by_key(&mut self, table: &Table, key: &str) -> Result<bool> {
        let parts: Vec<&str> = key.split('_').collect();
        let statement = format!("DELETE FROM {} WHERE {} RETURNING 1", table.qualified_name(), primary_key_predicate(table, 0));
        let mut query = sqlx::query(&statement);
        for part in &parts {
            query = query.bind(*part);
        }
        let result = query.fetch_optional(&mut *self.tx).await.map_err(CacheError::Database)?;
        Ok(result.is_some())
    }

    async fn select_many(&mut self, table: &Table, keys: &[String]) -> Result<Vec<(String, Row)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.select_by_key(table, key).await? {
                out.push((key.clone(), row));
            }
        }
        Ok(out)
    }

    async fn raw_sql(&mut self, statement: &str) -> Result<Vec<Row>> {
        use sqlx::Row as _;
        let rows = sqlx::query(statement).fetch_all(&mut *self.tx).await.map_err(CacheError::Database)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let text: Option<String> = row.try_get(idx).ok();
                values.push(text.map(crate::common::Value::Text).unwrap_or(crate::common::Value::Null));
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }
}

fn classify_copy_error(table: &Table, err: sqlx::Error) -> CacheError {
    crate::executor::classify_constraint_violation(&table.name, &err.to_string())
}
