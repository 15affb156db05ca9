//! Row Normalizer: applies defaults, `on_update` thunks, and not-null checks
//! to a partial row, producing a fully populated, column-validated `Row`.
//!
//! Pure and synchronous by construction — it never touches the database or
//! the cache. On an update, the caller (the façade, via the Indexing
//! Cache's `set`) is responsible for resolving the partial row against the
//! currently committed row; see `store` for that merge.

use crate::codec::{to_driver, Table};
use crate::common::{PartialRow, Row, Value};
use crate::error::{CacheError, Result};

/// Normalizes a partial row into a fully populated one.
///
/// `is_update` selects which absence rule applies (§4.2):
/// - insert: constant default, then default thunk, then not-null failure,
///   then null.
/// - update: on-update thunk if present, else leave unchanged (represented
///   here as `Value::Null` only if the caller's patch genuinely omitted the
///   column; updates that should preserve the existing value must include
///   it explicitly in `partial_row` — see `store::HistoricalIndexingStore`).
pub fn normalize(table: &Table, partial_row: &PartialRow, is_update: bool) -> Result<Row> {
    let mut values = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let value = match partial_row.get(&column.name) {
            Some(v) => {
                to_driver(column, v)?;
                v.clone()
            }
            None if !is_update => {
                if let Some(default) = &column.default {
                    let resolved = match default {
                        crate::codec::ColumnDefault::Constant(v) => v.clone(),
                        crate::codec::ColumnDefault::Thunk(f) => f(),
                    };
                    to_driver(column, &resolved)?;
                    resolved
                } else if column.not_null {
                    return Err(CacheError::NotNull {
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                } else {
                    Value::Null
                }
            }
            None => {
                if let Some(thunk) = &column.on_update {
                    let resolved = thunk();
                    to_driver(column, &resolved)?;
                    resolved
                } else {
                    Value::Null
                }
            }
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Column, ColumnType, Table};
    use std::sync::Arc;

    fn account_table() -> Table {
        Table::new(
            "public",
            "account",
            vec![
                Column::new("address", ColumnType::Text).primary_key(),
                Column::new("balance", ColumnType::BigInt)
                    .not_null()
                    .default_constant(Value::BigInt(0.into())),
                Column::new("nickname", ColumnType::Text),
                Column::new(
                    "touched_count",
                    ColumnType::Int,
                )
                .not_null()
                .default_constant(Value::Int(0))
                .on_update(Arc::new(|| Value::Int(1))),
            ],
        )
    }

    #[test]
    fn insert_applies_constant_default() {
        let table = account_table();
        let mut patch = PartialRow::new();
        patch.set("address", Value::Text("0xabc".into()));
        let row = normalize(&table, &patch, false).unwrap();
        assert_eq!(row.get(1), Some(&Value::BigInt(0.into())));
    }

    #[test]
    fn insert_missing_not_null_without_default_fails() {
        let table = Table::new(
            "public",
            "account",
            vec![Column::new("address", ColumnType::Text).primary_key().not_null()],
        );
        let patch = PartialRow::new();
        let err = normalize(&table, &patch, false).unwrap_err();
        assert!(matches!(err, CacheError::NotNull { .. }));
    }

    #[test]
    fn update_invokes_on_update_thunk_when_absent() {
        let table = account_table();
        let mut patch = PartialRow::new();
        patch.set("address", Value::Text("0xabc".into()));
        patch.set("balance", Value::BigInt(10.into()));
        let row = normalize(&table, &patch, true).unwrap();
        assert_eq!(row.get(3), Some(&Value::Int(1)));
    }

    #[test]
    fn update_leaves_column_without_thunk_null_when_absent() {
        let table = account_table();
        let mut patch = PartialRow::new();
        patch.set("address", Value::Text("0xabc".into()));
        let row = normalize(&table, &patch, true).unwrap();
        assert_eq!(row.get(2), Some(&Value::Null));
    }

    #[test]
    fn idempotence_without_on_update_thunks() {
        let table = Table::new(
            "public",
            "account",
            vec![
                Column::new("address", ColumnType::Text).primary_key(),
                Column::new("balance", ColumnType::BigInt).not_null().default_constant(Value::BigInt(0.into())),
            ],
        );
        let mut patch = PartialRow::new();
        patch.set("address", Value::Text("0xabc".into()));
        patch.set("balance", Value::BigInt(5.into()));
        let once = normalize(&table, &patch, false).unwrap();
        let mut as_patch = PartialRow::new();
        for (col, val) in table.columns.iter().zip(once.0.iter()) {
            as_patch.set(col.name.clone(), val.clone());
        }
        let twice = normalize(&table, &as_patch, true).unwrap();
        assert_eq!(once, twice);
    }
}
