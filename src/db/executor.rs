//! Per-driver statement execution.
//!
//! Each driver module exposes the same functions, generic over any sqlx executor of that
//! driver, so pools, pooled connections and transactions share one code path:
//! - `execute` / `fetch_all` / `fetch_optional`: raw SQL when there are no parameters
//!   (multi-statement scripts and DDL stay off the prepared path), bound query otherwise.
//! - `execute_prepared` / `fetch_all_prepared` / `fetch_optional_prepared`: always a bound
//!   query, so the statement lands in the connection's statement cache.

use crate::db::types::JsonRow;
use serde::Serialize;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Generated key of the last inserted row (MySQL `LAST_INSERT_ID()`, SQLite rowid).
    pub last_insert_id: Option<i64>,
}

fn mysql_last_insert_id(result: &sqlx::mysql::MySqlQueryResult) -> Option<i64> {
    i64::try_from(result.last_insert_id())
        .ok()
        .filter(|id| *id != 0)
}

fn postgres_last_insert_id(_result: &sqlx::postgres::PgQueryResult) -> Option<i64> {
    // Postgres reports generated keys through RETURNING only
    None
}

fn sqlite_last_insert_id(result: &sqlx::sqlite::SqliteQueryResult) -> Option<i64> {
    Some(result.last_insert_rowid()).filter(|id| *id != 0)
}

macro_rules! driver_executor {
    ($module:ident, $db:ty, $bind:path, $last_insert_id:path) => {
        pub(crate) mod $module {
            use super::ExecResult;
            use crate::db::params::QueryParam;
            use crate::db::types::{JsonRow, RowToJson};
            use crate::error::DbResult;
            use sqlx::Executor;

            pub async fn execute<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<ExecResult>
            where
                E: Executor<'e, Database = $db>,
            {
                if params.is_empty() {
                    let result = executor.execute(sql).await?;
                    return Ok(ExecResult {
                        rows_affected: result.rows_affected(),
                        last_insert_id: $last_insert_id(&result),
                    });
                }
                execute_prepared(executor, sql, params).await
            }

            pub async fn execute_prepared<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<ExecResult>
            where
                E: Executor<'e, Database = $db>,
            {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = $bind(query, param);
                }
                let result = query.execute(executor).await?;
                Ok(ExecResult {
                    rows_affected: result.rows_affected(),
                    last_insert_id: $last_insert_id(&result),
                })
            }

            pub async fn fetch_all<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<Vec<JsonRow>>
            where
                E: Executor<'e, Database = $db>,
            {
                if params.is_empty() {
                    let rows = executor.fetch_all(sql).await?;
                    return Ok(rows.iter().map(RowToJson::to_json_row).collect());
                }
                fetch_all_prepared(executor, sql, params).await
            }

            pub async fn fetch_all_prepared<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<Vec<JsonRow>>
            where
                E: Executor<'e, Database = $db>,
            {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = $bind(query, param);
                }
                let rows = query.fetch_all(executor).await?;
                Ok(rows.iter().map(RowToJson::to_json_row).collect())
            }

            pub async fn fetch_optional<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<Option<JsonRow>>
            where
                E: Executor<'e, Database = $db>,
            {
                if params.is_empty() {
                    let row = executor.fetch_optional(sql).await?;
                    return Ok(row.as_ref().map(RowToJson::to_json_row));
                }
                fetch_optional_prepared(executor, sql, params).await
            }

            pub async fn fetch_optional_prepared<'e, E>(
                executor: E,
                sql: &'e str,
                params: &'e [QueryParam],
            ) -> DbResult<Option<JsonRow>>
            where
                E: Executor<'e, Database = $db>,
            {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = $bind(query, param);
                }
                let row = query.fetch_optional(executor).await?;
                Ok(row.as_ref().map(RowToJson::to_json_row))
            }
        }
    };
}

driver_executor!(
    mysql,
    sqlx::MySql,
    crate::db::params::bind_mysql_param,
    super::mysql_last_insert_id
);
driver_executor!(
    postgres,
    sqlx::Postgres,
    crate::db::params::bind_postgres_param,
    super::postgres_last_insert_id
);
driver_executor!(
    sqlite,
    sqlx::Sqlite,
    crate::db::params::bind_sqlite_param,
    super::sqlite_last_insert_id
);

/// Deserialize a decoded row into `T`.
///
/// Structs and maps deserialize from the whole row. When that fails and the row has a
/// single column, the column value itself is tried so `SELECT COUNT(*)` reads into `i64`.
pub fn decode_row<T: serde::de::DeserializeOwned>(row: JsonRow) -> crate::error::DbResult<T> {
    let single = if row.len() == 1 {
        row.values().next().cloned()
    } else {
        None
    };
    match serde_json::from_value(serde_json::Value::Object(row)) {
        Ok(value) => Ok(value),
        Err(row_err) => match single {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                crate::error::DbError::decode(format!("unable to decode row: {row_err}; {e}"))
            }),
            None => Err(crate::error::DbError::decode(format!(
                "unable to decode row: {row_err}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn row(value: serde_json::Value) -> JsonRow {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Product {
        id: i64,
        name: String,
        price: f64,
    }

    #[test]
    fn test_decode_row_into_struct() {
        let product: Product =
            decode_row(row(json!({"id": 1, "name": "Sneaker", "price": 59.9}))).unwrap();
        assert_eq!(
            product,
            Product {
                id: 1,
                name: "Sneaker".into(),
                price: 59.9
            }
        );
    }

    #[test]
    fn test_decode_row_single_column_scalar() {
        let count: i64 = decode_row(row(json!({"COUNT(*)": 3}))).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_decode_row_mismatch() {
        let err = decode_row::<Product>(row(json!({"id": "x", "name": 1}))).unwrap_err();
        assert!(matches!(err, crate::error::DbError::Decode { .. }));
    }
}
