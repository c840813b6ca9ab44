//! Transactions on the master endpoint.
//!
//! A [`DbTransaction`] holds one pooled connection until it is committed or rolled back.
//! Dropping it without either rolls the work back.

use crate::db::executor::{self, ExecResult, decode_row};
use crate::db::named::NamedQuery;
use crate::db::params::QueryParam;
use crate::db::pool::{DbPool, Endpoint};
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::time::Instant;
use tracing::debug;

/// SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for [`Endpoint::begin_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// `None` keeps the server default.
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// `SET TRANSACTION ...` for these options; `None` for the defaults.
    fn set_transaction_sql(&self) -> Option<String> {
        let mut modes = Vec::with_capacity(2);
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }
        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

enum TxInner {
    MySql(Transaction<'static, MySql>),
    /// Transaction characteristics in MySQL must be set before `START TRANSACTION`, so
    /// these are driven by hand on a plain pooled connection.
    MySqlManual(PoolConnection<MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

/// Database-specific transaction wrapper.
pub struct DbTransaction {
    endpoint: Endpoint,
    inner: Option<TxInner>,
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction")
            .field("endpoint", &self.endpoint.label())
            .field("active", &self.inner.is_some())
            .finish()
    }
}

impl DbTransaction {
    pub(crate) async fn begin(
        endpoint: Endpoint,
        pool: &DbPool,
        options: TxOptions,
    ) -> DbResult<Self> {
        let inner = match pool {
            DbPool::MySql(p) => match options.set_transaction_sql() {
                None => TxInner::MySql(p.begin().await?),
                Some(set) => {
                    let mut conn = p.acquire().await?;
                    let started = async {
                        executor::mysql::execute(&mut *conn, &set, &[]).await?;
                        executor::mysql::execute(&mut *conn, "START TRANSACTION", &[]).await
                    }
                    .await;
                    if let Err(e) = started {
                        // Pending characteristics would leak into the next borrower.
                        drop(conn.detach());
                        return Err(e);
                    }
                    TxInner::MySqlManual(conn)
                }
            },
            DbPool::Postgres(p) => {
                let mut tx = p.begin().await?;
                if let Some(set) = options.set_transaction_sql() {
                    executor::postgres::execute(&mut *tx, &set, &[]).await?;
                }
                TxInner::Postgres(tx)
            }
            DbPool::SQLite(p) => {
                let supported = !options.read_only
                    && matches!(options.isolation, None | Some(IsolationLevel::Serializable));
                if !supported {
                    return Err(DbError::invalid_input(
                        "sqlite transactions are always serializable and read-write",
                    ));
                }
                TxInner::SQLite(p.begin().await?)
            }
        };
        debug!(endpoint = %endpoint.label(), options = ?options, "Transaction started");
        Ok(Self {
            endpoint,
            inner: Some(inner),
        })
    }

    fn inner_mut(&mut self) -> DbResult<&mut TxInner> {
        self.inner
            .as_mut()
            .ok_or_else(|| DbError::transaction("transaction already finished"))
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        let started = Instant::now();
        let result = match self.inner_mut() {
            Ok(TxInner::MySql(tx)) => executor::mysql::execute(&mut **tx, sql, params).await,
            Ok(TxInner::MySqlManual(conn)) => {
                executor::mysql::execute(&mut **conn, sql, params).await
            }
            Ok(TxInner::Postgres(tx)) => executor::postgres::execute(&mut **tx, sql, params).await,
            Ok(TxInner::SQLite(tx)) => executor::sqlite::execute(&mut **tx, sql, params).await,
            Err(e) => Err(e),
        };
        self.endpoint
            .observe("tx_execute", sql, started, &result, |r| Some(r.rows_affected));
        result
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        let started = Instant::now();
        let result = match self.inner_mut() {
            Ok(TxInner::MySql(tx)) => executor::mysql::fetch_all(&mut **tx, sql, params).await,
            Ok(TxInner::MySqlManual(conn)) => {
                executor::mysql::fetch_all(&mut **conn, sql, params).await
            }
            Ok(TxInner::Postgres(tx)) => {
                executor::postgres::fetch_all(&mut **tx, sql, params).await
            }
            Ok(TxInner::SQLite(tx)) => executor::sqlite::fetch_all(&mut **tx, sql, params).await,
            Err(e) => Err(e),
        };
        self.endpoint
            .observe("tx_query", sql, started, &result, |rows| Some(rows.len() as u64));
        result
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonRow>> {
        let started = Instant::now();
        let result = match self.inner_mut() {
            Ok(TxInner::MySql(tx)) => {
                executor::mysql::fetch_optional(&mut **tx, sql, params).await
            }
            Ok(TxInner::MySqlManual(conn)) => {
                executor::mysql::fetch_optional(&mut **conn, sql, params).await
            }
            Ok(TxInner::Postgres(tx)) => {
                executor::postgres::fetch_optional(&mut **tx, sql, params).await
            }
            Ok(TxInner::SQLite(tx)) => {
                executor::sqlite::fetch_optional(&mut **tx, sql, params).await
            }
            Err(e) => Err(e),
        };
        self.endpoint.observe("tx_query_row", sql, started, &result, |row| {
            Some(u64::from(row.is_some()))
        });
        result
    }

    pub async fn fetch_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<JsonRow> {
        self.fetch_optional(sql, params)
            .await?
            .ok_or_else(|| DbError::from(sqlx::Error::RowNotFound))
    }

    pub async fn get<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<T> {
        decode_row(self.fetch_one(sql, params).await?)
    }

    pub async fn select<T: DeserializeOwned>(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        self.fetch_all(sql, params)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    pub async fn named_exec<A: Serialize + ?Sized>(
        &mut self,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        let query = NamedQuery::compile(sql, self.endpoint.driver().bind_style())?;
        let params = query.bind_args(arg)?;
        self.execute(query.sql(), &params).await
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> DbResult<()> {
        let started = Instant::now();
        let result = match self.inner.take() {
            Some(TxInner::MySql(tx)) => tx.commit().await.map_err(DbError::from),
            Some(TxInner::MySqlManual(mut conn)) => {
                let result = executor::mysql::execute(&mut *conn, "COMMIT", &[]).await;
                if result.is_err() {
                    drop(conn.detach());
                }
                result.map(|_| ())
            }
            Some(TxInner::Postgres(tx)) => tx.commit().await.map_err(DbError::from),
            Some(TxInner::SQLite(tx)) => tx.commit().await.map_err(DbError::from),
            None => Err(DbError::transaction("transaction already finished")),
        };
        self.endpoint.observe("commit", "COMMIT", started, &result, |_| None);
        result
    }

    /// Rollback the transaction.
    pub async fn rollback(mut self) -> DbResult<()> {
        let started = Instant::now();
        let result = match self.inner.take() {
            Some(TxInner::MySql(tx)) => tx.rollback().await.map_err(DbError::from),
            Some(TxInner::MySqlManual(mut conn)) => {
                let result = executor::mysql::execute(&mut *conn, "ROLLBACK", &[]).await;
                if result.is_err() {
                    drop(conn.detach());
                }
                result.map(|_| ())
            }
            Some(TxInner::Postgres(tx)) => tx.rollback().await.map_err(DbError::from),
            Some(TxInner::SQLite(tx)) => tx.rollback().await.map_err(DbError::from),
            None => Err(DbError::transaction("transaction already finished")),
        };
        self.endpoint.observe("rollback", "ROLLBACK", started, &result, |_| None);
        result
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        // sqlx transactions roll back on drop; a manual one must not go back to the pool
        // mid-transaction.
        if let Some(TxInner::MySqlManual(conn)) = self.inner.take() {
            debug!(
                endpoint = %self.endpoint.label(),
                "Discarding connection of unfinished transaction"
            );
            drop(conn.detach());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_transaction_sql() {
        assert_eq!(TxOptions::default().set_transaction_sql(), None);
        assert_eq!(
            TxOptions::default()
                .isolation(IsolationLevel::RepeatableRead)
                .set_transaction_sql()
                .as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        );
        assert_eq!(
            TxOptions::default()
                .isolation(IsolationLevel::Serializable)
                .read_only()
                .set_transaction_sql()
                .as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY")
        );
        assert_eq!(
            TxOptions::default().read_only().set_transaction_sql().as_deref(),
            Some("SET TRANSACTION READ ONLY")
        );
    }
}
