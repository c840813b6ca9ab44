//! Dedicated connections.
//!
//! A [`DbConnection`] pins one pooled connection of an endpoint so that consecutive
//! statements share session state (temporary tables, session variables). The connection
//! goes back to the pool when it is released or dropped.

use crate::db::executor::{self, ExecResult, decode_row};
use crate::db::named::NamedQuery;
use crate::db::params::QueryParam;
use crate::db::pool::{DbPool, Endpoint};
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, Postgres, Sqlite};
use std::time::Instant;

enum ConnInner {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

/// A pooled connection held until released.
pub struct DbConnection {
    endpoint: Endpoint,
    inner: ConnInner,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("endpoint", &self.endpoint.label())
            .finish_non_exhaustive()
    }
}

impl DbConnection {
    pub(crate) async fn acquire(endpoint: Endpoint, pool: &DbPool) -> DbResult<Self> {
        let inner = match pool {
            DbPool::MySql(p) => ConnInner::MySql(p.acquire().await?),
            DbPool::Postgres(p) => ConnInner::Postgres(p.acquire().await?),
            DbPool::SQLite(p) => ConnInner::SQLite(p.acquire().await?),
        };
        Ok(Self { endpoint, inner })
    }

    /// The endpoint this connection belongs to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        let started = Instant::now();
        let result = match &mut self.inner {
            ConnInner::MySql(c) => executor::mysql::execute(&mut **c, sql, params).await,
            ConnInner::Postgres(c) => executor::postgres::execute(&mut **c, sql, params).await,
            ConnInner::SQLite(c) => executor::sqlite::execute(&mut **c, sql, params).await,
        };
        self.endpoint
            .observe("conn_execute", sql, started, &result, |r| Some(r.rows_affected));
        result
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        let started = Instant::now();
        let result = match &mut self.inner {
            ConnInner::MySql(c) => executor::mysql::fetch_all(&mut **c, sql, params).await,
            ConnInner::Postgres(c) => executor::postgres::fetch_all(&mut **c, sql, params).await,
            ConnInner::SQLite(c) => executor::sqlite::fetch_all(&mut **c, sql, params).await,
        };
        self.endpoint
            .observe("conn_query", sql, started, &result, |rows| Some(rows.len() as u64));
        result
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonRow>> {
        let started = Instant::now();
        let result = match &mut self.inner {
            ConnInner::MySql(c) => executor::mysql::fetch_optional(&mut **c, sql, params).await,
            ConnInner::Postgres(c) => {
                executor::postgres::fetch_optional(&mut **c, sql, params).await
            }
            ConnInner::SQLite(c) => executor::sqlite::fetch_optional(&mut **c, sql, params).await,
        };
        self.endpoint.observe("conn_query_row", sql, started, &result, |row| {
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

    pub async fn named_query<A: Serialize + ?Sized>(
        &mut self,
        sql: &str,
        arg: &A,
    ) -> DbResult<Vec<JsonRow>> {
        let query = NamedQuery::compile(sql, self.endpoint.driver().bind_style())?;
        let params = query.bind_args(arg)?;
        self.fetch_all(query.sql(), &params).await
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        let started = Instant::now();
        let result = match &mut self.inner {
            ConnInner::MySql(c) => c.ping().await,
            ConnInner::Postgres(c) => c.ping().await,
            ConnInner::SQLite(c) => c.ping().await,
        }
        .map_err(DbError::from);
        self.endpoint.observe("conn_ping", "", started, &result, |_| None);
        result
    }

    /// Return the connection to its pool.
    pub fn release(self) {
        drop(self);
    }
}
