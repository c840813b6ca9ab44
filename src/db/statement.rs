//! Prepared statements.

use crate::db::executor::{self, ExecResult, decode_row};
use crate::db::named::NamedQuery;
use crate::db::params::QueryParam;
use crate::db::pool::Endpoint;
use crate::db::types::{ColumnInfo, JsonRow};
use crate::error::{DbError, DbResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{Either, Executor, Statement};
use std::time::Instant;

/// A statement validated by the database, re-executed through each connection's
/// statement cache.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    endpoint: Endpoint,
    sql: String,
    /// Set for statements prepared from `:name` SQL.
    names: Option<Vec<String>>,
    columns: Vec<ColumnInfo>,
    param_count: Option<usize>,
}

fn describe<'q, S: Statement<'q>>(statement: &S) -> (Vec<ColumnInfo>, Option<usize>) {
    let columns = statement
        .columns()
        .iter()
        .map(ColumnInfo::from_column)
        .collect();
    let param_count = statement.parameters().map(|p| match p {
        Either::Left(types) => types.len(),
        Either::Right(n) => n,
    });
    (columns, param_count)
}

impl PreparedStatement {
    pub(crate) async fn prepare(
        endpoint: Endpoint,
        sql: &str,
        names: Option<Vec<String>>,
    ) -> DbResult<Self> {
        let started = Instant::now();
        let described = match endpoint.pool() {
            Ok(pool) => impl_db_dispatch!(&pool, {
                MySql(p) => p.prepare(sql).await.map(|s| describe(&s)),
                Postgres(p) => p.prepare(sql).await.map(|s| describe(&s)),
                SQLite(p) => p.prepare(sql).await.map(|s| describe(&s)),
            })
            .map_err(DbError::from),
            Err(e) => Err(e),
        };
        endpoint.observe("prepare", sql, started, &described, |_| None);
        let (columns, param_count) = described?;

        Ok(Self {
            endpoint,
            sql: sql.to_string(),
            names,
            columns,
            param_count,
        })
    }

    /// The SQL sent to the database (positional form for named statements).
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Result columns; empty for statements returning no rows.
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Number of bind parameters, when the driver reports it.
    pub fn param_count(&self) -> Option<usize> {
        self.param_count
    }

    fn check_params(&self, params: &[QueryParam]) -> DbResult<()> {
        match self.param_count {
            Some(expected) if expected != params.len() => Err(DbError::invalid_input(format!(
                "statement expects {} parameters, got {}",
                expected,
                params.len()
            ))),
            _ => Ok(()),
        }
    }

    fn named_params<A: Serialize + ?Sized>(&self, arg: &A) -> DbResult<Vec<QueryParam>> {
        let names = self.names.as_ref().ok_or_else(|| {
            DbError::invalid_input("statement was not prepared from named SQL")
        })?;
        NamedQuery::from_parts(self.sql.clone(), names.clone()).bind_args(arg)
    }

    pub async fn execute(&self, params: &[QueryParam]) -> DbResult<ExecResult> {
        let started = Instant::now();
        let result = match self.check_params(params).and_then(|_| self.endpoint.pool()) {
            Ok(pool) => impl_db_dispatch!(&pool, {
                MySql(p) => executor::mysql::execute_prepared(p, &self.sql, params).await,
                Postgres(p) => executor::postgres::execute_prepared(p, &self.sql, params).await,
                SQLite(p) => executor::sqlite::execute_prepared(p, &self.sql, params).await,
            }),
            Err(e) => Err(e),
        };
        self.endpoint
            .observe("stmt_execute", &self.sql, started, &result, |r| Some(r.rows_affected));
        result
    }

    pub async fn fetch_all(&self, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let started = Instant::now();
        let result = match self.check_params(params).and_then(|_| self.endpoint.pool()) {
            Ok(pool) => impl_db_dispatch!(&pool, {
                MySql(p) => executor::mysql::fetch_all_prepared(p, &self.sql, params).await,
                Postgres(p) => executor::postgres::fetch_all_prepared(p, &self.sql, params).await,
                SQLite(p) => executor::sqlite::fetch_all_prepared(p, &self.sql, params).await,
            }),
            Err(e) => Err(e),
        };
        self.endpoint
            .observe("stmt_query", &self.sql, started, &result, |rows| Some(rows.len() as u64));
        result
    }

    pub async fn fetch_optional(&self, params: &[QueryParam]) -> DbResult<Option<JsonRow>> {
        let started = Instant::now();
        let result = match self.check_params(params).and_then(|_| self.endpoint.pool()) {
            Ok(pool) => impl_db_dispatch!(&pool, {
                MySql(p) => executor::mysql::fetch_optional_prepared(p, &self.sql, params).await,
                Postgres(p) => {
                    executor::postgres::fetch_optional_prepared(p, &self.sql, params).await
                },
                SQLite(p) => executor::sqlite::fetch_optional_prepared(p, &self.sql, params).await,
            }),
            Err(e) => Err(e),
        };
        self.endpoint.observe("stmt_query_row", &self.sql, started, &result, |row| {
            Some(u64::from(row.is_some()))
        });
        result
    }

    pub async fn get<T: DeserializeOwned>(&self, params: &[QueryParam]) -> DbResult<T> {
        let row = self
            .fetch_optional(params)
            .await?
            .ok_or_else(|| DbError::from(sqlx::Error::RowNotFound))?;
        decode_row(row)
    }

    pub async fn select<T: DeserializeOwned>(&self, params: &[QueryParam]) -> DbResult<Vec<T>> {
        self.fetch_all(params)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    /// Execute a named statement with parameters taken from `arg`.
    pub async fn named_exec<A: Serialize + ?Sized>(&self, arg: &A) -> DbResult<ExecResult> {
        let params = self.named_params(arg)?;
        self.execute(&params).await
    }

    /// Query a named statement with parameters taken from `arg`.
    pub async fn named_query<A: Serialize + ?Sized>(&self, arg: &A) -> DbResult<Vec<JsonRow>> {
        let params = self.named_params(arg)?;
        self.fetch_all(&params).await
    }
}
