//! Master/replica routing client.
//!
//! Writes, prepared statements and transactions always run on the master endpoint. Reads
//! go to a replica picked round-robin, or to the master when no replica is configured.

use crate::config::DatabaseConfig;
use crate::db::connection::DbConnection;
use crate::db::driver::DriverType;
use crate::db::executor::ExecResult;
use crate::db::instrument::{Instrumentation, QueryLogger};
use crate::db::named::{self, InArg};
use crate::db::params::QueryParam;
use crate::db::pool::{Endpoint, EndpointRole, PoolStats};
use crate::db::statement::PreparedStatement;
use crate::db::transaction::{DbTransaction, TxOptions};
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const REPLICA_FALLBACK_WARNING: &str =
    "fallback to master database due to the empty replica database list";

/// Replica index for the `next` value of the rotation counter.
///
/// With two or more replicas the rotation covers indexes `1..replicas` only; index 0 is
/// reached solely when it is the only replica.
pub fn replica_index(next: u64, replicas: usize) -> usize {
    if replicas <= 1 {
        return 0;
    }
    1 + (next % (replicas as u64 - 1)) as usize
}

/// Pool statistics of every endpoint of a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub master: PoolStats,
    pub replicas: Vec<PoolStats>,
}

/// Routing database client for one logical database.
pub struct Router {
    config: DatabaseConfig,
    driver: DriverType,
    instrumentation: Instrumentation,
    master: Option<Endpoint>,
    replicas: Vec<Endpoint>,
    next_replica: AtomicU64,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.config.name)
            .field("driver", &self.driver)
            .field("master", &self.master)
            .field("replicas", &self.replicas)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create an unconnected router logging queries through `tracing`.
    pub fn new(config: DatabaseConfig) -> DbResult<Self> {
        Self::build(config, Instrumentation::default())
    }

    /// Create an unconnected router reporting queries to `logger`.
    pub fn with_logger(config: DatabaseConfig, logger: Arc<dyn QueryLogger>) -> DbResult<Self> {
        Self::build(config, Instrumentation::new(logger))
    }

    fn build(config: DatabaseConfig, instrumentation: Instrumentation) -> DbResult<Self> {
        let config = config.with_defaults();
        config.validate()?;
        let driver = config.driver.parse()?;
        Ok(Self {
            config,
            driver,
            instrumentation,
            master: None,
            replicas: Vec::new(),
            next_replica: AtomicU64::new(0),
        })
    }

    /// Connect the master and every replica, pinging each one.
    pub async fn connect(&mut self) -> DbResult<()> {
        self.ensure_unconnected()?;
        let mut endpoints = Vec::with_capacity(self.config.replica_uris.len() + 1);
        for (role, uri) in self.endpoint_uris() {
            match Endpoint::connect(role, &self.config, &uri, self.instrumentation.clone()).await {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    close_quietly(&endpoints).await;
                    return Err(e);
                }
            }
        }
        self.install(endpoints);
        Ok(())
    }

    /// Create the master and replica pools without opening connections.
    pub async fn open(&mut self) -> DbResult<()> {
        self.ensure_unconnected()?;
        let mut endpoints = Vec::with_capacity(self.config.replica_uris.len() + 1);
        for (role, uri) in self.endpoint_uris() {
            match Endpoint::open(role, &self.config, &uri, self.instrumentation.clone()) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    close_quietly(&endpoints).await;
                    return Err(e);
                }
            }
        }
        self.install(endpoints);
        Ok(())
    }

    fn ensure_unconnected(&self) -> DbResult<()> {
        if self.master.is_some() {
            return Err(DbError::connection(
                format!("database '{}' is already connected", self.config.name),
                "Use the existing client",
            ));
        }
        Ok(())
    }

    fn endpoint_uris(&self) -> Vec<(EndpointRole, String)> {
        std::iter::once((EndpointRole::Master, self.config.uri.clone()))
            .chain(
                self.config
                    .replica_uris
                    .iter()
                    .enumerate()
                    .map(|(i, uri)| (EndpointRole::Replica(i), uri.clone())),
            )
            .collect()
    }

    fn install(&mut self, endpoints: Vec<Endpoint>) {
        let mut endpoints = endpoints.into_iter();
        self.master = endpoints.next();
        self.replicas = endpoints.collect();
        info!(
            database = %self.config.name,
            driver = %self.driver,
            replicas = self.replicas.len(),
            "Database client ready"
        );
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn driver(&self) -> DriverType {
        self.driver
    }

    pub fn master(&self) -> DbResult<&Endpoint> {
        self.master.as_ref().ok_or_else(|| {
            DbError::connection(
                format!("database '{}' is not connected", self.config.name),
                "Call connect() or open() first",
            )
        })
    }

    pub fn replicas(&self) -> &[Endpoint] {
        &self.replicas
    }

    /// The endpoint serving the next read.
    pub fn replica(&self) -> DbResult<&Endpoint> {
        let master = self.master()?;
        match self.replicas.len() {
            0 => {
                self.instrumentation.warning(REPLICA_FALLBACK_WARNING);
                Ok(master)
            }
            1 => Ok(&self.replicas[0]),
            n => {
                let next = self.next_replica.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                Ok(&self.replicas[replica_index(next, n)])
            }
        }
    }

    fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.master.iter().chain(self.replicas.iter())
    }

    // Write path

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        self.master()?.execute(sql, params).await
    }

    pub async fn named_exec<A: Serialize + ?Sized>(
        &self,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        self.master()?.named_exec(sql, arg).await
    }

    pub async fn prepare(&self, sql: &str) -> DbResult<PreparedStatement> {
        self.master()?.prepare(sql).await
    }

    pub async fn prepare_named(&self, sql: &str) -> DbResult<PreparedStatement> {
        self.master()?.prepare_named(sql).await
    }

    pub async fn begin(&self) -> DbResult<DbTransaction> {
        self.master()?.begin().await
    }

    pub async fn begin_with(&self, options: TxOptions) -> DbResult<DbTransaction> {
        self.master()?.begin_with(options).await
    }

    /// Pin a master connection.
    pub async fn conn(&self) -> DbResult<DbConnection> {
        self.master()?.acquire().await
    }

    // Read path

    pub async fn get<T: DeserializeOwned>(&self, sql: &str, params: &[QueryParam]) -> DbResult<T> {
        self.replica()?.get(sql, params).await
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        self.replica()?.select(sql, params).await
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        self.replica()?.fetch_all(sql, params).await
    }

    pub async fn query_row(&self, sql: &str, params: &[QueryParam]) -> DbResult<JsonRow> {
        self.replica()?.fetch_one(sql, params).await
    }

    pub async fn query_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonRow>> {
        self.replica()?.fetch_optional(sql, params).await
    }

    pub async fn named_query<A: Serialize + ?Sized>(
        &self,
        sql: &str,
        arg: &A,
    ) -> DbResult<Vec<JsonRow>> {
        self.replica()?.named_query(sql, arg).await
    }

    /// Run a `?` query whose list arguments expand into one bindvar per element.
    pub async fn query_in(&self, sql: &str, args: &[InArg]) -> DbResult<Vec<JsonRow>> {
        let (sql, params) = self.expand_in(sql, args)?;
        self.replica()?.fetch_all(&sql, &params).await
    }

    pub async fn select_in<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[InArg],
    ) -> DbResult<Vec<T>> {
        let (sql, params) = self.expand_in(sql, args)?;
        self.replica()?.select(&sql, &params).await
    }

    /// Pin a connection of the endpoint serving the next read.
    pub async fn read_conn(&self) -> DbResult<DbConnection> {
        self.replica()?.acquire().await
    }

    // Lifecycle

    /// Close the master, then every replica. Every endpoint is attempted; the first
    /// failure is returned.
    pub async fn close(&self) -> DbResult<()> {
        let master = self.master()?;
        let mut first_error = None;
        for endpoint in std::iter::once(master).chain(self.replicas.iter()) {
            if let Err(e) = endpoint.close().await {
                warn!(endpoint = %endpoint.role(), error = %e, "Failed to close endpoint");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ping the master, then every replica.
    pub async fn ping(&self) -> DbResult<()> {
        for endpoint in std::iter::once(self.master()?).chain(self.replicas.iter()) {
            endpoint.ping().await.map_err(|e| {
                DbError::connection(
                    format!("unable to ping '{}', error: {}", endpoint.uri(), e),
                    e.suggestion()
                        .unwrap_or("Check that the database is reachable")
                        .to_string(),
                )
            })?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DbResult<RouterStats> {
        Ok(RouterStats {
            master: self.master()?.stats(),
            replicas: self.replicas.iter().map(Endpoint::stats).collect(),
        })
    }

    pub fn set_max_idle_conns(&self, n: u32) {
        self.endpoints().for_each(|e| e.set_max_idle_conns(n));
    }

    pub fn set_max_open_conns(&self, n: u32) {
        self.endpoints().for_each(|e| e.set_max_open_conns(n));
    }

    pub fn set_conn_max_lifetime(&self, d: Option<Duration>) {
        self.endpoints().for_each(|e| e.set_conn_max_lifetime(d));
    }

    pub fn set_conn_max_idle_time(&self, d: Option<Duration>) {
        self.endpoints().for_each(|e| e.set_conn_max_idle_time(d));
    }

    /// Rewrite `?` bindvars into this database's bindvar style.
    pub fn rebind(&self, sql: &str) -> String {
        named::rebind(sql, self.driver.bind_style())
    }

    /// Expand list arguments and write the result in this database's bindvar style.
    pub fn expand_in(&self, sql: &str, args: &[InArg]) -> DbResult<(String, Vec<QueryParam>)> {
        named::expand_in(sql, args, self.driver.bind_style())
    }

    /// A view of this router whose operations fail with a timeout once `timeout` elapses.
    pub fn with_timeout(&self, timeout: Duration) -> Deadline<'_> {
        Deadline {
            router: self,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }
}

async fn close_quietly(endpoints: &[Endpoint]) {
    for endpoint in endpoints {
        if let Err(e) = endpoint.close().await {
            warn!(
                endpoint = %endpoint.role(),
                error = %e,
                "Failed to close endpoint after connect error"
            );
        }
    }
}

/// Deadline-bound operations of a [`Router`]. The in-flight statement is cancelled when
/// the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct Deadline<'a> {
    router: &'a Router,
    timeout: Duration,
    deadline: Instant,
}

impl Deadline<'_> {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    async fn run<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = DbResult<T>>,
    ) -> DbResult<T> {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timed_out(operation, self.timeout)),
        }
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        self.run("execute", self.router.execute(sql, params)).await
    }

    pub async fn named_exec<A: Serialize + ?Sized>(
        &self,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        self.run("named_exec", self.router.named_exec(sql, arg)).await
    }

    pub async fn prepare(&self, sql: &str) -> DbResult<PreparedStatement> {
        self.run("prepare", self.router.prepare(sql)).await
    }

    pub async fn prepare_named(&self, sql: &str) -> DbResult<PreparedStatement> {
        self.run("prepare_named", self.router.prepare_named(sql)).await
    }

    pub async fn begin(&self) -> DbResult<DbTransaction> {
        self.run("begin", self.router.begin()).await
    }

    pub async fn begin_with(&self, options: TxOptions) -> DbResult<DbTransaction> {
        self.run("begin", self.router.begin_with(options)).await
    }

    pub async fn conn(&self) -> DbResult<DbConnection> {
        self.run("conn", self.router.conn()).await
    }

    pub async fn get<T: DeserializeOwned>(&self, sql: &str, params: &[QueryParam]) -> DbResult<T> {
        self.run("get", self.router.get(sql, params)).await
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        self.run("select", self.router.select(sql, params)).await
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        self.run("query", self.router.query(sql, params)).await
    }

    pub async fn query_row(&self, sql: &str, params: &[QueryParam]) -> DbResult<JsonRow> {
        self.run("query_row", self.router.query_row(sql, params)).await
    }

    pub async fn query_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<JsonRow>> {
        self.run("query_optional", self.router.query_optional(sql, params))
            .await
    }

    pub async fn named_query<A: Serialize + ?Sized>(
        &self,
        sql: &str,
        arg: &A,
    ) -> DbResult<Vec<JsonRow>> {
        self.run("named_query", self.router.named_query(sql, arg)).await
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.run("ping", self.router.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_index_small_lists() {
        assert_eq!(replica_index(1, 0), 0);
        assert_eq!(replica_index(7, 1), 0);
    }

    #[test]
    fn test_replica_index_skips_first_replica() {
        let picks: Vec<usize> = (1..=6).map(|next| replica_index(next, 3)).collect();
        assert_eq!(picks, vec![2, 1, 2, 1, 2, 1]);
        assert!((1..1000).all(|next| replica_index(next, 4) != 0));
    }

    #[test]
    fn test_replica_index_counter_wraps() {
        assert_eq!(replica_index(u64::MAX, 2), 1);
        assert_eq!(replica_index(0u64.wrapping_add(1), 2), 1);
    }

    #[test]
    fn test_new_rejects_unknown_driver() {
        let config = DatabaseConfig::new("main", "oracle", "oracle://db/catalog");
        assert!(matches!(Router::new(config), Err(DbError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let config = DatabaseConfig::new("main", "sqlite", "sqlite::memory:");
        let router = Router::new(config).unwrap();
        assert!(matches!(router.replica(), Err(DbError::Connection { .. })));
        assert!(router.execute("SELECT 1", &[]).await.is_err());
        assert!(router.conn().await.is_err());
        assert!(router.stats().is_err());
        assert!(router.close().await.is_err());
    }

    #[test]
    fn test_rebind_follows_driver() {
        let pg_config = DatabaseConfig::new("main", "postgres", "postgres://app@db/catalog");
        let pg = Router::new(pg_config).unwrap();
        assert_eq!(
            pg.rebind("SELECT * FROM product WHERE id = ? AND price < ?"),
            "SELECT * FROM product WHERE id = $1 AND price < $2"
        );
        let (sql, params) = pg
            .expand_in("SELECT * FROM product WHERE id IN (?)", &[InArg::list([1, 2])])
            .unwrap();
        assert_eq!(sql, "SELECT * FROM product WHERE id IN ($1, $2)");
        assert_eq!(params.len(), 2);

        let my_config = DatabaseConfig::new("main", "mysql", "mysql://app@db/catalog");
        let my = Router::new(my_config).unwrap();
        assert_eq!(my.rebind("SELECT ?"), "SELECT ?");
    }
}
