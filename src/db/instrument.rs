//! Query instrumentation.
//!
//! Every statement an endpoint runs is reported to a [`QueryLogger`]. Logger failures are
//! reported through `tracing` and never reach the caller of the query.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable selecting the deployment environment.
pub const APP_ENV_VAR: &str = "APP_ENV";

/// Value of [`APP_ENV_VAR`] that enables debug-level query logging.
pub const DEVELOPMENT_ENV: &str = "development";

/// One executed statement.
#[derive(Debug, Clone)]
pub struct QueryEvent<'a> {
    /// `master` or `replica[i]`
    pub endpoint: &'a str,
    /// OpenTelemetry `db.system` of the endpoint's driver.
    pub db_system: &'static str,
    pub operation: &'static str,
    pub sql: &'a str,
    pub elapsed: Duration,
    /// Rows returned or affected, when known.
    pub rows: Option<u64>,
    pub error: Option<String>,
}

/// Error raised by a logger implementation.
#[derive(Debug, thiserror::Error)]
#[error("query logger failed: {0}")]
pub struct LoggerError(pub String);

/// Sink for query events.
pub trait QueryLogger: Send + Sync {
    fn on_query(&self, event: &QueryEvent<'_>) -> Result<(), LoggerError>;

    fn on_warning(&self, message: &str) -> Result<(), LoggerError>;
}

/// Log level applied to query events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLogLevel {
    Debug,
    Info,
}

impl QueryLogLevel {
    /// Debug in development (or when `APP_ENV` is unset), info everywhere else.
    pub fn for_environment(app_env: Option<&str>) -> Self {
        match app_env {
            None => Self::Debug,
            Some(env) if env.is_empty() || env == DEVELOPMENT_ENV => Self::Debug,
            Some(_) => Self::Info,
        }
    }

    pub fn from_env() -> Self {
        Self::for_environment(std::env::var(APP_ENV_VAR).ok().as_deref())
    }
}

/// Default logger emitting `tracing` events.
#[derive(Debug, Clone)]
pub struct TracingQueryLogger {
    level: QueryLogLevel,
}

impl TracingQueryLogger {
    pub fn new(level: QueryLogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> QueryLogLevel {
        self.level
    }
}

impl Default for TracingQueryLogger {
    fn default() -> Self {
        Self::new(QueryLogLevel::from_env())
    }
}

impl QueryLogger for TracingQueryLogger {
    fn on_query(&self, event: &QueryEvent<'_>) -> Result<(), LoggerError> {
        let elapsed_ms = event.elapsed.as_secs_f64() * 1000.0;
        if let Some(error) = &event.error {
            warn!(
                endpoint = event.endpoint,
                db.system = event.db_system,
                operation = event.operation,
                sql = event.sql,
                elapsed_ms,
                error = %error,
                "Query failed"
            );
            return Ok(());
        }
        match self.level {
            QueryLogLevel::Debug => debug!(
                endpoint = event.endpoint,
                db.system = event.db_system,
                operation = event.operation,
                sql = event.sql,
                elapsed_ms,
                rows = event.rows,
                "Query executed"
            ),
            QueryLogLevel::Info => info!(
                endpoint = event.endpoint,
                db.system = event.db_system,
                operation = event.operation,
                sql = event.sql,
                elapsed_ms,
                rows = event.rows,
                "Query executed"
            ),
        }
        Ok(())
    }

    fn on_warning(&self, message: &str) -> Result<(), LoggerError> {
        warn!("{}", message);
        Ok(())
    }
}

/// Shared handle to the active logger.
#[derive(Clone)]
pub struct Instrumentation {
    logger: Arc<dyn QueryLogger>,
}

impl Instrumentation {
    pub fn new(logger: Arc<dyn QueryLogger>) -> Self {
        Self { logger }
    }

    pub fn query(&self, event: &QueryEvent<'_>) {
        if let Err(e) = self.logger.on_query(event) {
            warn!(endpoint = event.endpoint, error = %e, "Query logger error ignored");
        }
    }

    pub fn warning(&self, message: &str) {
        if let Err(e) = self.logger.on_warning(message) {
            warn!(error = %e, "Query logger error ignored");
        }
    }
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new(Arc::new(TracingQueryLogger::default()))
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingLogger {
        calls: AtomicUsize,
    }

    impl QueryLogger for FailingLogger {
        fn on_query(&self, _event: &QueryEvent<'_>) -> Result<(), LoggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LoggerError("sink unavailable".into()))
        }

        fn on_warning(&self, _message: &str) -> Result<(), LoggerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LoggerError("sink unavailable".into()))
        }
    }

    #[test]
    fn test_level_for_environment() {
        assert_eq!(QueryLogLevel::for_environment(None), QueryLogLevel::Debug);
        assert_eq!(
            QueryLogLevel::for_environment(Some("development")),
            QueryLogLevel::Debug
        );
        assert_eq!(
            QueryLogLevel::for_environment(Some("production")),
            QueryLogLevel::Info
        );
        assert_eq!(
            QueryLogLevel::for_environment(Some("staging")),
            QueryLogLevel::Info
        );
    }

    #[test]
    fn test_logger_errors_are_swallowed() {
        let logger = Arc::new(FailingLogger {
            calls: AtomicUsize::new(0),
        });
        let instrumentation = Instrumentation::new(logger.clone());
        instrumentation.query(&QueryEvent {
            endpoint: "master",
            db_system: "postgresql",
            operation: "execute",
            sql: "DELETE FROM cart_item",
            elapsed: Duration::from_millis(3),
            rows: Some(2),
            error: None,
        });
        instrumentation.warning("fallback to master");
        assert_eq!(logger.calls.load(Ordering::SeqCst), 2);
    }
}
