//! Database access layer.
//!
//! This module provides:
//! - Per-endpoint connection pools with runtime-tunable limits
//! - Master/replica routing
//! - Query execution with positional and `:name` parameters
//! - Prepared statements, transactions and dedicated connections
//! - Query instrumentation hooks
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod driver;
pub mod executor;
pub mod instrument;
pub mod named;
pub mod params;
pub mod pool;
pub mod router;
pub mod statement;
pub mod transaction;
pub mod types;

pub use connection::DbConnection;
pub use driver::{BindStyle, DriverType};
pub use executor::{ExecResult, decode_row};
pub use instrument::{
    Instrumentation, LoggerError, QueryEvent, QueryLogLevel, QueryLogger, TracingQueryLogger,
};
pub use named::{InArg, NamedQuery, expand_in, rebind};
pub use params::QueryParam;
pub use pool::{DbPool, Endpoint, EndpointRole, PoolStats};
pub use router::{Deadline, Router, RouterStats, replica_index};
pub use statement::PreparedStatement;
pub use transaction::{DbTransaction, IsolationLevel, TxOptions};
pub use types::{ColumnInfo, JsonRow};
