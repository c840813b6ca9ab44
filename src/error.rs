//! Error types for the catalog database layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Connection and query failures carry a suggestion so operators get an actionable
//! message from the CLI and from service logs.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Migration error: {message}")]
    Migration {
        message: String,
        path: Option<String>,
    },

    #[error("Seed error: {message}")]
    Seed {
        message: String,
        file: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a timeout error for a limit, counting any partial second as a full one.
    pub fn timed_out(operation: impl Into<String>, limit: Duration) -> Self {
        let secs = limit.as_millis().div_ceil(1000);
        Self::timeout(operation, u32::try_from(secs).unwrap_or(u32::MAX))
    }

    /// Create a migration error, optionally naming the offending file or directory.
    pub fn migration(message: impl Into<String>, path: Option<String>) -> Self {
        Self::Migration {
            message: message.into(),
            path,
        }
    }

    /// Create a seed error, optionally naming the failing seed file.
    pub fn seed(message: impl Into<String>, file: Option<String>) -> Self {
        Self::Seed {
            message: message.into(),
            file,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is worth retrying by the caller.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True when a query matched no rows.
    pub fn is_no_rows(&self) -> bool {
        matches!(
            self,
            Self::Database { message, sql_state: None, .. } if message == NO_ROWS_MESSAGE
        )
    }
}

const NO_ROWS_MESSAGE: &str = "No rows returned";

/// Suggestion for a server-side failure, keyed on the SQLSTATE class.
fn database_suggestion(sql_state: Option<&str>) -> &'static str {
    match sql_state {
        // MySQL reports duplicate keys as 23000, PostgreSQL and SQLite as 23505/2067.
        Some(s) if s.starts_with("23") || s == "2067" || s == "1555" => {
            "A row with the same unique key (SKU, slug, id) already exists \
             or a referenced row is missing"
        }
        Some(s) if s.starts_with("42") => {
            "Check the SQL syntax and that the migrations are applied"
        }
        Some(s) if s.starts_with("40") => {
            "The transaction was rolled back by the server; run it again"
        }
        Some(s) if s.starts_with("08") => "The server dropped the connection; check its status",
        _ => "Check the statement against the catalog schema",
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        match err {
            E::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.into_owned());
                let suggestion = database_suggestion(sql_state.as_deref());
                DbError::database(db_err.message(), sql_state, suggestion)
            }
            E::RowNotFound => DbError::database(
                NO_ROWS_MESSAGE,
                None,
                "Nothing matched; the row may not have replicated yet when read from a replica",
            ),
            E::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            E::PoolClosed => {
                DbError::connection("connection pool is closed", "Create a new client")
            }
            E::Configuration(e) => DbError::connection(
                format!("invalid connection settings: {e}"),
                "Check the master and replica connection strings in the config file",
            ),
            E::Io(e) => DbError::connection(
                format!("network error: {e}"),
                "Check that the database host is reachable",
            ),
            E::Tls(e) => DbError::connection(
                format!("TLS failure: {e}"),
                "Check the TLS settings and certificates",
            ),
            E::Protocol(e) => DbError::connection(
                format!("unexpected server response: {e}"),
                "Check that the driver matches the server",
            ),
            E::ColumnNotFound(column) => {
                DbError::schema(format!("no column named '{column}' in the result"), column)
            }
            E::TypeNotFound { type_name } => {
                DbError::schema(format!("unknown database type '{type_name}'"), type_name)
            }
            E::ColumnIndexOutOfBounds { index, len } => {
                DbError::decode(format!("column {index} requested from a row of {len} columns"))
            }
            E::ColumnDecode { index, source } => {
                DbError::decode(format!("unable to decode column {index}: {source}"))
            }
            E::Decode(source) => DbError::decode(source.to_string()),
            other => DbError::internal(other.to_string()),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
