//! Supported drivers and the process-wide instrumentation registry.
//!
//! Every endpoint registers its driver on first connect. Registration is idempotent:
//! the first call for a driver creates the entry, later calls return the same one.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Database backend type for dispatch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverType {
    MySql,
    Postgres,
    SQLite,
}

impl DriverType {
    /// Driver name as written in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::SQLite => "sqlite",
        }
    }

    /// OpenTelemetry `db.system` value for spans.
    pub fn db_system(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
            Self::SQLite => "sqlite",
        }
    }

    /// Positional bindvar style of this driver.
    pub fn bind_style(&self) -> BindStyle {
        match self {
            Self::Postgres => BindStyle::Dollar,
            Self::MySql | Self::SQLite => BindStyle::Question,
        }
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverType {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pgx" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            other => Err(DbError::connection(
                format!("Unsupported driver '{}'", other),
                "Use one of: mysql, postgres, sqlite",
            )),
        }
    }
}

/// Placeholder syntax for positional parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

/// An instrumented driver entry.
#[derive(Debug)]
pub struct RegisteredDriver {
    pub driver: DriverType,
    pub instrumented_name: String,
    connects: AtomicU64,
}

impl RegisteredDriver {
    /// Number of endpoints opened through this driver.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }
}

fn registry() -> &'static Mutex<HashMap<DriverType, Arc<RegisteredDriver>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<DriverType, Arc<RegisteredDriver>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `driver` for instrumentation, returning the existing entry if already registered.
pub fn register(driver: DriverType) -> Arc<RegisteredDriver> {
    let mut drivers = match registry().lock() {
        Ok(guard) => guard,
        // The map is only ever inserted into, a poisoned guard still holds valid entries.
        Err(poisoned) => poisoned.into_inner(),
    };
    Arc::clone(drivers.entry(driver).or_insert_with(|| {
        debug!(driver = %driver, db_system = driver.db_system(), "Registering instrumented driver");
        Arc::new(RegisteredDriver {
            driver,
            instrumented_name: format!("instrumented-{}", driver.name()),
            connects: AtomicU64::new(0),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_from_str() {
        assert_eq!("postgres".parse::<DriverType>().unwrap(), DriverType::Postgres);
        assert_eq!("MySQL".parse::<DriverType>().unwrap(), DriverType::MySql);
        assert_eq!("sqlite3".parse::<DriverType>().unwrap(), DriverType::SQLite);
        assert!(matches!(
            "oracle".parse::<DriverType>(),
            Err(DbError::Connection { .. })
        ));
    }

    #[test]
    fn test_register_is_idempotent() {
        let first = register(DriverType::Postgres);
        let second = register(DriverType::Postgres);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.instrumented_name, "instrumented-postgres");

        let other = register(DriverType::MySql);
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_bind_style() {
        assert_eq!(DriverType::Postgres.bind_style(), BindStyle::Dollar);
        assert_eq!(DriverType::MySql.bind_style(), BindStyle::Question);
        assert_eq!(DriverType::SQLite.bind_style(), BindStyle::Question);
    }
}
