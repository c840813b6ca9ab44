//! Catalog DB Library
//!
//! Master/replica routing database client for the catalog service (MySQL, PostgreSQL,
//! SQLite), with schema migrations and data seeding.

pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod seed;
pub mod source;

pub use config::{AppConfig, DatabaseConfig};
pub use db::{Endpoint, QueryParam, Router};
pub use error::{DbError, DbResult};
pub use migrate::Migrator;
pub use seed::Seeder;
