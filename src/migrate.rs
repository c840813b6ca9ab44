//! Versioned schema migrations.
//!
//! Migrations live in one directory as `<version>_<description>.up.sql` and
//! `<version>_<description>.down.sql` pairs. The master records the current version and a
//! dirty flag in a single-row table; a step marks its target version dirty, runs the
//! script and then marks it clean, so a failed script leaves the database dirty until
//! [`Migrator::force`] is used.

use crate::config::DatabaseConfig;
use crate::db::{Endpoint, JsonRow, QueryParam, Router};
use crate::error::{DbError, DbResult};
use crate::source::{DiskSource, FileSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";
const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// One discovered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub description: String,
    pub up: PathBuf,
    pub down: Option<PathBuf>,
}

/// Version recorded in the migrations table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationVersion {
    pub version: u64,
    pub dirty: bool,
}

/// Applied state of one up migration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: u64,
    pub path: String,
    pub applied: bool,
}

impl MigrationStatus {
    pub fn applied_label(&self) -> &'static str {
        if self.applied { "yes" } else { "no" }
    }
}

/// Migration runner bound to the master endpoint of one database.
pub struct Migrator {
    master: Endpoint,
    dir: PathBuf,
    table: String,
    source: Arc<dyn FileSource>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("master", &self.master)
            .field("dir", &self.dir)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Runner for the migrations in `dir`, reading files from disk.
    pub fn new(
        master: Endpoint,
        config: &DatabaseConfig,
        dir: impl Into<PathBuf>,
    ) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            master,
            dir: dir.into(),
            table: config.schema_migrations_table.clone(),
            source: Arc::new(DiskSource),
        })
    }

    /// Runner on the master of a connected router.
    pub fn for_router(router: &Router, dir: impl Into<PathBuf>) -> DbResult<Self> {
        Self::new(router.master()?.clone(), router.config(), dir)
    }

    pub fn with_source(mut self, source: Arc<dyn FileSource>) -> Self {
        self.source = source;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn error(&self, message: impl Into<String>) -> DbError {
        DbError::migration(message, Some(self.dir.display().to_string()))
    }

    /// Every migration in the directory, ascending by version.
    pub fn migrations(&self) -> DbResult<Vec<Migration>> {
        let entries = self.source.list(&self.dir).map_err(|e| {
            self.error(format!("unable to read migration directory: {e}"))
        })?;

        let mut ups: BTreeMap<u64, Migration> = BTreeMap::new();
        let mut downs: BTreeMap<u64, PathBuf> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.is_dir) {
            let (stem, is_up) = if let Some(stem) = entry.name.strip_suffix(UP_SUFFIX) {
                (stem, true)
            } else if let Some(stem) = entry.name.strip_suffix(DOWN_SUFFIX) {
                (stem, false)
            } else {
                continue;
            };
            let Some((version, description)) = stem.split_once('_') else {
                debug!(file = %entry.name, "Skipping migration file without description");
                continue;
            };
            let version: u64 = version.parse().map_err(|_| {
                DbError::migration(
                    format!("invalid migration version '{}' in '{}'", version, entry.name),
                    Some(self.dir.join(&entry.name).display().to_string()),
                )
            })?;
            let path = self.dir.join(&entry.name);

            if is_up {
                let migration = Migration {
                    version,
                    description: description.to_string(),
                    up: path,
                    down: None,
                };
                if let Some(existing) = ups.insert(version, migration) {
                    return Err(self.error(format!(
                        "duplicate migration version {} ('{}')",
                        version,
                        existing.up.display()
                    )));
                }
            } else if downs.insert(version, path).is_some() {
                return Err(self.error(format!("duplicate down migration for version {version}")));
            }
        }

        for (version, down) in downs {
            match ups.get_mut(&version) {
                Some(migration) => migration.down = Some(down),
                None => warn!(version, "Down migration without a matching up migration"),
            }
        }
        Ok(ups.into_values().collect())
    }

    async fn ensure_table(&self) -> DbResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} \
             (version BIGINT NOT NULL PRIMARY KEY, dirty BOOLEAN NOT NULL)",
            self.table
        );
        self.master.execute(&sql, &[]).await?;
        Ok(())
    }

    /// The recorded version; `None` before the first migration.
    pub async fn version(&self) -> DbResult<Option<MigrationVersion>> {
        self.ensure_table().await?;
        let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table);
        self.master
            .fetch_optional(&sql, &[])
            .await?
            .map(|row| self.parse_version(&row))
            .transpose()
    }

    fn parse_version(&self, row: &JsonRow) -> DbResult<MigrationVersion> {
        let version = row
            .get("version")
            .and_then(JsonValue::as_i64)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| self.error(format!("invalid version recorded in '{}'", self.table)))?;
        let dirty = match row.get("dirty") {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::Number(n)) => n.as_i64() != Some(0),
            _ => return Err(self.error(format!("invalid dirty flag recorded in '{}'", self.table))),
        };
        Ok(MigrationVersion { version, dirty })
    }

    async fn set_version(&self, version: Option<u64>, dirty: bool) -> DbResult<()> {
        let mut tx = self.master.begin().await?;
        tx.execute(&format!("DELETE FROM {}", self.table), &[]).await?;
        if let Some(version) = version {
            let version = i64::try_from(version)
                .map_err(|_| self.error(format!("version {version} out of range")))?;
            let sql = self.master.rebind(&format!(
                "INSERT INTO {} (version, dirty) VALUES (?, ?)",
                self.table
            ));
            tx.execute(&sql, &[QueryParam::Int(version), QueryParam::Bool(dirty)])
                .await?;
        }
        tx.commit().await
    }

    async fn clean_version(&self) -> DbResult<Option<u64>> {
        match self.version().await? {
            Some(v) if v.dirty => Err(self.error(format!(
                "database is dirty at version {}; fix it and force a version",
                v.version
            ))),
            v => Ok(v.map(|v| v.version)),
        }
    }

    async fn run_script(&self, path: &Path, target: Option<u64>) -> DbResult<()> {
        let script = self.source.read_to_string(path).map_err(|e| {
            DbError::migration(format!("unable to read: {e}"), Some(path.display().to_string()))
        })?;

        self.set_version(target, true).await?;
        if !script.trim().is_empty() {
            self.master.execute(&script, &[]).await.map_err(|e| {
                DbError::migration(
                    format!("unable to migrate: '{}'. error: {}", path.display(), e),
                    Some(path.display().to_string()),
                )
            })?;
        }
        self.set_version(target, false).await
    }

    /// Apply every pending migration in ascending order. Returns the applied versions.
    pub async fn up(&self) -> DbResult<Vec<u64>> {
        let current = self.clean_version().await?;
        let pending: Vec<Migration> = self
            .migrations()?
            .into_iter()
            .filter(|m| current.is_none_or(|c| m.version > c))
            .collect();

        if pending.is_empty() {
            info!(dir = %self.dir.display(), "No pending migrations");
            return Ok(Vec::new());
        }

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            info!(
                version = migration.version,
                file = %migration.up.display(),
                "Applying migration"
            );
            self.run_script(&migration.up, Some(migration.version)).await?;
            applied.push(migration.version);
        }
        Ok(applied)
    }

    /// Revert one applied migration. Returns the reverted version, `None` when nothing is
    /// applied.
    pub async fn rollback(&self) -> DbResult<Option<u64>> {
        let Some(current) = self.clean_version().await? else {
            info!("No migration to roll back");
            return Ok(None);
        };
        let migrations = self.migrations()?;
        self.step_down(&migrations, current).await.map(Some)
    }

    /// Revert every applied migration in descending order. Returns the reverted versions.
    pub async fn down(&self) -> DbResult<Vec<u64>> {
        let mut current = self.clean_version().await?;
        let migrations = self.migrations()?;
        let mut reverted = Vec::new();
        while let Some(version) = current {
            reverted.push(self.step_down(&migrations, version).await?);
            current = previous_version(&migrations, version);
        }
        Ok(reverted)
    }

    async fn step_down(&self, migrations: &[Migration], version: u64) -> DbResult<u64> {
        let migration = migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| self.error(format!("no migration file found for version {version}")))?;
        let down = migration
            .down
            .as_ref()
            .ok_or_else(|| self.error(format!("no down migration found for version {version}")))?;

        info!(version, file = %down.display(), "Reverting migration");
        self.run_script(down, previous_version(migrations, version)).await?;
        Ok(version)
    }

    /// Record `version` as applied and clean without running any script.
    pub async fn force(&self, version: u64) -> DbResult<()> {
        self.ensure_table().await?;
        self.set_version(Some(version), false).await?;
        info!(version, "Forced migration version");
        Ok(())
    }

    /// Applied state of every up migration file.
    pub async fn status(&self) -> DbResult<Vec<MigrationStatus>> {
        let current = self.version().await?.map(|v| v.version);
        Ok(self
            .migrations()?
            .into_iter()
            .map(|m| MigrationStatus {
                version: m.version,
                path: m.up.display().to_string(),
                applied: current.is_some_and(|c| m.version <= c),
            })
            .collect())
    }

    /// `[path, "yes" | "no"]` rows of [`Migrator::status`].
    pub async fn status_rows(&self) -> DbResult<Vec<[String; 2]>> {
        Ok(self
            .status()
            .await?
            .into_iter()
            .map(|s| [s.path.clone(), s.applied_label().to_string()])
            .collect())
    }
}

fn previous_version(migrations: &[Migration], version: u64) -> Option<u64> {
    migrations
        .iter()
        .rev()
        .map(|m| m.version)
        .find(|v| *v < version)
}

/// Paths of a generated migration pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFiles {
    pub up: PathBuf,
    pub down: PathBuf,
}

/// Create an empty up/down pair in `dir` versioned with the current UTC time.
pub fn create_migration(dir: &Path, name: &str) -> DbResult<MigrationFiles> {
    create_migration_at(dir, name, Utc::now())
}

/// Create an empty up/down pair in `dir` versioned with `at`.
pub fn create_migration_at(dir: &Path, name: &str, at: DateTime<Utc>) -> DbResult<MigrationFiles> {
    let description: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if description.trim_matches('_').is_empty() {
        return Err(DbError::invalid_input(format!("invalid migration name '{name}'")));
    }

    let io_error = |e: std::io::Error| {
        DbError::migration(
            format!("unable to create migration: {e}"),
            Some(dir.display().to_string()),
        )
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;

    let version = at.format(VERSION_FORMAT);
    let files = MigrationFiles {
        up: dir.join(format!("{version}_{description}{UP_SUFFIX}")),
        down: dir.join(format!("{version}_{description}{DOWN_SUFFIX}")),
    };
    for path in [&files.up, &files.down] {
        if path.exists() {
            return Err(DbError::migration(
                "migration file already exists",
                Some(path.display().to_string()),
            ));
        }
        std::fs::write(path, "").map_err(io_error)?;
    }
    info!(up = %files.up.display(), down = %files.down.display(), "Created migration");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EndpointRole, Instrumentation};
    use crate::source::MemorySource;
    use chrono::TimeZone;

    fn migrator(source: MemorySource) -> Migrator {
        let config = DatabaseConfig::new("main", "sqlite", "sqlite::memory:");
        let master = Endpoint::open(
            EndpointRole::Master,
            &config,
            &config.uri,
            Instrumentation::default(),
        )
        .unwrap();
        Migrator::new(master, &config, "db/migrate/main")
            .unwrap()
            .with_source(Arc::new(source))
    }

    #[tokio::test]
    async fn test_discovery_orders_and_pairs() {
        let m = migrator(
            MemorySource::new()
                .with_file("db/migrate/main/2_add_price.up.sql", "")
                .with_file("db/migrate/main/1_create_product.up.sql", "")
                .with_file("db/migrate/main/1_create_product.down.sql", "")
                .with_file("db/migrate/main/README.md", "")
                .with_file("db/migrate/main/init.sql", ""),
        );
        let migrations = m.migrations().unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[0].description, "create_product");
        assert_eq!(
            migrations[0].down.as_deref(),
            Some(Path::new("db/migrate/main/1_create_product.down.sql"))
        );
        assert_eq!(migrations[1].version, 2);
        assert!(migrations[1].down.is_none());
    }

    #[tokio::test]
    async fn test_discovery_rejects_bad_versions() {
        let m = migrator(MemorySource::new().with_file("db/migrate/main/abc_x.up.sql", ""));
        assert!(matches!(m.migrations(), Err(DbError::Migration { .. })));

        let m = migrator(
            MemorySource::new()
                .with_file("db/migrate/main/1_a.up.sql", "")
                .with_file("db/migrate/main/1_b.up.sql", ""),
        );
        let err = m.migrations().unwrap_err();
        assert!(err.to_string().contains("duplicate migration version 1"));
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let m = migrator(MemorySource::new());
        assert!(matches!(m.migrations(), Err(DbError::Migration { .. })));
    }

    #[test]
    fn test_previous_version() {
        let migrations: Vec<Migration> = [1, 5, 9]
            .into_iter()
            .map(|version| Migration {
                version,
                description: "x".into(),
                up: PathBuf::new(),
                down: None,
            })
            .collect();
        assert_eq!(previous_version(&migrations, 9), Some(5));
        assert_eq!(previous_version(&migrations, 5), Some(1));
        assert_eq!(previous_version(&migrations, 1), None);
    }

    #[test]
    fn test_create_migration_at() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let files = create_migration_at(dir.path(), "Add Product Index", at).unwrap();
        assert_eq!(
            files.up.file_name().unwrap(),
            "20240309140507_add_product_index.up.sql"
        );
        assert!(files.down.exists());

        let again = create_migration_at(dir.path(), "Add Product Index", at);
        assert!(matches!(again, Err(DbError::Migration { .. })));
        assert!(create_migration_at(dir.path(), "  ", at).is_err());
    }
}
