//! One-shot data seeding.

use crate::config::DatabaseConfig;
use crate::db::{Endpoint, Router};
use crate::error::{DbError, DbResult};
use crate::source::{DiskSource, FileSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Excluded from seeding; reserved for database bootstrap.
pub const INIT_FILE: &str = "init.sql";

/// Runs the `*.sql` files of `<seed_root>/<database name>` against the master.
pub struct Seeder {
    master: Endpoint,
    dir: PathBuf,
    files: Vec<PathBuf>,
    source: Arc<dyn FileSource>,
}

impl std::fmt::Debug for Seeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seeder")
            .field("master", &self.master)
            .field("dir", &self.dir)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Seeder {
    pub fn new(
        config: &DatabaseConfig,
        master: Endpoint,
        seed_root: impl AsRef<Path>,
        source: Arc<dyn FileSource>,
    ) -> DbResult<Self> {
        let dir = seed_root.as_ref().join(&config.name);
        let entries = source.list(&dir).map_err(|e| {
            DbError::seed(
                format!("unable to read seed directory '{}': {e}", dir.display()),
                None,
            )
        })?;

        let mut files: Vec<PathBuf> = entries
            .into_iter()
            .filter(|e| !e.is_dir && e.name.ends_with(".sql") && e.name != INIT_FILE)
            .map(|e| dir.join(e.name))
            .collect();
        if files.is_empty() {
            return Err(DbError::seed("no seed files found", None));
        }
        files.sort();

        Ok(Self {
            master,
            dir,
            files,
            source,
        })
    }

    /// Seeder reading from disk on the master of a connected router.
    pub fn for_router(router: &Router, seed_root: impl AsRef<Path>) -> DbResult<Self> {
        Self::new(
            router.config(),
            router.master()?.clone(),
            seed_root,
            Arc::new(DiskSource),
        )
    }

    /// Files to run, in execution order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Execute every file in order. Stops at the first failure; files already run stay
    /// applied. Returns the executed files.
    pub async fn run(&self) -> DbResult<Vec<PathBuf>> {
        let mut executed = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let seed_error = |message: String| {
                DbError::seed(message, Some(file.display().to_string()))
            };
            let script = self
                .source
                .read_to_string(file)
                .map_err(|e| {
                    seed_error(format!("unable to read: '{}'. error: {}", file.display(), e))
                })?;
            if script.trim().is_empty() {
                debug!(file = %file.display(), "Skipping empty seed file");
                continue;
            }

            self.master
                .execute(&script, &[])
                .await
                .map_err(|e| {
                    seed_error(format!("unable to seed: '{}'. error: {}", file.display(), e))
                })?;
            info!(file = %file.display(), "Seeded");
            executed.push(file.clone());
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EndpointRole, Instrumentation};
    use crate::source::MemorySource;

    fn seeder(source: MemorySource) -> DbResult<Seeder> {
        let config = DatabaseConfig::new("catalog", "sqlite", "sqlite::memory:");
        let master = Endpoint::open(
            EndpointRole::Master,
            &config,
            &config.uri,
            Instrumentation::default(),
        )?;
        Seeder::new(&config, master, "db/seed", Arc::new(source))
    }

    #[tokio::test]
    async fn test_files_sorted_without_init() {
        let s = seeder(
            MemorySource::new()
                .with_file("db/seed/catalog/002_b.sql", "")
                .with_file("db/seed/catalog/001_a.sql", "")
                .with_file("db/seed/catalog/init.sql", "")
                .with_file("db/seed/catalog/notes.txt", "")
                .with_file("db/seed/catalog/dir.sql/x.sql", ""),
        )
        .unwrap();
        assert_eq!(
            s.files(),
            &[
                PathBuf::from("db/seed/catalog/001_a.sql"),
                PathBuf::from("db/seed/catalog/002_b.sql"),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_seed_files() {
        let source = MemorySource::new().with_file("db/seed/catalog/init.sql", "");
        let err = seeder(source).unwrap_err();
        assert!(matches!(err, DbError::Seed { .. }));
        assert!(err.to_string().contains("no seed files found"));

        let err = seeder(MemorySource::new()).unwrap_err();
        assert!(matches!(err, DbError::Seed { .. }));
    }
}
