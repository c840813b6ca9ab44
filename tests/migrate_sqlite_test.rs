//! Integration tests for the migration runner against a SQLite file.

use catalog_db::DbError;
use catalog_db::config::DatabaseConfig;
use catalog_db::db::Router;
use catalog_db::migrate::{MigrationVersion, Migrator};
use catalog_db::params;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, sql: &str) {
    std::fs::write(dir.join(name), sql).unwrap();
}

async fn setup() -> (TempDir, PathBuf, Router) {
    let tmp = tempfile::tempdir().unwrap();
    let migrate_dir = tmp.path().join("migrate/catalog");
    std::fs::create_dir_all(&migrate_dir).unwrap();

    write(
        &migrate_dir,
        "1_create_product.up.sql",
        "CREATE TABLE product (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
    );
    write(&migrate_dir, "1_create_product.down.sql", "DROP TABLE product;");
    write(
        &migrate_dir,
        "2_create_category.up.sql",
        "CREATE TABLE category (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n\
         INSERT INTO category (name) VALUES ('shoes');",
    );
    write(&migrate_dir, "2_create_category.down.sql", "DROP TABLE category;");
    write(
        &migrate_dir,
        "3_create_review.up.sql",
        "CREATE TABLE review (id INTEGER PRIMARY KEY, product_id INTEGER NOT NULL);",
    );
    write(&migrate_dir, "3_create_review.down.sql", "DROP TABLE review;");

    let uri = format!(
        "sqlite://{}?mode=rwc",
        tmp.path().join("catalog.db").display()
    );
    let mut router = Router::new(DatabaseConfig::new("catalog", "sqlite", uri)).unwrap();
    router.connect().await.unwrap();
    (tmp, migrate_dir, router)
}

async fn table_exists(router: &Router, table: &str) -> bool {
    !router
        .master()
        .unwrap()
        .fetch_all(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &params![table],
        )
        .await
        .unwrap()
        .is_empty()
}

fn applied(rows: &[[String; 2]]) -> Vec<&str> {
    rows.iter().map(|r| r[1].as_str()).collect()
}

#[tokio::test]
async fn test_up_rollback_down() {
    let (_tmp, dir, router) = setup().await;
    let migrator = Migrator::for_router(&router, &dir).unwrap();

    assert_eq!(migrator.version().await.unwrap(), None);
    assert_eq!(
        applied(&migrator.status_rows().await.unwrap()),
        vec!["no", "no", "no"]
    );

    assert_eq!(migrator.up().await.unwrap(), vec![1, 2, 3]);
    assert_eq!(
        migrator.version().await.unwrap(),
        Some(MigrationVersion {
            version: 3,
            dirty: false
        })
    );
    assert!(table_exists(&router, "review").await);
    let categories = router.query("SELECT name FROM category", &[]).await.unwrap();
    assert_eq!(categories.len(), 1);

    let rows = migrator.status_rows().await.unwrap();
    assert_eq!(
        rows[0][0],
        format!("{}/1_create_product.up.sql", dir.display())
    );
    assert_eq!(applied(&rows), vec!["yes", "yes", "yes"]);

    assert_eq!(migrator.up().await.unwrap(), Vec::<u64>::new());

    assert_eq!(migrator.rollback().await.unwrap(), Some(3));
    assert!(!table_exists(&router, "review").await);
    assert_eq!(
        applied(&migrator.status_rows().await.unwrap()),
        vec!["yes", "yes", "no"]
    );

    assert_eq!(migrator.up().await.unwrap(), vec![3]);
    assert_eq!(migrator.down().await.unwrap(), vec![3, 2, 1]);
    assert_eq!(migrator.version().await.unwrap(), None);
    assert!(!table_exists(&router, "product").await);
    assert_eq!(migrator.rollback().await.unwrap(), None);

    router.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_migration_leaves_database_dirty() {
    let (_tmp, dir, router) = setup().await;
    write(&dir, "4_broken.up.sql", "CREATE TABLE broken (");
    let migrator = Migrator::for_router(&router, &dir).unwrap();

    let err = migrator.up().await.unwrap_err();
    assert!(matches!(err, DbError::Migration { .. }));
    assert!(err.to_string().contains("4_broken.up.sql"));
    assert_eq!(
        migrator.version().await.unwrap(),
        Some(MigrationVersion {
            version: 4,
            dirty: true
        })
    );

    let refused = migrator.rollback().await.unwrap_err();
    assert!(refused.to_string().contains("dirty"));
    assert!(migrator.up().await.is_err());

    migrator.force(3).await.unwrap();
    assert_eq!(
        migrator.version().await.unwrap(),
        Some(MigrationVersion {
            version: 3,
            dirty: false
        })
    );
    assert_eq!(
        applied(&migrator.status_rows().await.unwrap()),
        vec!["yes", "yes", "yes", "no"]
    );
    router.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_without_down_script() {
    let (_tmp, dir, router) = setup().await;
    write(
        &dir,
        "5_create_tag.up.sql",
        "CREATE TABLE tag (id INTEGER PRIMARY KEY);",
    );
    let migrator = Migrator::for_router(&router, &dir).unwrap();
    migrator.up().await.unwrap();

    let err = migrator.rollback().await.unwrap_err();
    assert!(err.to_string().contains("no down migration found for version 5"));
    assert_eq!(migrator.version().await.unwrap().map(|v| v.version), Some(5));
    router.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_migrations_table() {
    let (tmp, dir, router) = setup().await;
    router.close().await.unwrap();

    let uri = format!("sqlite://{}?mode=rwc", tmp.path().join("other.db").display());
    let mut config = DatabaseConfig::new("catalog", "sqlite", uri);
    config.schema_migrations_table = "catalog_versions".to_string();
    let mut router = Router::new(config).unwrap();
    router.connect().await.unwrap();

    let migrator = Migrator::for_router(&router, &dir).unwrap();
    migrator.up().await.unwrap();
    assert!(table_exists(&router, "catalog_versions").await);
    assert!(!table_exists(&router, "schema_migrations").await);
    router.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_migrations_table_rejected() {
    let mut config = DatabaseConfig::new("catalog", "sqlite", "sqlite::memory:");
    config.schema_migrations_table = "versions; DROP TABLE product".to_string();
    assert!(matches!(Router::new(config), Err(DbError::Config { .. })));
}
