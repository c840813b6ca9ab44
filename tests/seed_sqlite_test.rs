//! Integration tests for the seed runner against a SQLite file.

use catalog_db::DbError;
use catalog_db::config::DatabaseConfig;
use catalog_db::db::Router;
use catalog_db::seed::Seeder;
use catalog_db::source::MemorySource;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> (TempDir, Router) {
    let tmp = tempfile::tempdir().unwrap();
    let uri = format!("sqlite://{}?mode=rwc", tmp.path().join("catalog.db").display());
    let mut router = Router::new(DatabaseConfig::new("catalog", "sqlite", uri)).unwrap();
    router.connect().await.unwrap();
    router
        .execute(
            "CREATE TABLE seed_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, file TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    (tmp, router)
}

async fn seed_order(router: &Router) -> Vec<String> {
    router
        .query("SELECT file FROM seed_log ORDER BY seq", &[])
        .await
        .unwrap()
        .into_iter()
        .map(|row| row["file"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_seeds_run_in_name_order_without_init() {
    let (tmp, router) = setup().await;
    let seed_dir = tmp.path().join("seed/catalog");
    std::fs::create_dir_all(&seed_dir).unwrap();
    std::fs::write(
        seed_dir.join("002_b.sql"),
        "INSERT INTO seed_log (file) VALUES ('002_b');",
    )
    .unwrap();
    std::fs::write(
        seed_dir.join("001_a.sql"),
        "INSERT INTO seed_log (file) VALUES ('001_a');\n\
         INSERT INTO seed_log (file) VALUES ('001_a');",
    )
    .unwrap();
    std::fs::write(
        seed_dir.join("init.sql"),
        "INSERT INTO seed_log (file) VALUES ('init');",
    )
    .unwrap();
    std::fs::write(seed_dir.join("000_empty.sql"), "").unwrap();

    let seeder = Seeder::for_router(&router, tmp.path().join("seed")).unwrap();
    let executed = seeder.run().await.unwrap();
    assert_eq!(
        executed,
        vec![seed_dir.join("001_a.sql"), seed_dir.join("002_b.sql")]
    );
    assert_eq!(seed_order(&router).await, vec!["001_a", "001_a", "002_b"]);
    router.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_seed_names_file_and_keeps_earlier_work() {
    let (_tmp, router) = setup().await;
    let source = MemorySource::new()
        .with_file("seed/catalog/001_ok.sql", "INSERT INTO seed_log (file) VALUES ('001_ok');")
        .with_file("seed/catalog/002_bad.sql", "INSERT INTO missing_table VALUES (1);")
        .with_file("seed/catalog/003_never.sql", "INSERT INTO seed_log (file) VALUES ('003');");

    let seeder = Seeder::new(
        router.config(),
        router.master().unwrap().clone(),
        "seed",
        Arc::new(source),
    )
    .unwrap();
    assert_eq!(seeder.files().len(), 3);

    let err = seeder.run().await.unwrap_err();
    match &err {
        DbError::Seed { file, .. } => {
            assert_eq!(file.as_deref(), Some("seed/catalog/002_bad.sql"));
        }
        other => panic!("expected seed error, got {other:?}"),
    }
    assert!(err.to_string().contains("unable to seed: 'seed/catalog/002_bad.sql'"));
    assert_eq!(seed_order(&router).await, vec!["001_ok"]);
    router.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_seed_directory() {
    let (tmp, router) = setup().await;
    let err = Seeder::for_router(&router, tmp.path().join("nowhere")).unwrap_err();
    assert!(matches!(err, DbError::Seed { .. }));

    let only_init = MemorySource::new().with_file(PathBuf::from("seed/catalog/init.sql"), "");
    let err = Seeder::new(
        router.config(),
        router.master().unwrap().clone(),
        "seed",
        Arc::new(only_init),
    )
    .unwrap_err();
    assert!(err.to_string().contains("no seed files found"));
    router.close().await.unwrap();
}
