//! Catalog DB - operational entry point.
//!
//! Runs migrations and seeds against the catalog databases and reports their health.

use catalog_db::config::{AppConfig, Cli, Command};
use catalog_db::db::Router;
use catalog_db::migrate::{self, Migrator};
use catalog_db::seed::Seeder;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use unicode_width::UnicodeWidthStr;

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Render rows as a left-aligned table with a header.
fn render_table(header: [&str; 2], rows: &[[String; 2]]) -> String {
    let width = rows
        .iter()
        .map(|r| r[0].width())
        .chain(std::iter::once(header[0].width()))
        .max()
        .unwrap_or(0);
    let pad = |s: &str| format!("{}{}", s, " ".repeat(width - s.width()));

    let mut out = format!("{}  {}\n", pad(header[0]), header[1]);
    for [path, state] in rows {
        out.push_str(&format!("{}  {}\n", pad(path), state));
    }
    out
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::NewMigration { name } = &cli.command {
        let files = migrate::create_migration(&cli.migrate_dir(), name)?;
        println!("{}", files.up.display());
        println!("{}", files.down.display());
        return Ok(());
    }

    let app_config = AppConfig::load(&cli.config)?;
    let db_config = app_config.database(&cli.database)?;
    info!(
        database = %db_config.name,
        driver = %db_config.driver,
        environment = %app_config.environment,
        "Starting catalog-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut router = Router::new(db_config)?;
    router.connect().await?;

    let result = execute(cli, &router).await;
    if let Err(e) = router.close().await {
        error!(error = %e, "Failed to close database connections");
    }
    result
}

async fn execute(cli: &Cli, router: &Router) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Migrate => {
            let applied = Migrator::for_router(router, cli.migrate_dir())?.up().await?;
            info!(count = applied.len(), "Migrations applied");
        }
        Command::MigrateStatus => {
            let rows = Migrator::for_router(router, cli.migrate_dir())?
                .status_rows()
                .await?;
            print!("{}", render_table(["Migration", "Applied"], &rows));
        }
        Command::Rollback => {
            match Migrator::for_router(router, cli.migrate_dir())?.rollback().await? {
                Some(version) => info!(version, "Rolled back"),
                None => info!("Nothing to roll back"),
            }
        }
        Command::Down => {
            let reverted = Migrator::for_router(router, cli.migrate_dir())?.down().await?;
            info!(count = reverted.len(), "Migrations reverted");
        }
        Command::Force { version } => {
            Migrator::for_router(router, cli.migrate_dir())?
                .force(*version)
                .await?;
        }
        Command::Seed => {
            let executed = Seeder::for_router(router, &cli.seed_root)?.run().await?;
            info!(count = executed.len(), "Seed files executed");
        }
        Command::Ping => {
            router.ping().await?;
            println!(
                "ok: master and {} replica(s) reachable",
                router.replicas().len()
            );
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&router.stats()?)?);
        }
        Command::NewMigration { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli);

    if let Err(e) = run(&cli).await {
        error!(error = %e, "Command failed");
        if let Some(suggestion) = e
            .downcast_ref::<catalog_db::DbError>()
            .and_then(|e| e.suggestion())
        {
            eprintln!("Suggestion: {suggestion}");
        }
        return Err(e);
    }
    Ok(())
}
