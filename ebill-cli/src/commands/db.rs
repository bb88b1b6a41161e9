//! `ebill db` - engine liveness checks and schema migrations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ebill_core::DatabaseConfig;
use ebill_db::{
    ConnectionPool, EngineMode, MigrationRunner, PostgresUpgrader, RetryPolicy, UpgradeReport,
};
use tracing::warn;

use super::load_config;

#[derive(Parser, Debug)]
#[command(about = "Database engine checks and schema migrations")]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Initialize engines and run the liveness check
    Check {
        /// Which engine to check
        #[arg(long, value_enum, default_value_t = ModeArg::All)]
        mode: ModeArg,
    },
    /// Apply pending schema migrations with bounded retry
    Migrate {
        /// Directory of <version>_<description>.sql files (default: database.migrations_dir)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Attempts before giving up (default: database.migration_retries)
        #[arg(long)]
        retries: Option<u32>,
        /// Seconds to wait between attempts (default: database.migration_delay_secs)
        #[arg(long, value_name = "SECS")]
        delay: Option<u64>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Blocking,
    NonBlocking,
    All,
}

impl ModeArg {
    fn modes(self) -> Vec<EngineMode> {
        match self {
            ModeArg::Blocking => vec![EngineMode::Blocking],
            ModeArg::NonBlocking => vec![EngineMode::NonBlocking],
            ModeArg::All => EngineMode::ALL.to_vec(),
        }
    }
}

pub async fn run_db(args: DbArgs) -> Result<()> {
    let config = load_config()?;
    config.require_database_url()?;

    match args.command {
        DbCommand::Check { mode } => run_check(&config.database, mode).await,
        DbCommand::Migrate {
            dir,
            retries,
            delay,
        } => {
            let mut database = config.database.clone();
            if let Some(retries) = retries {
                database.migration_retries = retries;
            }
            if let Some(delay) = delay {
                database.migration_delay_secs = delay;
            }
            if let Some(dir) = dir {
                database.migrations_dir = dir;
            }

            let report = migrate(&database).await?;
            print_report(&report);
            Ok(())
        }
    }
}

async fn run_check(database: &DatabaseConfig, mode: ModeArg) -> Result<()> {
    let pool = ConnectionPool::from_config(database);
    let mut unavailable = Vec::new();

    for mode in mode.modes() {
        match pool.initialize(mode).await {
            Ok(()) => println!("{mode}: available"),
            Err(err) => {
                println!("{mode}: unavailable ({err})");
                unavailable.push(mode);
            }
        }
    }
    pool.dispose_all().await;

    if !unavailable.is_empty() {
        bail!("{} engine(s) failed the liveness check", unavailable.len());
    }
    Ok(())
}

/// Load migrations and bring the schema up to date, retrying per the config.
async fn migrate(database: &DatabaseConfig) -> Result<UpgradeReport> {
    let pool = Arc::new(ConnectionPool::from_config(database));
    let upgrader = PostgresUpgrader::load(Arc::clone(&pool), &database.migrations_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to load migrations from {}",
                database.migrations_dir.display()
            )
        })?;

    // Not fatal: the runner's retries cover a database that is still starting.
    if let Err(err) = pool.initialize(EngineMode::Blocking).await {
        warn!(error = %err, "Blocking engine not yet available");
    }

    let runner = MigrationRunner::new(upgrader, RetryPolicy::from(database));
    let outcome = runner.apply_or_fail().await;

    pool.dispose_all().await;
    outcome.context("Database migrations failed")
}

fn print_report(report: &UpgradeReport) {
    let version = |v: Option<i64>| v.map_or_else(|| "none".to_string(), |v| v.to_string());

    if report.is_noop() {
        println!("Schema up to date (version {})", version(report.current));
        return;
    }
    if report.baselined {
        println!("Created migration tracking table");
    }
    println!(
        "Applied {} migration(s): {} -> {}",
        report.applied.len(),
        version(report.previous),
        version(report.current)
    );
}
