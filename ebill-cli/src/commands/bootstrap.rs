//! `ebill bootstrap` - the service startup sequence
//!
//! Engines are initialized, an optional DDL script is applied, migrations run
//! with retry and the bucket gets its lifecycle policy. A failed step is
//! logged and the remaining steps still run, so a half-ready environment
//! comes up degraded rather than not at all.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ebill_core::EbillConfig;
use ebill_db::{
    create_all, ConnectionPool, EngineMode, MigrationRunner, PostgresUpgrader, RetryPolicy,
};
use ebill_storage::{LifecyclePolicyManager, ObjectStoreClient};
use tracing::{error, info, warn};

use super::load_config;

#[derive(Parser, Debug)]
#[command(about = "Run the startup sequence: engines, migrations, bucket and lifecycle policy")]
pub struct BootstrapArgs {
    /// Migrations directory (default: database.migrations_dir)
    #[arg(long, value_name = "DIR")]
    pub migrations: Option<PathBuf>,

    /// SQL script run as-is, in one transaction, before migrating
    #[arg(long, value_name = "FILE")]
    pub schema: Option<PathBuf>,

    /// Skip the object store steps
    #[arg(long)]
    pub skip_storage: bool,
}

#[derive(Debug, Default)]
struct Degraded(Vec<&'static str>);

impl Degraded {
    fn mark(&mut self, step: &'static str) {
        self.0.push(step);
    }
}

pub async fn run_bootstrap(args: BootstrapArgs) -> Result<()> {
    let mut config = load_config()?;
    config.require_database_url()?;
    if let Some(dir) = args.migrations {
        config.database.migrations_dir = dir;
    }

    let mut degraded = Degraded::default();
    let pool = Arc::new(ConnectionPool::from_config(&config.database));

    for mode in EngineMode::ALL {
        if pool.initialize(mode).await.is_err() {
            degraded.mark(match mode {
                EngineMode::Blocking => "blocking engine",
                EngineMode::NonBlocking => "non-blocking engine",
            });
        }
    }

    if let Some(path) = &args.schema {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read schema script {}", path.display()))?;
        info!(path = %path.display(), "Applying schema script");
        if !create_all(&pool, &[script]).await {
            degraded.mark("schema");
        }
    }

    if !run_migrations(&config, &pool).await {
        warn!("Continuing startup without an up-to-date schema");
        degraded.mark("migrations");
    }

    if !args.skip_storage {
        if let Err(err) = prepare_bucket(&config).await {
            error!(error = %format!("{err:#}"), "Object store setup failed");
            degraded.mark("object store");
        }
    }

    pool.dispose_all().await;

    if degraded.0.is_empty() {
        println!("Startup complete");
    } else {
        println!("Startup complete (degraded: {})", degraded.0.join(", "));
    }
    Ok(())
}

async fn run_migrations(config: &EbillConfig, pool: &Arc<ConnectionPool>) -> bool {
    let upgrader =
        match PostgresUpgrader::load(Arc::clone(pool), &config.database.migrations_dir).await {
            Ok(upgrader) => upgrader,
            Err(err) => {
                error!(error = %err, "Failed to load migrations");
                return false;
            }
        };

    MigrationRunner::new(upgrader, RetryPolicy::from(&config.database))
        .apply_with_retry()
        .await
}

async fn prepare_bucket(config: &EbillConfig) -> Result<()> {
    let client = ObjectStoreClient::from_config(&config.storage)
        .context("Failed to create object store client")?;
    let bucket = config
        .storage
        .bucket_name(client.project_id().unwrap_or_default());

    client
        .create_bucket(&bucket, &config.storage.location)
        .await
        .with_context(|| format!("Failed to create bucket {bucket}"))?;

    let outcome = LifecyclePolicyManager::default()
        .apply(&client, &bucket)
        .await
        .with_context(|| format!("Failed to apply lifecycle policy to {bucket}"))?;
    info!(bucket = %bucket, outcome = ?outcome, "Bucket ready");
    Ok(())
}
