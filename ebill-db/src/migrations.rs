//! Schema migrations with bounded retry.
//!
//! Migrations are `<version>_<description>.sql` scripts loaded at runtime by
//! sqlx's [`Migrator`], which records applied versions (with checksums) in
//! [`TRACKING_TABLE`] and serializes concurrent runs with an advisory lock.
//! The highest applied version is the schema's version marker. A database
//! without the tracking table is treated as unversioned and receives every
//! migration from the first one.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ebill_core::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::ConnectionPool;

/// Table sqlx keeps its migration history in.
pub const TRACKING_TABLE: &str = "_sqlx_migrations";

/// Outcome of one successful upgrade pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Marker before the pass (`None` for an unversioned database)
    pub previous: Option<i64>,
    /// Marker after the pass
    pub current: Option<i64>,
    pub applied: Vec<i64>,
    /// The tracking table had to be created
    pub baselined: bool,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    fn between(tracked_before: bool, before: &[i64], after: &[i64]) -> Self {
        Self {
            previous: before.last().copied(),
            current: after.last().copied(),
            applied: after
                .iter()
                .copied()
                .filter(|v| !before.contains(v))
                .collect(),
            baselined: !tracked_before,
        }
    }
}

/// One attempt at bringing the schema to its latest revision.
///
/// Implementations block; the runner calls them on a blocking thread.
pub trait SchemaUpgrader: Send + Sync + 'static {
    fn upgrade_to_latest(&self) -> DbResult<UpgradeReport>;
}

/// Applies SQL migrations through the blocking engine.
///
/// Each migration runs in its own transaction, so a failed pass keeps every
/// migration before the failing one and leaves the marker there.
pub struct PostgresUpgrader {
    pool: Arc<ConnectionPool>,
    /// `None` when the migrations directory does not exist
    migrator: Option<Migrator>,
}

impl PostgresUpgrader {
    /// Load every migration script in `dir`.
    ///
    /// A missing directory yields an empty set. Versions already applied but
    /// no longer on disk are tolerated, so a database ahead of this build is
    /// left as is.
    pub async fn load(pool: Arc<ConnectionPool>, dir: &Path) -> DbResult<Self> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "Migrations directory not found; nothing to apply");
            return Ok(Self {
                pool,
                migrator: None,
            });
        }

        let mut migrator = Migrator::new(dir.to_path_buf()).await?;
        migrator.set_ignore_missing(true);
        Ok(Self {
            pool,
            migrator: Some(migrator),
        })
    }

    /// Known versions, ascending.
    pub fn versions(&self) -> Vec<i64> {
        self.migrator
            .iter()
            .flat_map(|m| m.iter())
            .map(|m| m.version)
            .collect()
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.versions().into_iter().max()
    }
}

impl SchemaUpgrader for PostgresUpgrader {
    fn upgrade_to_latest(&self) -> DbResult<UpgradeReport> {
        let engine = self.pool.blocking_engine()?;
        let runtime = engine.runtime().ok_or(DbError::NotInitialized {
            mode: engine.mode(),
        })?;
        let pool = engine.pool();

        runtime.block_on(async {
            let tracked_before = is_tracked(pool).await?;
            let before = applied_versions(pool, tracked_before).await?;
            if !tracked_before {
                info!("Unversioned database; applying all migrations from the start");
            }
            if let (Some(&current), Some(latest)) = (before.last(), self.latest_version()) {
                if current > latest {
                    warn!(
                        current,
                        latest, "Database schema is ahead of known migrations; leaving it as is"
                    );
                }
            }

            if let Some(migrator) = &self.migrator {
                migrator.run(pool).await?;
            }

            let after = applied_versions(pool, is_tracked(pool).await?).await?;
            let report = UpgradeReport::between(tracked_before, &before, &after);
            for version in &report.applied {
                info!(version, "Applied migration");
            }
            Ok::<_, DbError>(report)
        })
    }
}

async fn is_tracked(pool: &PgPool) -> DbResult<bool> {
    let tracked = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = $1)",
    )
    .bind(TRACKING_TABLE)
    .fetch_one(pool)
    .await?;
    Ok(tracked)
}

async fn applied_versions(pool: &PgPool, tracked: bool) -> DbResult<Vec<i64>> {
    if !tracked {
        return Ok(Vec::new());
    }
    let versions = sqlx::query_scalar::<_, i64>(
        "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version",
    )
    .fetch_all(pool)
    .await?;
    Ok(versions)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(30),
        }
    }
}

impl From<&DatabaseConfig> for RetryPolicy {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_retries: config.migration_retries,
            delay: Duration::from_secs(config.migration_delay_secs),
        }
    }
}

/// Runs a [`SchemaUpgrader`] with bounded retry and a non-blocking delay.
pub struct MigrationRunner<U> {
    upgrader: Arc<U>,
    policy: RetryPolicy,
}

impl<U: SchemaUpgrader> MigrationRunner<U> {
    pub fn new(upgrader: U, policy: RetryPolicy) -> Self {
        Self {
            upgrader: Arc::new(upgrader),
            policy,
        }
    }

    pub fn upgrader(&self) -> &U {
        &self.upgrader
    }

    /// Apply migrations, retrying on failure; `false` once retries run out.
    pub async fn apply_with_retry(&self) -> bool {
        self.apply_or_fail().await.is_ok()
    }

    /// Like [`MigrationRunner::apply_with_retry`] but reports the outcome.
    pub async fn apply_or_fail(&self) -> DbResult<UpgradeReport> {
        let max_retries = self.policy.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_retries {
            info!(attempt, max_retries, "Applying database migrations");

            let upgrader = Arc::clone(&self.upgrader);
            let outcome = tokio::task::spawn_blocking(move || upgrader.upgrade_to_latest())
                .await
                .unwrap_or_else(|e| Err(DbError::Storage(format!("migration task failed: {e}"))));

            match outcome {
                Ok(report) => {
                    info!(
                        applied = report.applied.len(),
                        version = ?report.current,
                        "Database migrations applied successfully"
                    );
                    return Ok(report);
                }
                Err(err) => {
                    error!(attempt, max_retries, error = %err, "Error applying database migrations");
                    last_error = err.to_string();
                    if attempt < max_retries {
                        info!(delay_secs = self.policy.delay.as_secs(), "Retrying migrations");
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        error!(max_retries, "Failed to apply database migrations after all attempts");
        Err(DbError::MigrationFailure {
            attempts: max_retries,
            reason: last_error,
        })
    }
}
