//! Database connection pool management
//!
//! Uses one sqlx `PgPool` per engine mode with explicit sizing. The
//! non-blocking engine runs on the caller's tokio runtime. The blocking
//! engine owns a small dedicated runtime so synchronous code (migrations,
//! `spawn_blocking` work) can drive queries with `block_on` without touching
//! the caller's scheduler threads.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ebill_core::DatabaseConfig;
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::runtime::Runtime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{DbError, DbResult};
use crate::session::{BlockingSessionScope, SessionScope};

/// Connections kept for steady-state load.
pub const DEFAULT_POOL_SIZE: u32 = 10;
/// Extra connections allowed under burst load.
pub const DEFAULT_MAX_OVERFLOW: u32 = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(20);
/// Connections older than this are closed and replaced.
pub const DEFAULT_RECYCLE: Duration = Duration::from_secs(1800);

const BLOCKING_WORKER_THREADS: usize = 2;

/// Execution mode of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineMode {
    Blocking,
    NonBlocking,
}

impl EngineMode {
    pub const ALL: [EngineMode; 2] = [EngineMode::Blocking, EngineMode::NonBlocking];
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineMode::Blocking => f.write_str("blocking"),
            EngineMode::NonBlocking => f.write_str("non-blocking"),
        }
    }
}

/// Sizing and timing parameters shared by both engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub pool_size: u32,
    pub max_overflow: u32,
    pub acquire_timeout: Duration,
    pub recycle: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            recycle: DEFAULT_RECYCLE,
        }
    }
}

impl PoolSettings {
    /// Hard ceiling on open connections.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            recycle: Duration::from_secs(config.recycle_secs),
        }
    }
}

/// A configured connection pool bound to one execution mode.
pub struct EngineHandle {
    mode: EngineMode,
    pool: PgPool,
    settings: PoolSettings,
    available: AtomicBool,
    runtime: Option<Runtime>,
}

impl EngineHandle {
    /// Build the pool without connecting; the first liveness check opens the first connection.
    fn connect(mode: EngineMode, database_url: &str, settings: &PoolSettings) -> DbResult<Self> {
        let options: PgConnectOptions = database_url
            .parse()
            .map_err(|e| DbError::Connection(format!("malformed connection string: {e}")))?;
        let options = options.options([("timezone", "UTC")]);

        let pool_options = PgPoolOptions::new()
            .max_connections(settings.max_connections())
            .min_connections(0)
            .acquire_timeout(settings.acquire_timeout)
            .max_lifetime(settings.recycle);

        let (pool, runtime) = match mode {
            EngineMode::NonBlocking => (pool_options.connect_lazy_with(options), None),
            EngineMode::Blocking => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(BLOCKING_WORKER_THREADS)
                    .thread_name("ebill-db-blocking")
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        DbError::Connection(format!("failed to start blocking engine: {e}"))
                    })?;
                // The pool's background tasks must live on the engine's own runtime.
                let pool = {
                    let _guard = runtime.enter();
                    pool_options.connect_lazy_with(options)
                };
                (pool, Some(runtime))
            }
        };

        Ok(Self {
            mode,
            pool,
            settings: settings.clone(),
            available: AtomicBool::new(false),
            runtime,
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Result of the most recent liveness check.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Connections currently open (idle or in use).
    pub fn size(&self) -> u32 {
        self.pool.size()
    }

    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn runtime(&self) -> Option<&Runtime> {
        self.runtime.as_ref()
    }

    /// Run a future on the runtime that owns this engine's connections.
    async fn drive<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => runtime.spawn(fut).await.map_err(|e| {
                DbError::Connection(format!("{} engine task failed: {e}", self.mode))
            }),
            None => Ok(fut.await),
        }
    }

    /// Trivial round-trip inside a throwaway transaction.
    async fn ping(&self) -> DbResult<()> {
        let pool = self.pool.clone();
        self.drive(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT 1").execute(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, DbError>(())
        })
        .await?
    }

    async fn close(&self) {
        self.set_available(false);
        let pool = self.pool.clone();
        if let Err(err) = self.drive(async move { pool.close().await }).await {
            warn!(mode = %self.mode, error = %err, "Failed to close engine cleanly");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // Dropping a runtime from async code panics; detach its workers instead.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("mode", &self.mode)
            .field("settings", &self.settings)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Owner of at most one engine per mode.
///
/// Construct once at startup and share by `Arc`; consumers open sessions
/// through it. Re-initializing a mode retires the previous engine.
pub struct ConnectionPool {
    database_url: String,
    settings: PoolSettings,
    blocking: RwLock<Option<Arc<EngineHandle>>>,
    non_blocking: RwLock<Option<Arc<EngineHandle>>>,
}

impl ConnectionPool {
    pub fn new(database_url: impl Into<String>, settings: PoolSettings) -> Self {
        Self {
            database_url: database_url.into(),
            settings,
            blocking: RwLock::new(None),
            non_blocking: RwLock::new(None),
        }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.connection_url(), PoolSettings::from(config))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn slot(&self, mode: EngineMode) -> &RwLock<Option<Arc<EngineHandle>>> {
        match mode {
            EngineMode::Blocking => &self.blocking,
            EngineMode::NonBlocking => &self.non_blocking,
        }
    }

    /// Create (or replace) the engine for `mode` and verify it with a liveness check.
    ///
    /// A malformed connection string leaves no engine behind. A failed liveness check
    /// keeps the engine, flagged unavailable, and returns a connection error.
    /// A replaced engine is flagged unavailable at once and closed in the
    /// background, so sessions still open on it never hold up the swap.
    pub async fn initialize(&self, mode: EngineMode) -> DbResult<()> {
        let previous = self.slot(mode).write().await.take();
        if let Some(previous) = previous {
            info!(mode = %mode, "Disposing existing engine before re-initialization");
            retire(previous);
        }

        let engine = EngineHandle::connect(mode, &self.database_url, &self.settings).map_err(
            |err| {
                error!(mode = %mode, error = %err, "Error initializing database engine");
                err
            },
        )?;
        let engine = Arc::new(engine);
        let raced = self.slot(mode).write().await.replace(Arc::clone(&engine));
        if let Some(raced) = raced {
            retire(raced);
        }

        match engine.ping().await {
            Ok(()) => {
                engine.set_available(true);
                info!(
                    mode = %mode,
                    max_connections = self.settings.max_connections(),
                    "Database connection verified"
                );
                Ok(())
            }
            Err(err) => {
                engine.set_available(false);
                error!(mode = %mode, error = %err, "Database availability check failed");
                Err(match err {
                    DbError::Connection(_) => err,
                    other => DbError::Connection(other.to_string()),
                })
            }
        }
    }

    /// Re-run the liveness check. Never fails; the outcome updates the flag.
    pub async fn check_availability(&self, mode: EngineMode) -> bool {
        let Some(engine) = self.engine(mode).await else {
            warn!(mode = %mode, "Cannot check availability: engine not initialized");
            return false;
        };

        match engine.ping().await {
            Ok(()) => {
                engine.set_available(true);
                info!(mode = %mode, "Database connection verified");
                true
            }
            Err(err) => {
                engine.set_available(false);
                error!(mode = %mode, error = %err, "Database availability check failed");
                false
            }
        }
    }

    /// Availability flag from the last liveness check, without touching the database.
    pub async fn is_available(&self, mode: EngineMode) -> bool {
        self.engine(mode)
            .await
            .map(|engine| engine.is_available())
            .unwrap_or(false)
    }

    /// Close every pooled connection for `mode`. No-op when already disposed.
    pub async fn dispose(&self, mode: EngineMode) {
        let previous = self.slot(mode).write().await.take();
        if let Some(engine) = previous {
            engine.close().await;
            info!(mode = %mode, "Database engine closed");
        }
    }

    pub async fn dispose_all(&self) {
        for mode in EngineMode::ALL {
            self.dispose(mode).await;
        }
    }

    async fn engine(&self, mode: EngineMode) -> Option<Arc<EngineHandle>> {
        self.slot(mode).read().await.clone()
    }

    /// The live engine for `mode`.
    pub async fn handle(&self, mode: EngineMode) -> DbResult<Arc<EngineHandle>> {
        self.engine(mode).await.ok_or_else(|| {
            error!(mode = %mode, "Database engine not initialized");
            DbError::NotInitialized { mode }
        })
    }

    /// Open a transactional session on the non-blocking engine.
    pub async fn session(&self) -> DbResult<SessionScope> {
        let engine = self.handle(EngineMode::NonBlocking).await?;
        SessionScope::begin(&engine).await
    }

    /// Open a transactional session on the blocking engine.
    ///
    /// Must be called from a synchronous context such as `spawn_blocking`;
    /// calling it on an async worker thread panics.
    pub fn blocking_session(&self) -> DbResult<BlockingSessionScope> {
        BlockingSessionScope::begin(self.blocking_engine()?)
    }

    /// The blocking engine, read without an async context.
    pub(crate) fn blocking_engine(&self) -> DbResult<Arc<EngineHandle>> {
        self.blocking
            .blocking_read()
            .clone()
            .ok_or(DbError::NotInitialized {
                mode: EngineMode::Blocking,
            })
    }

    /// Run `body` inside a fresh session: commit on `Ok`, roll back on `Err`.
    ///
    /// The body's error is returned unchanged; only a failed commit produces a
    /// new (storage) error.
    pub async fn scoped<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut SessionScope) -> BoxFuture<'s, Result<T, E>>,
        E: From<DbError>,
    {
        let mut session = self.session().await?;
        match body(&mut session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                session.release().await;
                Err(err)
            }
        }
    }

    /// Blocking counterpart of [`ConnectionPool::scoped`].
    pub fn scoped_blocking<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut BlockingSessionScope) -> Result<T, E>,
        E: From<DbError>,
    {
        let mut session = self.blocking_session()?;
        match body(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                session.release();
                Err(err)
            }
        }
    }
}

/// Flag an engine unavailable and close it off the caller's path.
fn retire(engine: Arc<EngineHandle>) {
    engine.set_available(false);
    tokio::spawn(async move {
        engine.close().await;
        debug!(mode = %engine.mode(), "Replaced engine closed");
    });
}
