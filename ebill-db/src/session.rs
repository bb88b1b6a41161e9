//! Scoped transactional units of work.
//!
//! A session owns one open transaction. Every exit path ends it exactly once:
//! `commit`, `rollback`, `release` or drop. Release and drop roll back, and
//! both are no-ops once the transaction has ended.

use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::pool::{EngineHandle, EngineMode};

/// Transactional session on the non-blocking engine.
#[derive(Debug)]
pub struct SessionScope {
    tx: Option<Transaction<'static, Postgres>>,
    mode: EngineMode,
}

impl SessionScope {
    pub(crate) async fn begin(engine: &EngineHandle) -> DbResult<Self> {
        let tx = engine.pool().begin().await?;
        Ok(Self {
            tx: Some(tx),
            mode: engine.mode(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Connection for arbitrary sqlx queries within this transaction.
    pub fn connection(&mut self) -> DbResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or(DbError::SessionClosed)
    }

    /// Execute a single statement, returning the affected row count.
    pub async fn execute(&mut self, sql: &str) -> DbResult<u64> {
        let result = sqlx::query(sql).execute(self.connection()?).await?;
        Ok(result.rows_affected())
    }

    /// Execute a script of one or more statements as sent, without splitting.
    ///
    /// Dollar-quoted bodies and semicolons inside literals are left to the
    /// server's parser.
    pub async fn execute_script(&mut self, sql: &str) -> DbResult<u64> {
        let result = sqlx::Executor::execute(self.connection()?, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    /// Commit the transaction. A failed commit leaves nothing applied.
    pub async fn commit(mut self) -> DbResult<()> {
        let tx = self.tx.take().ok_or(DbError::SessionClosed)?;
        tx.commit().await.map_err(|e| {
            warn!(mode = %self.mode, error = %e, "Commit failed; transaction rolled back");
            DbError::Storage(format!("commit failed: {e}"))
        })
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        let tx = self.tx.take().ok_or(DbError::SessionClosed)?;
        tx.rollback().await?;
        Ok(())
    }

    /// Roll back if still open and return the connection to the pool.
    pub async fn release(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(mode = %self.mode, error = %e, "Rollback on release failed");
            }
        }
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        // sqlx queues the rollback when the transaction is dropped.
        if self.tx.is_some() {
            debug!(mode = %self.mode, "Session dropped while open; rolling back");
        }
    }
}

/// Transactional session on the blocking engine.
///
/// Every call blocks the current thread on the engine's own runtime; use it
/// only from synchronous code.
pub struct BlockingSessionScope {
    tx: Option<Transaction<'static, Postgres>>,
    engine: Arc<EngineHandle>,
}

impl BlockingSessionScope {
    pub(crate) fn begin(engine: Arc<EngineHandle>) -> DbResult<Self> {
        let runtime = engine.runtime().ok_or(DbError::NotInitialized {
            mode: EngineMode::Blocking,
        })?;
        let tx = runtime.block_on(engine.pool().begin())?;
        Ok(Self {
            tx: Some(tx),
            engine,
        })
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Drive an async sqlx operation against this transaction's connection.
    ///
    /// ```ignore
    /// let n: i64 = session.run(|conn| {
    ///     Box::pin(sqlx::query_scalar("SELECT count(*) FROM bills").fetch_one(conn))
    /// })?;
    /// ```
    pub fn run<'s, T, F>(&'s mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&'s mut PgConnection) -> BoxFuture<'s, Result<T, sqlx::Error>>,
    {
        let Self { tx, engine } = self;
        let runtime = engine.runtime().ok_or(DbError::NotInitialized {
            mode: EngineMode::Blocking,
        })?;
        let conn = tx.as_deref_mut().ok_or(DbError::SessionClosed)?;
        Ok(runtime.block_on(f(conn))?)
    }

    /// Execute a single statement, returning the affected row count.
    pub fn execute(&mut self, sql: &str) -> DbResult<u64> {
        self.run(|conn| {
            Box::pin(async move {
                let result = sqlx::query(sql).execute(conn).await?;
                Ok(result.rows_affected())
            })
        })
    }

    /// Execute a script that may contain several statements.
    pub fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        self.run(|conn| {
            Box::pin(async move {
                sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
                Ok(())
            })
        })
    }

    pub fn commit(mut self) -> DbResult<()> {
        let runtime = self.engine.runtime().ok_or(DbError::NotInitialized {
            mode: EngineMode::Blocking,
        })?;
        let tx = self.tx.take().ok_or(DbError::SessionClosed)?;
        runtime.block_on(tx.commit()).map_err(|e| {
            warn!(error = %e, "Commit failed; transaction rolled back");
            DbError::Storage(format!("commit failed: {e}"))
        })
    }

    pub fn rollback(mut self) -> DbResult<()> {
        let runtime = self.engine.runtime().ok_or(DbError::NotInitialized {
            mode: EngineMode::Blocking,
        })?;
        let tx = self.tx.take().ok_or(DbError::SessionClosed)?;
        runtime.block_on(tx.rollback())?;
        Ok(())
    }

    /// Roll back if still open and return the connection to the pool.
    pub fn release(&mut self) {
        let Some(runtime) = self.engine.runtime() else {
            return;
        };
        if let Some(tx) = self.tx.take() {
            if let Err(e) = runtime.block_on(tx.rollback()) {
                warn!(error = %e, "Rollback on release failed");
            }
        }
    }
}

impl Drop for BlockingSessionScope {
    fn drop(&mut self) {
        // The connection must be handed back on the engine runtime, so roll
        // back explicitly rather than leaving it to the transaction's drop.
        if self.tx.is_some() {
            debug!("Blocking session dropped while open; rolling back");
            self.release();
        }
    }
}
