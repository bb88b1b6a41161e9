//! One-shot schema creation for fresh databases.

use tracing::{error, info};

use crate::error::DbError;
use crate::pool::ConnectionPool;

/// Run every DDL script in one transaction on the non-blocking engine.
///
/// Returns `false` (and logs) on any failure, leaving nothing applied. Each
/// script may hold several statements, including function bodies.
pub async fn create_all(pool: &ConnectionPool, scripts: &[String]) -> bool {
    let scripts = scripts.to_vec();
    let count = scripts.len();

    let result = pool
        .scoped(move |session| {
            Box::pin(async move {
                for script in &scripts {
                    session.execute_script(script).await?;
                }
                Ok::<_, DbError>(())
            })
        })
        .await;

    match result {
        Ok(()) => {
            info!(scripts = count, "Database tables created successfully");
            true
        }
        Err(err) => {
            error!(error = %err, "Error creating database tables");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;

    #[tokio::test]
    async fn uninitialized_pool_reports_failure() {
        let pool = ConnectionPool::new("postgres://ebill@127.0.0.1:1/ebill", PoolSettings::default());
        assert!(!create_all(&pool, &["CREATE TABLE t (id INT)".to_string()]).await);
    }
}
