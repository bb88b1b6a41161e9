//! Session and migration behavior against a live PostgreSQL.
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p ebill-db -- --ignored

use std::sync::Arc;
use std::time::Duration;

use ebill_db::{
    create_all, ConnectionPool, DbError, EngineMode, MigrationRunner, PoolSettings,
    PostgresUpgrader, RetryPolicy,
};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for --ignored tests")
}

async fn pool_with(mode: EngineMode) -> Arc<ConnectionPool> {
    let pool = Arc::new(ConnectionPool::new(database_url(), PoolSettings::default()));
    pool.initialize(mode).await.expect("initialize");
    pool
}

async fn count(pool: &ConnectionPool, table: &str) -> i64 {
    let sql = format!("SELECT count(*) FROM {table}");
    pool.scoped(move |session| {
        Box::pin(async move {
            let conn = session.connection()?;
            let n: i64 = sqlx::query_scalar(&sql).fetch_one(conn).await?;
            Ok::<_, DbError>(n)
        })
    })
    .await
    .expect("count")
}

#[tokio::test]
#[ignore = "requires database"]
async fn scoped_commits_on_success() {
    let pool = pool_with(EngineMode::NonBlocking).await;
    assert!(pool.check_availability(EngineMode::NonBlocking).await);
    assert!(
        create_all(
            &pool,
            &["CREATE TABLE IF NOT EXISTS ebill_commit_check (id INT)".to_string()]
        )
        .await
    );

    pool.scoped(|session| {
        Box::pin(async move {
            session.execute("DELETE FROM ebill_commit_check").await?;
            session
                .execute("INSERT INTO ebill_commit_check VALUES (1)")
                .await?;
            Ok::<_, DbError>(())
        })
    })
    .await
    .unwrap();

    assert_eq!(count(&pool, "ebill_commit_check").await, 1);
    pool.dispose_all().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn scoped_rolls_back_and_returns_original_error() {
    let pool = pool_with(EngineMode::NonBlocking).await;
    assert!(
        create_all(
            &pool,
            &["CREATE TABLE IF NOT EXISTS ebill_rollback_check (id INT)".to_string()]
        )
        .await
    );
    let before = count(&pool, "ebill_rollback_check").await;

    let result: Result<(), DbError> = pool
        .scoped(|session| {
            Box::pin(async move {
                session
                    .execute("INSERT INTO ebill_rollback_check VALUES (7)")
                    .await?;
                Err::<(), _>(DbError::Storage("business rule rejected".into()))
            })
        })
        .await;

    assert!(matches!(result, Err(DbError::Storage(msg)) if msg == "business rule rejected"));
    assert_eq!(count(&pool, "ebill_rollback_check").await, before);
    pool.dispose_all().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn failing_bootstrap_applies_nothing() {
    let pool = pool_with(EngineMode::NonBlocking).await;
    let statements = vec![
        "CREATE TABLE ebill_half_created (id INT)".to_string(),
        "CREATE TABLE (".to_string(),
    ];
    assert!(!create_all(&pool, &statements).await);

    let exists: bool = pool
        .scoped(|session| {
            Box::pin(async move {
                let conn = session.connection()?;
                let exists = sqlx::query_scalar(
                    "SELECT to_regclass('ebill_half_created') IS NOT NULL",
                )
                .fetch_one(conn)
                .await?;
                Ok::<_, DbError>(exists)
            })
        })
        .await
        .unwrap();
    assert!(!exists);
    pool.dispose_all().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn scripts_keep_function_bodies_and_literals_intact() {
    let pool = pool_with(EngineMode::NonBlocking).await;
    let script = r#"
CREATE TABLE IF NOT EXISTS ebill_tariffs (id INT, label TEXT);
DELETE FROM ebill_tariffs;
CREATE OR REPLACE FUNCTION ebill_tariff_label(code INT) RETURNS TEXT AS $$
BEGIN
    IF code = 1 THEN
        RETURN 'peak; weekday';
    END IF;
    RETURN 'off-peak';
END;
$$ LANGUAGE plpgsql;
INSERT INTO ebill_tariffs VALUES (1, ebill_tariff_label(1));
"#;
    assert!(create_all(&pool, &[script.to_string()]).await);

    let label: String = pool
        .scoped(|session| {
            Box::pin(async move {
                let conn = session.connection()?;
                let label = sqlx::query_scalar("SELECT label FROM ebill_tariffs WHERE id = 1")
                    .fetch_one(conn)
                    .await?;
                Ok::<_, DbError>(label)
            })
        })
        .await
        .unwrap();
    assert_eq!(label, "peak; weekday");
    pool.dispose_all().await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn reinitialize_while_a_session_is_open() {
    let pool = pool_with(EngineMode::NonBlocking).await;
    let mut held = pool.session().await.unwrap();
    held.execute("SELECT 1").await.unwrap();

    // Closing the old engine waits for `held`; the swap itself must not.
    tokio::time::timeout(
        Duration::from_secs(5),
        pool.initialize(EngineMode::NonBlocking),
    )
    .await
    .expect("re-initialization waited on an open session")
    .unwrap();
    assert!(pool.is_available(EngineMode::NonBlocking).await);

    held.commit().await.unwrap();
    pool.dispose_all().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires database"]
async fn migrations_are_idempotent() {
    let pool = pool_with(EngineMode::Blocking).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("1_create_meters.sql"),
        "CREATE TABLE IF NOT EXISTS ebill_meters (id SERIAL PRIMARY KEY, reading BIGINT);",
    )
    .unwrap();

    let upgrader = PostgresUpgrader::load(Arc::clone(&pool), dir.path())
        .await
        .unwrap();
    let runner = MigrationRunner::new(upgrader, RetryPolicy::default());

    let first = runner.apply_or_fail().await.unwrap();
    assert!(first.current >= Some(1));

    let second = runner.apply_or_fail().await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.previous, second.current);

    pool.dispose_all().await;
}
