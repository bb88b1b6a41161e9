//! ebill-db: PostgreSQL connection pools, scoped sessions and migrations.

pub mod bootstrap;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod session;

pub use bootstrap::create_all;
pub use error::{DbError, DbResult};
pub use migrations::{
    MigrationRunner, PostgresUpgrader, RetryPolicy, SchemaUpgrader, UpgradeReport,
};
pub use pool::{ConnectionPool, EngineHandle, EngineMode, PoolSettings};
pub use session::{BlockingSessionScope, SessionScope};
