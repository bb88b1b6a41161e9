//! ebill-core: configuration shared by the database, storage and CLI crates.

pub mod config;
pub mod error;

pub use config::{normalize_database_url, DatabaseConfig, EbillConfig, StorageConfig};
pub use error::{ConfigError, CoreResult};
