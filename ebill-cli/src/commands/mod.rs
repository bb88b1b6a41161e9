//! Command implementations for the ebill CLI

pub mod bootstrap;
pub mod db;
pub mod storage;

pub use bootstrap::run_bootstrap;
pub use db::run_db;
pub use storage::run_storage;

use anyhow::{Context, Result};
use ebill_core::EbillConfig;

pub(crate) fn load_config() -> Result<EbillConfig> {
    EbillConfig::load().context("Failed to load ebill configuration")
}
