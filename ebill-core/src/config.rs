use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, CoreResult};

/// Prefix of the deterministic bucket name; the project id is appended.
pub const BUCKET_NAME_PREFIX: &str = "electricity-billing-system-bucket-";

/// Centralized configuration for the resource-access layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EbillConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub acquire_timeout_secs: u64,
    pub recycle_secs: u64,
    pub migration_retries: u32,
    pub migration_delay_secs: u64,
    pub migrations_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: 10,
            max_overflow: 5,
            acquire_timeout_secs: 20,
            recycle_secs: 1800,
            migration_retries: 3,
            migration_delay_secs: 30,
            migrations_dir: PathBuf::from("migrations"),
        }
    }
}

impl DatabaseConfig {
    /// Connection string with any driver qualifier removed.
    pub fn connection_url(&self) -> String {
        normalize_database_url(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Explicit bucket; derived from the project id when unset
    pub bucket: Option<String>,
    pub location: String,
    pub service_account_file: Option<PathBuf>,
    /// Inline service-account credential (secrets bundle or TOML table)
    #[serde(skip_serializing)]
    pub service_account: Option<serde_json::Value>,
    pub signed_url_minutes: u32,
    pub fanout: usize,
    pub archive_timezone: String,
    pub staging_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            location: "EU".to_string(),
            service_account_file: None,
            service_account: None,
            signed_url_minutes: 15,
            fanout: 10,
            archive_timezone: "Asia/Beirut".to_string(),
            staging_dir: None,
        }
    }
}

impl StorageConfig {
    /// Bucket to operate on: the configured one, or the per-project default.
    pub fn bucket_name(&self, project_id: &str) -> String {
        self.bucket
            .clone()
            .unwrap_or_else(|| format!("{BUCKET_NAME_PREFIX}{project_id}"))
    }

    /// Raw service-account JSON, from the inline value or the credential file.
    pub fn service_account_json(&self) -> CoreResult<String> {
        if let Some(value) = &self.service_account {
            return serde_json::to_string(value)
                .map_err(|e| ConfigError::invalid("storage.service_account", e.to_string()));
        }

        let path = self.service_account_file.as_ref().ok_or_else(|| {
            ConfigError::missing(
                "storage.service_account",
                "SECRETS_BASE64, storage.service_account_file or GCS_SERVICE_ACCOUNT_FILE",
            )
        })?;

        fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))
    }
}

/// Shape of the base64-encoded JSON secrets bundle.
#[derive(Debug, Deserialize)]
struct SecretsBundle {
    #[serde(rename = "ASYNC_POSTGRES_DATABASE_URL")]
    database_url: Option<String>,
    #[serde(rename = "GCS_SERVICE_ACCOUNT")]
    service_account: Option<serde_json::Value>,
}

impl EbillConfig {
    /// Load configuration from the environment.
    ///
    /// The base is the `SECRETS_BASE64` bundle (or the file named by
    /// `SECRETS_BASE64_FILE_PATH`) when present, otherwise the TOML file at
    /// [`EbillConfig::config_path`]. `DATABASE_URL` and
    /// `GCS_SERVICE_ACCOUNT_FILE` then override individual fields.
    pub fn load() -> CoreResult<Self> {
        let mut config = match Self::secrets_from_env()? {
            Some(encoded) => {
                tracing::debug!("Loading configuration from secrets bundle");
                Self::from_secrets_base64(&encoded)?
            }
            None => {
                let path = Self::config_path();
                if path.exists() {
                    tracing::debug!(path = %path.display(), "Loading configuration file");
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path: `$EBILL_CONFIG` or `~/.ebill/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("EBILL_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ebill/config.toml")
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build a config from a base64-encoded JSON secrets bundle.
    pub fn from_secrets_base64(encoded: &str) -> CoreResult<Self> {
        let raw = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::secrets(format!("not valid base64: {e}")))?;
        let bundle: SecretsBundle = serde_json::from_slice(&raw)
            .map_err(|e| ConfigError::secrets(format!("not valid JSON: {e}")))?;

        let mut config = Self::default();
        if let Some(url) = bundle.database_url {
            config.database.url = url;
        }
        config.storage.service_account = bundle.service_account;
        Ok(config)
    }

    fn secrets_from_env() -> CoreResult<Option<String>> {
        if let Ok(encoded) = env::var("SECRETS_BASE64") {
            return Ok(Some(encoded));
        }
        match env::var("SECRETS_BASE64_FILE_PATH") {
            Ok(path) => fs::read_to_string(&path)
                .map(|s| Some(s.trim().to_string()))
                .map_err(|e| ConfigError::io(path, e)),
            Err(_) => Ok(None),
        }
    }

    /// Apply per-field overrides from a variable lookup (the process env in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = url;
        }
        if let Some(path) = lookup("GCS_SERVICE_ACCOUNT_FILE").filter(|v| !v.is_empty()) {
            self.storage.service_account_file = Some(PathBuf::from(path));
            self.storage.service_account = None;
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::invalid("database.pool_size", "must be at least 1"));
        }
        if self.database.migration_retries == 0 {
            return Err(ConfigError::invalid(
                "database.migration_retries",
                "must be at least 1",
            ));
        }
        if self.storage.fanout == 0 {
            return Err(ConfigError::invalid("storage.fanout", "must be at least 1"));
        }
        if self.storage.signed_url_minutes == 0 {
            return Err(ConfigError::invalid(
                "storage.signed_url_minutes",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// The database URL, or an actionable error when none was configured.
    pub fn require_database_url(&self) -> CoreResult<String> {
        if self.database.url.is_empty() {
            return Err(ConfigError::missing(
                "database.url",
                "SECRETS_BASE64, the config file or DATABASE_URL",
            ));
        }
        Ok(self.database.connection_url())
    }
}

/// Strip a SQLAlchemy-style driver qualifier (`postgresql+asyncpg://`).
pub fn normalize_database_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match scheme.split_once('+') {
            Some((base, _driver)) => format!("{base}://{rest}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}
