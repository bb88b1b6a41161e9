/// Structured error types for ebill-core.
///
/// Configuration is loaded once at startup, so every failure here is fatal
/// for the caller; the variants exist to make the operator-facing message precise.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O operation failed
    #[error("I/O error reading {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// Config file exists but is not valid TOML for [`crate::EbillConfig`]
    #[error("Invalid TOML in {path:?}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Secrets bundle could not be decoded
    #[error("Invalid secrets bundle: {reason}")]
    Secrets { reason: String },

    /// Required setting missing from every source
    #[error("Missing required setting '{field}' (set it in {hint})")]
    Missing { field: String, hint: String },

    /// Setting present but unusable
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

/// Result type alias for ebill-core operations
pub type CoreResult<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn secrets(reason: impl Into<String>) -> Self {
        Self::Secrets {
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Missing {
            field: field.into(),
            hint: hint.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::missing("database.url", "DATABASE_URL");
        assert_eq!(
            err.to_string(),
            "Missing required setting 'database.url' (set it in DATABASE_URL)"
        );

        let err = ConfigError::invalid("storage.fanout", "must be at least 1");
        assert!(err.to_string().contains("storage.fanout"));
    }
}
