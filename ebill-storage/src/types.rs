//! Value types shared by the client, backends and pipeline.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// The only method signed URLs are issued for.
pub const SIGNED_METHOD: &str = "GET";

/// Issuance time truncated to whole seconds, the resolution signed URLs carry.
pub fn signing_time(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Final path segment of an object key.
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// A stored object, identified by bucket and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobReference {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

impl BlobReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: None,
            size: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn basename(&self) -> &str {
        basename(&self.key)
    }
}

impl fmt::Display for BlobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.key)
    }
}

/// Object metadata as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub name: String,
    pub location: Option<String>,
    pub storage_class: Option<String>,
}

/// Input to a [`crate::UrlSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub bucket: String,
    pub key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_in: Duration,
    /// `Content-Disposition` the backend should answer with
    pub content_disposition: Option<String>,
}

/// A time-limited GET URL for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlGrant {
    pub url: String,
    pub method: &'static str,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub content_disposition: Option<String>,
}

impl SignedUrlGrant {
    /// Usable from issuance up to, but excluding, the expiry instant.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.issued_at && at < self.expires_at
    }
}

/// One key that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub reason: String,
    pub missing: bool,
}

/// Per-key outcome of a bulk delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

impl DeleteReport {
    pub fn total(&self) -> usize {
        self.deleted.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.failed
            .iter()
            .filter(|f| f.missing)
            .map(|f| f.key.as_str())
    }
}
