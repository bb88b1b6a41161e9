//! Object store façade used by the rest of the platform.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use ebill_core::StorageConfig;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::gcs::{GcsBackend, ServiceAccountKey};
use crate::lifecycle::LifecycleRule;
use crate::traits::{ObjectBackend, UrlSigner};
use crate::types::{
    basename, signing_time, BlobReference, BucketInfo, DeleteFailure, DeleteReport, SignRequest,
    SignedUrlGrant,
};

pub const DEFAULT_FANOUT: usize = 10;
pub const DEFAULT_EXPIRATION_MINUTES: u32 = 15;
/// Longest validity V4 signatures allow: seven days.
pub const MAX_EXPIRATION_MINUTES: u32 = 7 * 24 * 60;

/// Cheaply cloneable client over one backend and one signer.
#[derive(Clone)]
pub struct ObjectStoreClient {
    backend: Arc<dyn ObjectBackend>,
    signer: Arc<dyn UrlSigner>,
    fanout: usize,
    project_id: Option<String>,
}

impl ObjectStoreClient {
    pub fn new(backend: Arc<dyn ObjectBackend>, signer: Arc<dyn UrlSigner>) -> Self {
        Self {
            backend,
            signer,
            fanout: DEFAULT_FANOUT,
            project_id: None,
        }
    }

    /// Cloud Storage client for the configured service account.
    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        let json = config
            .service_account_json()
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let key = ServiceAccountKey::from_json(&json)?;

        let project_id = key.project_id.clone();
        let backend = Arc::new(GcsBackend::new(key)?);
        info!(project_id = %project_id, "Object store client created");

        Ok(Self::new(backend.clone(), backend)
            .with_fanout(config.fanout)
            .with_project_id(project_id))
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Create `name`, or return the existing bucket of that name.
    pub async fn create_bucket(&self, name: &str, location: &str) -> StorageResult<BucketInfo> {
        match self.backend.insert_bucket(name, location).await {
            Ok(bucket) => {
                info!(bucket = %name, location = %location, "Bucket created");
                Ok(bucket)
            }
            Err(StorageError::Conflict(_)) => {
                info!(bucket = %name, "Bucket already exists");
                self.backend.get_bucket(name).await
            }
            Err(err) => {
                error!(bucket = %name, error = %err, "Error creating bucket");
                Err(err)
            }
        }
    }

    /// Upload in-memory bytes; returns the key.
    pub async fn upload_buffer(
        &self,
        bucket: &str,
        data: impl Into<Bytes>,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        match self
            .backend
            .put(bucket, key, data.into(), content_type)
            .await
        {
            Ok(meta) => {
                info!(bucket = %bucket, key = %key, size = meta.size, "Buffer uploaded");
                Ok(key.to_string())
            }
            Err(err) => {
                error!(bucket = %bucket, key = %key, error = %err, "Error uploading buffer");
                Err(err)
            }
        }
    }

    pub async fn download(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.backend.get(bucket, key).await.map_err(|err| {
            log_object_failure(bucket, key, &err);
            err
        })
    }

    /// Write an object to `path`. `NotFound` if the key does not exist.
    pub async fn download_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
        match self.backend.get_to_file(bucket, key, path).await {
            Ok(size) => {
                info!(bucket = %bucket, key = %key, path = %path.display(), size, "Blob downloaded");
                Ok(())
            }
            Err(err) => {
                log_object_failure(bucket, key, &err);
                Err(err)
            }
        }
    }

    pub async fn stat(&self, bucket: &str, key: &str) -> StorageResult<Option<BlobReference>> {
        let meta = self.backend.head(bucket, key).await?;
        Ok(meta.map(|m| {
            let blob = BlobReference::new(bucket, m.key).with_size(m.size);
            match m.content_type {
                Some(content_type) => blob.with_content_type(content_type),
                None => blob,
            }
        }))
    }

    /// Every key under `prefix`, collected eagerly.
    pub async fn list_keys(&self, bucket: &str, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        self.backend.list(bucket, prefix).await.map_err(|err| {
            error!(bucket = %bucket, error = %err, "Error listing files");
            err
        })
    }

    /// `false` for a missing key. A missing bucket and every other failure
    /// still propagate.
    pub async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let exists = match self.backend.head(bucket, key).await {
            Ok(meta) => meta.is_some(),
            Err(StorageError::NotFound { .. }) => false,
            Err(err) => return Err(err),
        };
        info!(bucket = %bucket, key = %key, exists, "Checked blob existence");
        Ok(exists)
    }

    /// Signed GET URL valid for `expiration_minutes` from now.
    ///
    /// With `force_download` the response asks the browser to save the file
    /// under the key's basename.
    pub async fn generate_signed_url(
        &self,
        bucket: &str,
        key: &str,
        expiration_minutes: u32,
        force_download: bool,
    ) -> StorageResult<SignedUrlGrant> {
        if !(1..=MAX_EXPIRATION_MINUTES).contains(&expiration_minutes) {
            return Err(StorageError::InvalidArgument(format!(
                "expiration must be between 1 and {MAX_EXPIRATION_MINUTES} minutes, got {expiration_minutes}"
            )));
        }
        if bucket.is_empty() || key.is_empty() {
            return Err(StorageError::InvalidArgument(
                "bucket and key are required".into(),
            ));
        }

        let request = SignRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            issued_at: signing_time(Utc::now()),
            expires_in: Duration::from_secs(u64::from(expiration_minutes) * 60),
            content_disposition: force_download
                .then(|| format!("attachment; filename=\"{}\"", basename(key))),
        };

        match self.signer.sign(&request).await {
            Ok(grant) => {
                info!(bucket = %bucket, key = %key, expires_at = %grant.expires_at, "Generated signed URL");
                Ok(grant)
            }
            Err(err) => {
                error!(bucket = %bucket, key = %key, error = %err, "Error generating signed URL");
                Err(err)
            }
        }
    }

    /// Delete one object. `NotFound` if missing.
    pub async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        match self.backend.delete(bucket, key).await {
            Ok(()) => {
                info!(bucket = %bucket, key = %key, "Blob deleted");
                Ok(())
            }
            Err(err) => {
                log_object_failure(bucket, key, &err);
                Err(err)
            }
        }
    }

    /// Delete every key, at most `fanout` at a time.
    ///
    /// Each key is attempted regardless of the others. If any failed the
    /// whole report comes back inside [`StorageError::BulkDelete`].
    pub async fn delete_many(&self, bucket: &str, keys: &[String]) -> StorageResult<DeleteReport> {
        let outcomes: Vec<(String, StorageResult<()>)> = stream::iter(keys.iter().cloned())
            .map(|key| async move {
                let result = self.backend.delete(bucket, &key).await;
                (key, result)
            })
            .buffer_unordered(self.fanout)
            .collect()
            .await;

        let mut report = DeleteReport::default();
        for (key, result) in outcomes {
            match result {
                Ok(()) => report.deleted.push(key),
                Err(err) => report.failed.push(DeleteFailure {
                    missing: err.is_not_found(),
                    reason: err.to_string(),
                    key,
                }),
            }
        }

        if report.is_complete() {
            info!(bucket = %bucket, deleted = report.deleted.len(), "Deleted files");
            Ok(report)
        } else {
            error!(
                bucket = %bucket,
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Error deleting files"
            );
            Err(StorageError::BulkDelete(report))
        }
    }

    /// The bucket's lifecycle rules as the service stores them.
    pub async fn lifecycle_policy(&self, bucket: &str) -> StorageResult<Value> {
        self.backend.get_lifecycle(bucket).await
    }

    /// Replace the bucket's lifecycle rules.
    pub async fn set_lifecycle_policy(
        &self,
        bucket: &str,
        rules: &[LifecycleRule],
    ) -> StorageResult<()> {
        self.backend.set_lifecycle(bucket, rules).await
    }
}

fn log_object_failure(bucket: &str, key: &str, err: &StorageError) {
    if err.is_not_found() {
        warn!(bucket = %bucket, key = %key, "Blob not found");
    } else {
        error!(bucket = %bucket, key = %key, error = %err, "Object store request failed");
    }
}
