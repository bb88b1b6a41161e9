//! Bundle many stored objects into one downloadable archive.
//!
//! A job runs in four stages inside a private staging directory:
//!
//! 1. every source is downloaded concurrently (bounded width); the job only
//!    proceeds once all downloads have settled, and fails with the first
//!    error seen if any did not succeed
//! 2. the staged files are zipped, named by basename, in name order
//! 3. the archive is uploaded under a timestamped key
//! 4. a signed URL is issued for it
//!
//! The staging directory is removed when the job ends, whatever the outcome.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ebill_core::StorageConfig;
use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tracing::{error, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::client::{ObjectStoreClient, DEFAULT_EXPIRATION_MINUTES, DEFAULT_FANOUT};
use crate::error::{StorageError, StorageResult};
use crate::types::{basename, DeleteReport, SignedUrlGrant};

pub const ARCHIVE_PREFIX: &str = "zip/";
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Beirut;

const PARTS_DIR: &str = "parts";
const FILES_DIR: &str = "files";

/// One bundling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJob {
    pub bucket: String,
    /// Source keys; later duplicates by basename replace earlier ones
    pub sources: Vec<String>,
    pub expiration_minutes: u32,
    /// Target key; a timestamped `zip/qrcodes_...` key when unset
    pub archive_key: Option<String>,
}

impl ArchiveJob {
    pub fn new(bucket: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            bucket: bucket.into(),
            sources,
            expiration_minutes: DEFAULT_EXPIRATION_MINUTES,
            archive_key: None,
        }
    }

    pub fn with_expiration_minutes(mut self, minutes: u32) -> Self {
        self.expiration_minutes = minutes;
        self
    }

    pub fn with_archive_key(mut self, key: impl Into<String>) -> Self {
        self.archive_key = Some(key.into());
        self
    }
}

#[derive(Clone)]
pub struct BundlingPipeline {
    client: ObjectStoreClient,
    width: usize,
    timezone: Tz,
    staging_root: Option<PathBuf>,
}

impl BundlingPipeline {
    pub fn new(client: ObjectStoreClient) -> Self {
        Self {
            client,
            width: DEFAULT_FANOUT,
            timezone: DEFAULT_TIMEZONE,
            staging_root: None,
        }
    }

    pub fn from_config(client: ObjectStoreClient, config: &StorageConfig) -> StorageResult<Self> {
        let timezone: Tz = config.archive_timezone.parse().map_err(|e| {
            StorageError::Config(format!(
                "unknown archive timezone '{}': {e}",
                config.archive_timezone
            ))
        })?;

        let mut pipeline = Self::new(client)
            .with_width(config.fanout)
            .with_timezone(timezone);
        if let Some(root) = &config.staging_dir {
            pipeline = pipeline.with_staging_root(root);
        }
        Ok(pipeline)
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Create staging directories under `root` instead of the system temp dir.
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// `zip/qrcodes_<YYYY-MM-DD_HH-MM-SS>.zip` in the pipeline's timezone.
    pub fn archive_key(&self, at: DateTime<Utc>) -> String {
        archive_key_in(&self.timezone, at)
    }

    /// Bundle `keys` and return a signed URL for the archive.
    pub async fn create_qr_zip_and_signed_url(
        &self,
        bucket: &str,
        keys: &[String],
        expiration_minutes: u32,
    ) -> StorageResult<SignedUrlGrant> {
        let job = ArchiveJob::new(bucket, keys.to_vec()).with_expiration_minutes(expiration_minutes);
        self.run(&job).await
    }

    pub async fn run(&self, job: &ArchiveJob) -> StorageResult<SignedUrlGrant> {
        if job.sources.is_empty() {
            return Err(StorageError::InvalidArgument(
                "archive job has no source keys".into(),
            ));
        }

        let staging = self.staging_dir()?;
        let result = self.run_in(job, staging.path()).await;

        let staging_path = staging.path().to_path_buf();
        if let Err(err) = staging.close() {
            warn!(path = %staging_path.display(), error = %err, "Failed to remove staging directory");
        }

        if let Err(err) = &result {
            error!(bucket = %job.bucket, sources = job.sources.len(), error = %err, "Error creating archive and signed URL");
        }
        result
    }

    /// Delete every key with the client's bounded fan-out.
    pub async fn delete_all(&self, bucket: &str, keys: &[String]) -> StorageResult<DeleteReport> {
        self.client.delete_many(bucket, keys).await
    }

    fn staging_dir(&self) -> StorageResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ebill-bundle-");
        let dir = match &self.staging_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn run_in(&self, job: &ArchiveJob, staging: &Path) -> StorageResult<SignedUrlGrant> {
        let parts = staging.join(PARTS_DIR);
        let files = staging.join(FILES_DIR);
        tokio::fs::create_dir_all(&parts).await?;
        tokio::fs::create_dir_all(&files).await?;

        self.stage(job, &parts, &files).await?;
        info!(
            count = job.sources.len(),
            dir = %staging.display(),
            "Downloaded sources to staging directory"
        );

        let archive_key = job
            .archive_key
            .clone()
            .unwrap_or_else(|| self.archive_key(Utc::now()));
        let archive_path = staging.join(basename(&archive_key));

        let entries = {
            let files = files.clone();
            let archive_path = archive_path.clone();
            tokio::task::spawn_blocking(move || write_archive(&files, &archive_path))
                .await
                .map_err(|e| StorageError::Archive(format!("archive task failed: {e}")))??
        };
        info!(path = %archive_path.display(), entries, "Created archive");

        let data = tokio::fs::read(&archive_path).await?;
        self.client
            .upload_buffer(&job.bucket, data, &archive_key, ARCHIVE_CONTENT_TYPE)
            .await?;

        match self
            .client
            .generate_signed_url(&job.bucket, &archive_key, job.expiration_minutes, true)
            .await
        {
            Ok(grant) => Ok(grant),
            Err(err) => {
                // Nothing can reach the archive without a URL.
                if let Err(cleanup) = self.client.delete(&job.bucket, &archive_key).await {
                    warn!(key = %archive_key, error = %cleanup, "Failed to delete unsigned archive");
                }
                Err(err)
            }
        }
    }

    /// Download every source; all downloads settle before any error is returned.
    async fn stage(&self, job: &ArchiveJob, parts: &Path, files: &Path) -> StorageResult<()> {
        let results: Vec<StorageResult<()>> = stream::iter(job.sources.iter().enumerate())
            .map(|(index, key)| self.stage_one(&job.bucket, key, index, parts, files))
            .buffer_unordered(self.width)
            .collect()
            .await;

        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stage_one(
        &self,
        bucket: &str,
        key: &str,
        index: usize,
        parts: &Path,
        files: &Path,
    ) -> StorageResult<()> {
        let name = basename(key);
        if name.is_empty() || name == "." || name == ".." {
            return Err(StorageError::InvalidArgument(format!(
                "source key '{key}' has no file name"
            )));
        }

        let part = parts.join(index.to_string());
        self.client.download_to_file(bucket, key, &part).await?;
        tokio::fs::rename(&part, files.join(name)).await?;
        Ok(())
    }
}

/// Archive key for `at`, rendered as civil time in `timezone`.
pub fn archive_key_in(timezone: &Tz, at: DateTime<Utc>) -> String {
    format!(
        "{ARCHIVE_PREFIX}qrcodes_{}.zip",
        at.with_timezone(timezone).format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Zip every regular file in `dir`, sorted by name. Returns the entry count.
fn write_archive(dir: &Path, archive_path: &Path) -> StorageResult<usize> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();

    let mut zip = ZipWriter::new(File::create(archive_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for name in &names {
        zip.start_file(name.as_str(), options)?;
        let mut source = File::open(dir.join(name))?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;

    Ok(names.len())
}
