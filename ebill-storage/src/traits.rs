//! Backend and signer seams.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::StorageResult;
use crate::lifecycle::LifecycleRule;
use crate::types::{BucketInfo, ObjectMeta, SignRequest, SignedUrlGrant};

/// Object contents as they arrive from the backend.
pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// Raw object-store operations.
///
/// Implementations report a missing object as [`crate::StorageError::NotFound`],
/// a missing bucket as [`crate::StorageError::BucketNotFound`] and an existing
/// bucket on insert as [`crate::StorageError::Conflict`]; the client builds
/// its idempotence and existence contracts on those.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Create a bucket; `Conflict` if the name is taken.
    async fn insert_bucket(&self, name: &str, location: &str) -> StorageResult<BucketInfo>;

    async fn get_bucket(&self, name: &str) -> StorageResult<BucketInfo>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectMeta>;

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes>;

    /// Object contents in chunks. Defaults to one chunk from [`ObjectBackend::get`].
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(bucket, key).await?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    /// Metadata, or `None` when the object does not exist.
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>>;

    /// Every key under `prefix`, all pages collected.
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StorageResult<Vec<String>>;

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// The bucket's rules exactly as stored, `[]` when it has none.
    async fn get_lifecycle(&self, bucket: &str) -> StorageResult<Value>;

    /// Replace the bucket's whole rule set.
    async fn set_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StorageResult<()>;

    /// Write an object to a local file chunk by chunk.
    async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<u64> {
        let chunks = self.get_stream(bucket, key).await?;
        write_stream_to_file(chunks, path).await
    }

    fn backend_name(&self) -> &'static str;
}

/// Issues signed URLs.
#[async_trait]
pub trait UrlSigner: Send + Sync + 'static {
    async fn sign(&self, request: &SignRequest) -> StorageResult<SignedUrlGrant>;
}

/// Drain `chunks` into a new file at `path`, returning the bytes written.
///
/// A failed stream leaves no partial file behind.
pub async fn write_stream_to_file(mut chunks: ByteStream, path: &Path) -> StorageResult<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    let copied: StorageResult<()> = async {
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(err) = copied {
        drop(file);
        let _ = tokio::fs::remove_file(path).await;
        return Err(err);
    }
    Ok(written)
}
