#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ebill_storage::{
    BucketInfo, ByteStream, LifecycleRule, ObjectBackend, ObjectMeta, ObjectStoreClient,
    SignRequest, SignedUrlGrant, StorageError, StorageResult, UrlSigner,
};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

pub const BUCKET: &str = "electricity-billing-system-bucket-test";

/// Size of the chunks `get_stream` hands out.
pub const CHUNK_SIZE: usize = 4;

struct Bucket {
    location: String,
    objects: BTreeMap<String, (Bytes, String)>,
    lifecycle: Value,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            location: String::new(),
            objects: BTreeMap::new(),
            lifecycle: json!([]),
        }
    }
}

/// In-memory backend with failure injection and call accounting.
#[derive(Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, Bucket>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
    get_delay: Mutex<Option<Duration>>,
    gets_in_flight: AtomicUsize,
    peak_gets: AtomicUsize,
    completed_gets: AtomicUsize,
    chunks_served: AtomicUsize,
    lifecycle_writes: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend with `BUCKET` already created.
    pub fn with_bucket() -> Arc<Self> {
        let backend = Self::new();
        backend.buckets.lock().unwrap().insert(
            BUCKET.to_string(),
            Bucket {
                location: "EU".into(),
                ..Bucket::default()
            },
        );
        backend
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(BUCKET.to_string()).or_default();
        bucket.objects.insert(
            key.to_string(),
            (Bytes::copy_from_slice(data), "image/png".into()),
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.buckets
            .lock()
            .unwrap()
            .get(BUCKET)
            .and_then(|b| b.objects.get(key).map(|(data, _)| data.clone()))
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.buckets
            .lock()
            .unwrap()
            .get(BUCKET)
            .map(|b| {
                b.objects
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fail_get(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_delete(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    pub fn peak_concurrent_gets(&self) -> usize {
        self.peak_gets.load(Ordering::SeqCst)
    }

    /// Downloads that ran to completion and returned data.
    pub fn completed_gets(&self) -> usize {
        self.completed_gets.load(Ordering::SeqCst)
    }

    pub fn chunks_served(&self) -> usize {
        self.chunks_served.load(Ordering::SeqCst)
    }

    /// Store rules verbatim, as another tool might have written them.
    pub fn set_raw_lifecycle(&self, rules: Value) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.entry(BUCKET.to_string()).or_default().lifecycle = rules;
    }

    pub fn lifecycle_writes(&self) -> usize {
        self.lifecycle_writes.load(Ordering::SeqCst)
    }

    fn unavailable(operation: &'static str) -> StorageError {
        StorageError::Backend {
            operation,
            status: 503,
            body: "injected failure".into(),
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn insert_bucket(&self, name: &str, location: &str) -> StorageResult<BucketInfo> {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.contains_key(name) {
            return Err(StorageError::Conflict(name.to_string()));
        }
        buckets.insert(
            name.to_string(),
            Bucket {
                location: location.to_string(),
                ..Bucket::default()
            },
        );
        Ok(BucketInfo {
            name: name.to_string(),
            location: Some(location.to_string()),
            storage_class: Some("STANDARD".into()),
        })
    }

    async fn get_bucket(&self, name: &str) -> StorageResult<BucketInfo> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get(name)
            .ok_or_else(|| StorageError::BucketNotFound(name.to_string()))?;
        Ok(BucketInfo {
            name: name.to_string(),
            location: Some(bucket.location.clone()),
            storage_class: Some("STANDARD".into()),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectMeta> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Self::unavailable("upload"));
        }
        let mut buckets = self.buckets.lock().unwrap();
        let objects = &mut buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?
            .objects;
        let size = data.len() as u64;
        objects.insert(key.to_string(), (data, content_type.to_string()));
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            content_type: Some(content_type.to_string()),
            updated: None,
        })
    }

    /// Injected failures answer at once; everything else waits out the delay.
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        if self.failing_gets.lock().unwrap().contains(key) {
            return Err(Self::unavailable("download"));
        }

        let in_flight = self.gets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_gets.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.gets_in_flight.fetch_sub(1, Ordering::SeqCst);

        let data = self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::not_found(bucket, key))?;
        self.completed_gets.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(bucket, key).await?;
        let chunks: Vec<StorageResult<Bytes>> = data
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        self.chunks_served.fetch_add(chunks.len(), Ordering::SeqCst);
        Ok(stream::iter(chunks).boxed())
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket
            .objects
            .get(key)
            .map(|(data, content_type)| ObjectMeta {
                key: key.to_string(),
                size: data.len() as u64,
                content_type: Some(content_type.clone()),
                updated: None,
            }))
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket
            .objects
            .keys()
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(Self::unavailable("delete"));
        }
        self.buckets
            .lock()
            .unwrap()
            .get_mut(bucket)
            .and_then(|b| b.objects.remove(key))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    async fn get_lifecycle(&self, bucket: &str) -> StorageResult<Value> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(bucket)
            .map(|b| b.lifecycle.clone())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
    }

    async fn set_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StorageResult<()> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        bucket.lifecycle = serde_json::to_value(rules)?;
        self.lifecycle_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Deterministic signer: `https://signed.test/<bucket>/<key>?expires=<unix>`.
#[derive(Default)]
pub struct FixedSigner {
    fail: AtomicBool,
}

impl FixedSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl UrlSigner for FixedSigner {
    async fn sign(&self, request: &SignRequest) -> StorageResult<SignedUrlGrant> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Signing("injected signing failure".into()));
        }
        let expires_at = request.issued_at
            + chrono::Duration::from_std(request.expires_in)
                .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        Ok(SignedUrlGrant {
            url: format!(
                "https://signed.test/{}/{}?expires={}",
                request.bucket,
                request.key,
                expires_at.timestamp()
            ),
            method: "GET",
            issued_at: request.issued_at,
            expires_at,
            content_disposition: request.content_disposition.clone(),
        })
    }
}

pub fn client(backend: &Arc<MemoryBackend>) -> ObjectStoreClient {
    ObjectStoreClient::new(backend.clone(), FixedSigner::new())
}
