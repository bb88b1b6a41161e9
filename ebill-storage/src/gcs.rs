//! Google Cloud Storage backend.
//!
//! Object reads, writes, listings and V4 signed URLs go through
//! `object_store`'s GCS store. Bucket administration, lifecycle rules and
//! object metadata patches have no `object_store` counterpart; they use the
//! JSON API directly, authorized with the store's own credential provider.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{
    Attribute, Attributes, ClientOptions, CredentialProvider, ObjectStore, PutOptions, PutPayload,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::lifecycle::LifecycleRule;
use crate::traits::{ByteStream, ObjectBackend, UrlSigner};
use crate::types::{BucketInfo, ObjectMeta, SignRequest, SignedUrlGrant, SIGNED_METHOD};

pub const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything except RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a single JSON API path segment.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Deepest `/`-delimited directory that contains every key starting with
/// `prefix`. Store listings are segment-based, so partial segments are
/// filtered after listing.
pub fn list_root(prefix: &str) -> Option<&str> {
    prefix
        .rfind('/')
        .map(|end| prefix[..end].trim_end_matches('/'))
        .filter(|root| !root.is_empty())
}

/// The fields of a service-account JSON key this crate reads itself.
///
/// The full document is handed to `object_store`, which owns the private key.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub client_email: String,
    /// Endpoint override for emulators
    #[serde(default)]
    pub gcs_base_url: Option<String>,
    #[serde(skip)]
    document: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> StorageResult<Self> {
        let mut key: Self = serde_json::from_str(json)
            .map_err(|e| StorageError::Config(format!("invalid service account key: {e}")))?;
        key.document = json.to_string();
        Ok(key)
    }

    pub fn from_file(path: &Path) -> StorageResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            StorageError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    fn base_url(&self) -> String {
        self.gcs_base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketResource {
    name: String,
    location: Option<String>,
    storage_class: Option<String>,
}

impl From<BucketResource> for BucketInfo {
    fn from(r: BucketResource) -> Self {
        BucketInfo {
            name: r.name,
            location: r.location,
            storage_class: r.storage_class,
        }
    }
}

/// Cloud Storage client authenticated as a service account.
pub struct GcsBackend {
    key: ServiceAccountKey,
    http: reqwest::Client,
    base_url: String,
    stores: Mutex<HashMap<String, Arc<GoogleCloudStorage>>>,
}

impl GcsBackend {
    pub fn new(key: ServiceAccountKey) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: key.base_url(),
            key,
            http,
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    /// The store for `bucket`, built on first use.
    fn store(&self, bucket: &str) -> StorageResult<Arc<GoogleCloudStorage>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::Config("object store cache poisoned".into()))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store));
        }

        let options = ClientOptions::new()
            .with_timeout(REQUEST_TIMEOUT)
            .with_allow_http(self.base_url.starts_with("http://"));
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket)
            .with_service_account_key(&self.key.document)
            .with_client_options(options)
            .build()?;
        let store = Arc::new(store);
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/storage/v1/b/{}", self.base_url, encode_component(bucket))
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/o/{}", self.bucket_url(bucket), encode_component(key))
    }

    /// JSON API request carrying the store's bearer token.
    async fn request(&self, bucket: &str, method: Method, url: &str) -> StorageResult<RequestBuilder> {
        let credential = self.store(bucket)?.credentials().get_credential().await?;
        let builder = self.http.request(method, url);
        Ok(if credential.bearer.is_empty() {
            builder
        } else {
            builder.bearer_auth(&credential.bearer)
        })
    }

    /// Ask the service to answer downloads of `key` with `disposition`.
    async fn set_content_disposition(
        &self,
        bucket: &str,
        key: &str,
        disposition: &str,
    ) -> StorageResult<()> {
        let response = self
            .request(bucket, Method::PATCH, &self.object_url(bucket, key))
            .await?
            .json(&json!({ "contentDisposition": disposition }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::not_found(bucket, key));
        }
        check(response, "set content disposition").await?;
        Ok(())
    }
}

/// Map a non-success response to a backend error.
async fn check(response: Response, operation: &'static str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StorageError::Backend {
        operation,
        status: status.as_u16(),
        body,
    })
}

fn object_error(bucket: &str, key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::not_found(bucket, key),
        other => StorageError::Store(other),
    }
}

#[async_trait]
impl ObjectBackend for GcsBackend {
    async fn insert_bucket(&self, name: &str, location: &str) -> StorageResult<BucketInfo> {
        let url = format!("{}/storage/v1/b", self.base_url);
        let response = self
            .request(name, Method::POST, &url)
            .await?
            .query(&[("project", self.project_id())])
            .json(&json!({ "name": name, "location": location }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(StorageError::Conflict(name.to_string()));
        }
        let bucket: BucketResource = check(response, "create bucket").await?.json().await?;
        Ok(bucket.into())
    }

    async fn get_bucket(&self, name: &str) -> StorageResult<BucketInfo> {
        let response = self
            .request(name, Method::GET, &self.bucket_url(name))
            .await?
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }
        let bucket: BucketResource = check(response, "get bucket").await?.json().await?;
        Ok(bucket.into())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectMeta> {
        let size = data.len() as u64;
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutOptions {
            attributes,
            ..PutOptions::default()
        };

        self.store(bucket)?
            .put_opts(&ObjectPath::from(key), PutPayload::from(data), options)
            .await
            .map_err(|e| object_error(bucket, key, e))?;
        debug!(bucket = %bucket, key = %key, size, "Object uploaded");
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            content_type: Some(content_type.to_string()),
            updated: None,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let result = self
            .store(bucket)?
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| object_error(bucket, key, e))?;
        result.bytes().await.map_err(|e| object_error(bucket, key, e))
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let result = self
            .store(bucket)?
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| object_error(bucket, key, e))?;
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<Option<ObjectMeta>> {
        match self.store(bucket)?.head(&ObjectPath::from(key)).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.size as u64,
                content_type: None,
                updated: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StorageResult<Vec<String>> {
        let store = self.store(bucket)?;
        let root = prefix.and_then(list_root).map(ObjectPath::from);

        let mut keys = Vec::new();
        let mut listing = store.list(root.as_ref());
        while let Some(meta) = listing.next().await {
            let meta = meta.map_err(|err| match err {
                object_store::Error::NotFound { .. } => {
                    StorageError::BucketNotFound(bucket.to_string())
                }
                other => StorageError::Store(other),
            })?;
            let key = meta.location.to_string();
            if prefix.map_or(true, |p| key.starts_with(p)) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.store(bucket)?
            .delete(&ObjectPath::from(key))
            .await
            .map_err(|e| object_error(bucket, key, e))
    }

    async fn get_lifecycle(&self, bucket: &str) -> StorageResult<Value> {
        let response = self
            .request(bucket, Method::GET, &self.bucket_url(bucket))
            .await?
            .query(&[("fields", "lifecycle")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        let resource: Value = check(response, "get lifecycle").await?.json().await?;
        Ok(resource
            .pointer("/lifecycle/rule")
            .cloned()
            .unwrap_or_else(|| json!([])))
    }

    async fn set_lifecycle(&self, bucket: &str, rules: &[LifecycleRule]) -> StorageResult<()> {
        let response = self
            .request(bucket, Method::PATCH, &self.bucket_url(bucket))
            .await?
            .query(&[("fields", "lifecycle")])
            .json(&json!({ "lifecycle": { "rule": rules } }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        check(response, "set lifecycle").await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }
}

#[async_trait]
impl UrlSigner for GcsBackend {
    /// V4 signed GET URL. A content disposition is stored on the object
    /// itself, so the object must exist when one is requested.
    async fn sign(&self, request: &SignRequest) -> StorageResult<SignedUrlGrant> {
        if let Some(disposition) = &request.content_disposition {
            self.set_content_disposition(&request.bucket, &request.key, disposition)
                .await?;
        }

        let url = self
            .store(&request.bucket)?
            .signed_url(Method::GET, &ObjectPath::from(request.key.as_str()), request.expires_in)
            .await
            .map_err(|e| StorageError::Signing(e.to_string()))?;

        let expires_in = chrono::Duration::from_std(request.expires_in)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        Ok(SignedUrlGrant {
            url: url.to_string(),
            method: SIGNED_METHOD,
            issued_at: request.issued_at,
            expires_at: request.issued_at + expires_in,
            content_disposition: request.content_disposition.clone(),
        })
    }
}
