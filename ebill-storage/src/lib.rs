//! ebill-storage: object storage for the billing platform.
//!
//! [`ObjectStoreClient`] is the single-object surface (buckets, blobs,
//! signed URLs, lifecycle rules). [`BundlingPipeline`] builds archives from
//! many objects. Backends plug in through [`ObjectBackend`] and [`UrlSigner`];
//! [`GcsBackend`] implements both for Google Cloud Storage.

pub mod bundle;
pub mod client;
pub mod error;
pub mod gcs;
pub mod lifecycle;
pub mod traits;
pub mod types;

pub use bundle::{ArchiveJob, BundlingPipeline};
pub use client::ObjectStoreClient;
pub use error::{StorageError, StorageResult};
pub use gcs::{GcsBackend, ServiceAccountKey};
pub use lifecycle::{LifecycleOutcome, LifecyclePolicyManager, LifecycleRule, RuleAction, RuleCondition};
pub use traits::{write_stream_to_file, ByteStream, ObjectBackend, UrlSigner};
pub use types::{
    BlobReference, BucketInfo, DeleteFailure, DeleteReport, ObjectMeta, SignRequest,
    SignedUrlGrant,
};
