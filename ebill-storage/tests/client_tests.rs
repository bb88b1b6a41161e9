//! Client contracts over the in-memory backend.

mod common;

use chrono::Utc;
use common::{client, MemoryBackend, BUCKET, CHUNK_SIZE};
use ebill_storage::{
    LifecycleOutcome, LifecyclePolicyManager, LifecycleRule, ObjectStoreClient, RuleAction,
    StorageError,
};
use serde_json::json;

#[tokio::test]
async fn missing_key_is_false_for_exists_but_not_found_for_download() {
    let backend = MemoryBackend::with_bucket();
    let client = client(&backend);
    let dir = tempfile::tempdir().unwrap();

    assert!(!client.exists(BUCKET, "qr/missing.png").await.unwrap());

    let err = client
        .download_to_file(BUCKET, "qr/missing.png", &dir.path().join("missing.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { ref key, .. } if key == "qr/missing.png"));
}

#[tokio::test]
async fn exists_on_missing_bucket_is_an_error() {
    let backend = MemoryBackend::new();
    let client = client(&backend);

    let err = client.exists("no-such-bucket", "qr/a.png").await.unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(ref name) if name == "no-such-bucket"));
}

#[tokio::test]
async fn download_to_file_writes_chunk_by_chunk() {
    let backend = MemoryBackend::with_bucket();
    backend.insert("bills/2024-01.pdf", b"%PDF-1.7 bill");
    let client = client(&backend);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2024-01.pdf");

    client
        .download_to_file(BUCKET, "bills/2024-01.pdf", &path)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.7 bill");
    assert_eq!(backend.chunks_served(), 13usize.div_ceil(CHUNK_SIZE));
}

#[tokio::test]
async fn create_bucket_is_idempotent() {
    let backend = MemoryBackend::new();
    let client = client(&backend);

    let first = client.create_bucket("bills", "EU").await.unwrap();
    let second = client.create_bucket("bills", "EU").await.unwrap();

    assert_eq!(first.name, "bills");
    assert_eq!(second.name, first.name);
    assert_eq!(second.location.as_deref(), Some("EU"));
}

#[tokio::test]
async fn upload_then_download_to_file() {
    let backend = MemoryBackend::with_bucket();
    let client = client(&backend);
    let dir = tempfile::tempdir().unwrap();

    let key = client
        .upload_buffer(BUCKET, b"qr-bytes".to_vec(), "qr/meter-1.png", "image/png")
        .await
        .unwrap();
    assert_eq!(key, "qr/meter-1.png");
    assert!(client.exists(BUCKET, &key).await.unwrap());

    let path = dir.path().join("meter-1.png");
    client.download_to_file(BUCKET, &key, &path).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"qr-bytes");

    let blob = client.stat(BUCKET, &key).await.unwrap().unwrap();
    assert_eq!(blob.size, Some(8));
    assert_eq!(blob.content_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn list_keys_filters_by_prefix() {
    let backend = MemoryBackend::with_bucket();
    backend.insert("qr/a.png", b"a");
    backend.insert("qr/b.png", b"b");
    backend.insert("bills/2024-01.pdf", b"pdf");
    let client = client(&backend);

    assert_eq!(
        client.list_keys(BUCKET, Some("qr/")).await.unwrap(),
        vec!["qr/a.png", "qr/b.png"]
    );
    assert_eq!(client.list_keys(BUCKET, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn delete_missing_is_not_found() {
    let backend = MemoryBackend::with_bucket();
    backend.insert("qr/a.png", b"a");
    let client = client(&backend);

    client.delete(BUCKET, "qr/a.png").await.unwrap();
    assert!(client.delete(BUCKET, "qr/a.png").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_many_reports_each_key() {
    let backend = MemoryBackend::with_bucket();
    for key in ["qr/a.png", "qr/b.png", "qr/c.png"] {
        backend.insert(key, b"x");
    }
    backend.fail_delete("qr/c.png");
    let client = client(&backend);

    let keys: Vec<String> = ["qr/a.png", "qr/b.png", "qr/c.png", "qr/gone.png"]
        .iter()
        .map(|k| k.to_string())
        .collect();

    let report = match client.delete_many(BUCKET, &keys).await {
        Err(StorageError::BulkDelete(report)) => report,
        other => panic!("expected BulkDelete, got {other:?}"),
    };

    let mut deleted = report.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["qr/a.png", "qr/b.png"]);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.missing().collect::<Vec<_>>(), vec!["qr/gone.png"]);
    assert!(backend.object("qr/c.png").is_some());
}

#[tokio::test]
async fn delete_many_succeeds_when_every_key_goes() {
    let backend = MemoryBackend::with_bucket();
    backend.insert("qr/a.png", b"a");
    backend.insert("qr/b.png", b"b");
    let client = client(&backend);

    let report = client
        .delete_many(BUCKET, &["qr/a.png".into(), "qr/b.png".into()])
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.total(), 2);
    assert!(backend.keys_with_prefix("qr/").is_empty());
}

#[tokio::test]
async fn signed_url_expires_after_requested_minutes() {
    let backend = MemoryBackend::with_bucket();
    let client = client(&backend);

    let before = Utc::now() - chrono::Duration::seconds(1);
    let grant = client
        .generate_signed_url(BUCKET, "zip/qrcodes.zip", 15, true)
        .await
        .unwrap();

    assert!(grant.issued_at >= before);
    assert_eq!(grant.expires_at - grant.issued_at, chrono::Duration::minutes(15));
    assert!(grant.is_valid_at(grant.issued_at));
    assert!(!grant.is_valid_at(grant.issued_at + chrono::Duration::minutes(15)));
    assert_eq!(grant.method, "GET");
    assert_eq!(
        grant.content_disposition.as_deref(),
        Some(r#"attachment; filename="qrcodes.zip""#)
    );
}

#[tokio::test]
async fn signed_url_without_forced_download_has_no_disposition() {
    let backend = MemoryBackend::with_bucket();
    let client = client(&backend);

    let grant = client
        .generate_signed_url(BUCKET, "bills/2024-01.pdf", 5, false)
        .await
        .unwrap();
    assert!(grant.content_disposition.is_none());
}

#[tokio::test]
async fn signed_url_expiry_must_be_one_minute_to_seven_days() {
    let backend = MemoryBackend::with_bucket();
    let client = client(&backend);

    for minutes in [0, 7 * 24 * 60 + 1] {
        assert!(matches!(
            client
                .generate_signed_url(BUCKET, "bills/2024-01.pdf", minutes, false)
                .await,
            Err(StorageError::InvalidArgument(_))
        ));
    }
    assert!(client
        .generate_signed_url(BUCKET, "bills/2024-01.pdf", 7 * 24 * 60, false)
        .await
        .is_ok());
}

#[tokio::test]
async fn lifecycle_policy_is_applied_once() {
    let backend = MemoryBackend::with_bucket();
    let client: ObjectStoreClient = client(&backend);
    let manager = LifecyclePolicyManager::default();

    assert_eq!(
        manager.apply(&client, BUCKET).await.unwrap(),
        LifecycleOutcome::Applied
    );
    assert_eq!(
        manager.apply(&client, BUCKET).await.unwrap(),
        LifecycleOutcome::Unchanged
    );
    assert_eq!(backend.lifecycle_writes(), 1);

    let stored = client.lifecycle_policy(BUCKET).await.unwrap();
    let rules: Vec<LifecycleRule> = serde_json::from_value(stored).unwrap();
    assert_eq!(rules.len(), 3);
    assert_eq!(rules[0].condition.matches_prefix, vec!["zip/"]);
    assert_eq!(rules[0].condition.age, Some(1));
    assert_eq!(
        rules[2].action,
        RuleAction::SetStorageClass {
            storage_class: "ARCHIVE".into()
        }
    );
}

#[tokio::test]
async fn foreign_lifecycle_rules_are_replaced() {
    let backend = MemoryBackend::with_bucket();
    backend.set_raw_lifecycle(json!([
        {"action": {"type": "AbortIncompleteMultipartUpload"}, "condition": {"age": 7}}
    ]));
    let client = client(&backend);

    assert_eq!(
        LifecyclePolicyManager::default()
            .apply(&client, BUCKET)
            .await
            .unwrap(),
        LifecycleOutcome::Applied
    );
    assert_eq!(backend.lifecycle_writes(), 1);
}

#[tokio::test]
async fn extra_condition_fields_trigger_a_rewrite() {
    let backend = MemoryBackend::with_bucket();
    let manager = LifecyclePolicyManager::default();
    let mut stored = serde_json::to_value(manager.rules()).unwrap();
    stored[0]["condition"]["isLive"] = json!(false);
    backend.set_raw_lifecycle(stored);
    let client = client(&backend);

    assert_eq!(
        manager.apply(&client, BUCKET).await.unwrap(),
        LifecycleOutcome::Applied
    );
    assert_eq!(
        manager.apply(&client, BUCKET).await.unwrap(),
        LifecycleOutcome::Unchanged
    );
    assert_eq!(backend.lifecycle_writes(), 1);
}

#[tokio::test]
async fn lifecycle_on_missing_bucket_fails() {
    let backend = MemoryBackend::new();
    let client = client(&backend);
    let err = LifecyclePolicyManager::default()
        .apply(&client, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::BucketNotFound(_)));
}
