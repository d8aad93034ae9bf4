//! Integration tests for the prefixed key/value store.

mod common;

use std::path::Path;
use std::sync::Arc;

use lesson_store::{
    ErrorKind, FileBackend, FileDeviceId, MemoryBackend, RawStore, StorageOptions, StorageService,
    StorageStats, StoreConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::tempdir;

use common::{memory_service, open_service, open_service_with, FailOn, FlakyBackend};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LessonPlan {
    title: String,
    grade: u8,
    objectives: Vec<String>,
}

#[tokio::test]
async fn user_profile_set_get_remove() {
    let (service, _) = memory_service().await;
    let store = service.store();
    let opts = StorageOptions::default();

    store
        .set_item("user_profile_42", &json!({"name": "Ana"}), &opts)
        .await
        .unwrap();
    assert_eq!(
        store.get_item::<Value>("user_profile_42", &opts).await.unwrap(),
        Some(json!({"name": "Ana"}))
    );

    store.remove_item("user_profile_42").await.unwrap();
    assert_eq!(store.get_item::<Value>("user_profile_42", &opts).await.unwrap(), None);
    // Removing again is not an error.
    store.remove_item("user_profile_42").await.unwrap();
}

#[tokio::test]
async fn encrypted_records_are_not_plaintext_at_rest() {
    let (service, backend) = memory_service().await;
    let plan = LessonPlan {
        title: "Fractions".into(),
        grade: 4,
        objectives: vec!["compare halves".into()],
    };
    service
        .store()
        .set_item("lesson_plans", &plan, &StorageOptions::default())
        .await
        .unwrap();

    let raw = backend.get("lesson_plan_lesson_plans").await.unwrap().unwrap();
    assert!(!raw.contains("Fractions"));
    assert_eq!(
        service.cipher().decrypt(&raw).await.unwrap(),
        serde_json::to_string(&plan).unwrap()
    );
    let back: Option<LessonPlan> = service
        .store()
        .get_item("lesson_plans", &StorageOptions::default())
        .await
        .unwrap();
    assert_eq!(back, Some(plan));
}

#[tokio::test]
async fn empty_store_stats() {
    let (service, _) = memory_service().await;
    let stats = service.store().storage_stats().await.unwrap();
    assert_eq!(
        stats,
        StorageStats {
            total_size: 0,
            item_count: 0,
            keys: vec![],
            estimated_size_mb: 0.0,
            secure_item_count: 0,
        }
    );
}

#[tokio::test]
async fn batch_get_preserves_requested_order() {
    let (service, _) = memory_service().await;
    let store = service.store();
    let opts = StorageOptions::default();
    store
        .batch_set(&[("k3", json!(3)), ("k1", json!(1))], &opts)
        .await
        .unwrap();

    let values: Vec<Option<Value>> = store
        .batch_get(&["k1", "k2", "k3"], &opts)
        .await
        .unwrap();
    assert_eq!(values, vec![Some(json!(1)), None, Some(json!(3))]);
}

#[tokio::test]
async fn clear_all_only_touches_own_prefix() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set("other_app_token", "keep".into()).await.unwrap();

    let archive_config = StoreConfig {
        key_prefix: "archive_".into(),
        ..StoreConfig::default()
    };
    StoreConfig::default()
        .check_shared_backend(&archive_config)
        .unwrap();
    let planner = open_service(backend.clone()).await;
    let archive = open_service_with(archive_config, backend.clone()).await;
    let opts = StorageOptions::default();
    planner.store().set_item("lesson_plans", &json!([1]), &opts).await.unwrap();
    planner.store().set_secure("grades", &json!({"a": 1})).await.unwrap();
    archive.store().set_item("lesson_plans", &json!([2]), &opts).await.unwrap();

    assert_eq!(planner.store().clear_all().await.unwrap(), 2);

    assert!(planner.store().all_keys().await.unwrap().is_empty());
    assert_eq!(
        archive.store().get_item::<Value>("lesson_plans", &opts).await.unwrap(),
        Some(json!([2]))
    );
    assert_eq!(
        backend.get("other_app_token").await.unwrap().as_deref(),
        Some("keep")
    );
    // The salt survives, so archive records stay readable.
    assert!(backend.get(&StoreConfig::default().salt_key).await.unwrap().is_some());
}

#[tokio::test]
async fn has_item_distinguishes_absent_from_failed() {
    let backend = Arc::new(FlakyBackend::new(
        FailOn::Get,
        0,
        || lesson_store::BackendError::Unavailable("disk detached".into()),
    ));
    let service = open_service(backend.clone()).await;
    let store = service.store();

    assert!(!store.has_item("lesson_plans").await.unwrap());
    store
        .set_item("lesson_plans", &json!([]), &StorageOptions::default())
        .await
        .unwrap();
    assert!(store.has_item("lesson_plans").await.unwrap());

    backend.arm(1);
    let err = store.has_item("lesson_plans").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadError);
}

#[tokio::test]
async fn batch_write_failure_is_one_batch_error() {
    let backend = Arc::new(FlakyBackend::new(FailOn::Set, 0, || {
        lesson_store::BackendError::Timeout
    }));
    let service = open_service(backend.clone()).await;
    backend.arm(2);
    let err = service
        .store()
        .batch_set(&[("a", 1), ("b", 2)], &StorageOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchError);
}

fn read_only_volume() -> lesson_store::BackendError {
    lesson_store::BackendError::PermissionDenied("read-only volume".into())
}

#[tokio::test]
async fn failed_counterpart_removal_rolls_back_secure_write() {
    let backend = Arc::new(FlakyBackend::new(FailOn::Remove, 0, read_only_volume));
    let service = open_service(backend.clone()).await;
    let store = service.store();
    let plain = StorageOptions::plaintext();
    store.set_item("grades", &json!({"math": "A"}), &plain).await.unwrap();

    backend.arm(1);
    let err = store.set_secure("grades", &json!({"math": "B"})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionError);

    assert_eq!(
        store.get_item::<Value>("grades", &plain).await.unwrap(),
        Some(json!({"math": "A"}))
    );
    assert_eq!(store.get_secure::<Value>("grades").await.unwrap(), None);
    assert_eq!(store.all_keys().await.unwrap(), vec!["grades".to_string()]);
}

#[tokio::test]
async fn failed_counterpart_removal_restores_previous_value() {
    let backend = Arc::new(FlakyBackend::new(FailOn::Remove, 0, read_only_volume));
    let service = open_service(backend.clone()).await;
    let store = service.store();
    let plain = StorageOptions::plaintext();
    store.set_item("grades", &json!({"math": "A"}), &plain).await.unwrap();
    store.set_secure("grades", &json!({"math": "B"})).await.unwrap();
    // Keeps one stale plain copy behind the secure one.
    backend
        .inner()
        .set("lesson_plan_grades", r#"{"math":"old"}"#.into())
        .await
        .unwrap();

    backend.arm(1);
    assert!(store
        .set_item("grades", &json!({"math": "C"}), &plain)
        .await
        .is_err());
    assert_eq!(
        store.get_item::<Value>("grades", &plain).await.unwrap(),
        Some(json!({"math": "old"}))
    );
    assert_eq!(
        store.get_secure::<Value>("grades").await.unwrap(),
        Some(json!({"math": "B"}))
    );
}

#[tokio::test]
async fn failed_batch_counterpart_removal_rolls_back() {
    let backend = Arc::new(FlakyBackend::new(FailOn::Remove, 0, read_only_volume));
    let service = open_service(backend.clone()).await;
    let store = service.store();
    let plain = StorageOptions::plaintext();
    store.set_secure("grades", &json!({"math": "S"})).await.unwrap();
    store.set_item("notes", &json!("before"), &plain).await.unwrap();

    backend.arm(1);
    let err = store
        .batch_set(&[("grades", json!("X")), ("notes", json!("after"))], &plain)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchError);

    assert_eq!(store.get_item::<Value>("grades", &plain).await.unwrap(), None);
    assert_eq!(
        store.get_secure::<Value>("grades").await.unwrap(),
        Some(json!({"math": "S"}))
    );
    assert_eq!(
        store.get_item::<Value>("notes", &plain).await.unwrap(),
        Some(json!("before"))
    );
}

#[tokio::test]
async fn backup_survives_clear() {
    let (service, _) = memory_service().await;
    let store = service.store();
    let opts = StorageOptions::default();
    store.set_item("curriculum_data", &json!(["unit 1"]), &opts).await.unwrap();
    store
        .set_item("temp_drafts", &json!(["draft"]), &StorageOptions::plaintext())
        .await
        .unwrap();
    store.set_secure("parent_contact", &json!({"phone": "555"})).await.unwrap();

    let backup = store.export_backup().await.unwrap();
    assert_eq!(store.clear_all().await.unwrap(), 3);
    assert_eq!(store.import_backup(&backup).await.unwrap(), 3);

    assert_eq!(
        store.get_item::<Value>("curriculum_data", &opts).await.unwrap(),
        Some(json!(["unit 1"]))
    );
    assert_eq!(
        store
            .get_item::<Value>("temp_drafts", &StorageOptions::plaintext())
            .await
            .unwrap(),
        Some(json!(["draft"]))
    );
    assert_eq!(
        store.get_secure::<Value>("parent_contact").await.unwrap(),
        Some(json!({"phone": "555"}))
    );
}

#[tokio::test]
async fn tampered_backup_is_rejected() {
    let (service, _) = memory_service().await;
    let err = service.store().import_backup("bm90IGEgYmFja3Vw").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecryptionError);
}

async fn open_on_disk(store_path: &Path, device_path: &Path) -> StorageService {
    let backend = FileBackend::open(store_path).await.unwrap();
    StorageService::open(
        StoreConfig::default(),
        Arc::new(backend),
        Arc::new(FileDeviceId::new(device_path)),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn restart_rederives_key_from_persisted_salt() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("records.json");
    let device_path = dir.path().join("device_id");

    let first = open_on_disk(&store_path, &device_path).await;
    let fingerprint = first.keys().fingerprint().await.unwrap();
    first
        .store()
        .set_item("user_preferences", &json!({"theme": "dark"}), &StorageOptions::default())
        .await
        .unwrap();
    first.close().await;
    drop(first);

    let second = open_on_disk(&store_path, &device_path).await;
    assert_eq!(second.keys().fingerprint().await.unwrap(), fingerprint);
    assert_eq!(
        second
            .store()
            .get_item::<Value>("user_preferences", &StorageOptions::default())
            .await
            .unwrap(),
        Some(json!({"theme": "dark"}))
    );
}

#[tokio::test]
async fn closed_service_rejects_operations() {
    let (service, _) = memory_service().await;
    service.close().await;
    let err = service
        .store()
        .set_item("lesson_plans", &json!([]), &StorageOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(!service.keys().is_initialized().await);
}

#[tokio::test]
async fn disabled_encryption_stores_plaintext() {
    let backend = Arc::new(MemoryBackend::new());
    let service = open_service_with(
        StoreConfig {
            encryption_enabled: false,
            ..StoreConfig::default()
        },
        backend.clone(),
    )
    .await;
    service
        .store()
        .set_item("app_settings", &json!({"lang": "pt"}), &StorageOptions::default())
        .await
        .unwrap();
    assert_eq!(
        backend.get("lesson_plan_app_settings").await.unwrap().as_deref(),
        Some(r#"{"lang":"pt"}"#)
    );
}
