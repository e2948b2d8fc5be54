//! Key-value store records: extension inference, round-trips, key paging.

mod common;

use apify_storage_local::{ListKeysOptions, Record, StorageError};
use serde_json::json;

async fn create_store(
    storage: &apify_storage_local::ApifyStorageLocal,
) -> apify_storage_local::KeyValueStoreClient {
    storage
        .key_value_stores()
        .unwrap()
        .get_or_create("store")
        .await
        .unwrap();
    storage.key_value_store("store").unwrap()
}

#[tokio::test]
async fn test_json_record_round_trip() {
    let (dir, storage) = common::storage();
    let store = create_store(&storage).await;

    let value = json!({"query": "rust sqlite", "page": 2});
    let record = Record::json("state", &value).unwrap();
    store.set_record(&record).await.unwrap();

    assert!(dir
        .path()
        .join("key_value_stores")
        .join("store")
        .join("state.json")
        .is_file());

    let loaded = store.get_record("state").await.unwrap().expect("record");
    assert_eq!(loaded.key, "state");
    assert_eq!(loaded.content_type, "application/json; charset=utf-8");
    assert_eq!(loaded.as_json().unwrap(), value);
}

#[tokio::test]
async fn test_text_and_binary_records() {
    let (dir, storage) = common::storage();
    let store = create_store(&storage).await;

    store
        .set_record(&Record::text("notes", "hello"))
        .await
        .unwrap();
    let loaded = store.get_record("notes").await.unwrap().expect("record");
    assert_eq!(loaded.value, b"hello");
    assert_eq!(loaded.content_type, "text/plain; charset=utf-8");

    let binary = Record {
        key: "blob".to_string(),
        value: vec![0, 159, 146, 150],
        content_type: "application/octet-stream".to_string(),
    };
    store.set_record(&binary).await.unwrap();
    let store_dir = dir.path().join("key_value_stores").join("store");
    assert!(store_dir.join("blob.bin").is_file());
    let loaded = store.get_record("blob").await.unwrap().expect("record");
    assert_eq!(loaded.value, binary.value);
}

#[tokio::test]
async fn test_set_record_replaces_previous_extension() {
    let (dir, storage) = common::storage();
    let store = create_store(&storage).await;

    store
        .set_record(&Record::json("state", &json!({"a": 1})).unwrap())
        .await
        .unwrap();
    store
        .set_record(&Record::text("state", "now text"))
        .await
        .unwrap();

    let store_dir = dir.path().join("key_value_stores").join("store");
    assert!(!store_dir.join("state.json").exists());
    assert!(store_dir.join("state.txt").is_file());

    let loaded = store.get_record("state").await.unwrap().expect("record");
    assert_eq!(loaded.content_type, "text/plain; charset=utf-8");
}

#[tokio::test]
async fn test_missing_and_deleted_records() {
    let (_dir, storage) = common::storage();
    let store = create_store(&storage).await;

    assert!(store.get_record("absent").await.unwrap().is_none());

    store
        .set_record(&Record::text("gone", "bye"))
        .await
        .unwrap();
    store.delete_record("gone").await.unwrap();
    assert!(store.get_record("gone").await.unwrap().is_none());

    // Deleting a missing record is a no-op.
    store.delete_record("gone").await.unwrap();
}

#[tokio::test]
async fn test_key_validation() {
    let (_dir, storage) = common::storage();
    let store = create_store(&storage).await;

    assert!(matches!(
        store.get_record("").await,
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.set_record(&Record::text("bad key", "x")).await,
        Err(StorageError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_list_keys_pagination() {
    let (_dir, storage) = common::storage();
    let store = create_store(&storage).await;

    for key in ["delta", "alpha", "echo", "bravo", "charlie"] {
        store.set_record(&Record::text(key, key)).await.unwrap();
    }

    let listing = store.list_keys(ListKeysOptions::default()).await.unwrap();
    let keys: Vec<_> = listing.items.iter().map(|k| k.key.as_str()).collect();
    assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    assert!(!listing.is_truncated);
    assert!(listing.next_exclusive_start_key.is_none());

    let listing = store
        .list_keys(ListKeysOptions {
            limit: Some(2),
            exclusive_start_key: None,
        })
        .await
        .unwrap();
    let keys: Vec<_> = listing.items.iter().map(|k| k.key.as_str()).collect();
    assert_eq!(keys, vec!["alpha", "bravo"]);
    assert!(listing.is_truncated);
    assert_eq!(listing.next_exclusive_start_key.as_deref(), Some("bravo"));

    let listing = store
        .list_keys(ListKeysOptions {
            limit: Some(2),
            exclusive_start_key: Some("bravo".to_string()),
        })
        .await
        .unwrap();
    let keys: Vec<_> = listing.items.iter().map(|k| k.key.as_str()).collect();
    assert_eq!(keys, vec!["charlie", "delta"]);
}

#[tokio::test]
async fn test_rename_and_delete_store() {
    let (dir, storage) = common::storage();
    storage
        .key_value_stores()
        .unwrap()
        .get_or_create("first")
        .await
        .unwrap();
    let mut store = storage.key_value_store("first").unwrap();
    store.set_record(&Record::text("k", "v")).await.unwrap();

    let info = store.update("second").await.unwrap();
    assert_eq!(info.name, "second");
    let family = dir.path().join("key_value_stores");
    assert!(family.join("second").join("k.txt").is_file());
    assert!(!family.join("first").exists());

    store.delete().await.unwrap();
    assert!(!family.join("second").exists());
    assert!(matches!(store.get().await, Err(StorageError::NotFound(_))));
}
