//! Storage root behavior: lazy directories and purge.

mod common;

use apify_storage_local::{Record, Request, StorageError};
use serde_json::json;

#[tokio::test]
async fn test_family_dirs_created_lazily() {
    let (dir, storage) = common::storage();

    assert!(!dir.path().join("datasets").exists());
    assert!(!dir.path().join("key_value_stores").exists());
    assert!(!dir.path().join("request_queues").exists());

    storage.dataset("any").unwrap();
    assert!(dir.path().join("datasets").is_dir());
    assert!(!dir.path().join("request_queues").exists());

    storage.request_queues().unwrap();
    assert!(dir.path().join("request_queues").is_dir());
}

#[tokio::test]
async fn test_container_name_validation() {
    let (_dir, storage) = common::storage();
    assert!(matches!(
        storage.dataset("../escape"),
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(matches!(
        storage.request_queue(""),
        Err(StorageError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_purge_empties_default_containers() {
    let (dir, storage) = common::storage();

    // Default dataset with two items.
    storage
        .datasets()
        .unwrap()
        .get_or_create("default")
        .await
        .unwrap();
    let dataset = storage.dataset("default").unwrap();
    dataset
        .push_items(&json!([{"n": 1}, {"n": 2}]))
        .await
        .unwrap();

    // Default key-value store with an INPUT record and two others.
    storage
        .key_value_stores()
        .unwrap()
        .get_or_create("default")
        .await
        .unwrap();
    let store = storage.key_value_store("default").unwrap();
    store
        .set_record(&Record::json("INPUT", &json!({"seed": "https://example.com"})).unwrap())
        .await
        .unwrap();
    store.set_record(&Record::text("state", "x")).await.unwrap();
    store.set_record(&Record::text("OUTPUT", "y")).await.unwrap();

    // Default request queue with one request.
    storage
        .request_queues()
        .unwrap()
        .get_or_create("default")
        .await
        .unwrap();
    let queue = storage.request_queue("default").unwrap();
    queue
        .add_request(&Request::from_url("https://example.com"), Default::default())
        .await
        .unwrap();

    // A non-default container that must survive.
    storage
        .datasets()
        .unwrap()
        .get_or_create("keepme")
        .await
        .unwrap();
    let keepme = storage.dataset("keepme").unwrap();
    keepme.push_items(&json!({"n": 1})).await.unwrap();

    storage.purge().await.unwrap();

    // Dataset emptied, directory still there.
    let info = dataset.get().await.unwrap();
    assert_eq!(info.item_count, 0);

    // Only INPUT survived in the default key-value store.
    let store_dir = dir.path().join("key_value_stores").join("default");
    assert!(store_dir.join("INPUT.json").is_file());
    assert!(store.get_record("state").await.unwrap().is_none());
    assert!(store.get_record("OUTPUT").await.unwrap().is_none());
    let input = store.get_record("INPUT").await.unwrap().expect("INPUT kept");
    assert_eq!(input.as_json().unwrap(), json!({"seed": "https://example.com"}));

    // The queue database is gone; the queue must be recreated.
    assert!(matches!(
        queue.get().await,
        Err(StorageError::QueueNotFound(_))
    ));
    let recreated = storage
        .request_queues()
        .unwrap()
        .get_or_create("default")
        .await
        .unwrap();
    assert_eq!(recreated.total_request_count, 0);

    // Non-default containers untouched.
    assert_eq!(keepme.get().await.unwrap().item_count, 1);
}

#[tokio::test]
async fn test_purge_on_fresh_storage_is_a_no_op() {
    let (_dir, storage) = common::storage();
    storage.purge().await.unwrap();
}

#[tokio::test]
async fn test_queues_are_independent() {
    let (_dir, storage) = common::storage();
    let queues = storage.request_queues().unwrap();
    queues.get_or_create("one").await.unwrap();
    queues.get_or_create("two").await.unwrap();

    let one = storage.request_queue("one").unwrap();
    let two = storage.request_queue("two").unwrap();

    one.add_request(&Request::from_url("https://example.com/a"), Default::default())
        .await
        .unwrap();

    assert_eq!(one.get().await.unwrap().total_request_count, 1);
    assert_eq!(two.get().await.unwrap().total_request_count, 0);
}
