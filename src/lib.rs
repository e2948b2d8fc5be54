//! Local filesystem emulation of the Apify storage platform.
//!
//! Crawler code talks to three storage families through the same client
//! surface the hosted HTTP API exposes, so switching between local and
//! cloud backends needs no code changes:
//!
//! - **Datasets** — append-only item logs, one JSON file per item.
//! - **Key-value stores** — one file per record, named by key.
//! - **Request queues** — deduplicated, ordered, lockable work queues,
//!   each backed by its own SQLite database.
//!
//! Everything lives under a single storage root (`./apify_storage` by
//! default, `APIFY_LOCAL_STORAGE_DIR` overrides it):
//!
//! ```text
//! apify_storage/
//!   datasets/<name>/000000001.json
//!   key_value_stores/<name>/<key>.<ext>
//!   request_queues/<name>/db.sqlite
//! ```
//!
//! # Example
//!
//! ```no_run
//! use apify_storage_local::{AddRequestOptions, ApifyStorageLocal, Request};
//!
//! # async fn example() -> apify_storage_local::Result<()> {
//! let storage = ApifyStorageLocal::new();
//!
//! let queue_info = storage.request_queues()?.get_or_create("default").await?;
//! let queue = storage.request_queue(&queue_info.name)?;
//!
//! let request = Request::from_url("https://example.com");
//! queue.add_request(&request, AddRequestOptions::default()).await?;
//!
//! let head = queue.list_head(Default::default()).await?;
//! assert_eq!(head.items.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
mod database;
mod dataset;
mod error;
mod key_value_store;
mod models;
mod request_queue;
mod storage;

pub use config::StorageConfig;
pub use database::{ConnectionCache, DbHandle};
pub use dataset::{
    DatasetClient, DatasetCollectionClient, ListItemsOptions, DEFAULT_LIST_ITEMS_LIMIT,
};
pub use error::{Result, StorageError};
pub use key_value_store::{
    KeyValueStoreClient, KeyValueStoreCollectionClient, ListKeysOptions, DEFAULT_LIST_KEYS_LIMIT,
};
pub use models::{
    BatchAddResult, DatasetInfo, DatasetItemList, KeyInfo, KeyListing, KeyValueStoreInfo,
    LockedQueueHead, ProcessedRequest, ProlongedLock, QueueHead, QueueOperationInfo, Record,
    Request, RequestQueueInfo, UnprocessedRequest,
};
pub use request_queue::{
    unique_key_to_request_id, AddRequestOptions, DeleteLockOptions, ListAndLockHeadOptions,
    ListHeadOptions, ProlongLockOptions, RequestQueueClient, RequestQueueCollectionClient,
    DEFAULT_HEAD_LIMIT,
};
pub use storage::ApifyStorageLocal;
