//! Request queue clients: public operations on a single queue plus the
//! collection client that creates queues.
//!
//! A queue is one directory under `request_queues/` holding one SQLite
//! database. The client validates inputs, derives request IDs and order
//! keys, and hands the heavy lifting to the per-queue emulator engine.
//! Connections come from the shared [`ConnectionCache`], are opened
//! lazily, and are dropped before rename and delete so the directory can
//! be moved out from under them.

mod emulator;

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config;
use crate::database::ConnectionCache;
use crate::error::{Result, StorageError};
use crate::models::{
    parse_datetime, BatchAddResult, LockedQueueHead, ProlongedLock, QueueHead, QueueOperationInfo,
    Request, RequestQueueInfo,
};
use emulator::{
    is_foreign_key_violation, now_millis, QueueRow, RequestModel, RequestQueueEmulator,
};

/// Derived request IDs keep the first characters of the hash only.
const REQUEST_ID_LENGTH: usize = 15;

/// Head size used when the caller does not specify one.
pub const DEFAULT_HEAD_LIMIT: u32 = 100;

/// Compute a request ID from its deduplication key: base64 of
/// SHA-256(uniqueKey) with `+`, `/`, `=` stripped, truncated to 15 chars.
pub fn unique_key_to_request_id(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    BASE64
        .encode(digest)
        .chars()
        .filter(|c| !matches!(c, '+' | '/' | '='))
        .take(REQUEST_ID_LENGTH)
        .collect()
}

/// Options for [`RequestQueueClient::add_request`] and
/// [`RequestQueueClient::batch_add_requests`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AddRequestOptions {
    /// Place the request at the logical front of the queue.
    pub forefront: bool,
}

/// Options for [`RequestQueueClient::list_head`].
#[derive(Debug, Clone, Copy)]
pub struct ListHeadOptions {
    pub limit: u32,
}

impl Default for ListHeadOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HEAD_LIMIT,
        }
    }
}

/// Options for [`RequestQueueClient::list_and_lock_head`].
#[derive(Debug, Clone, Copy)]
pub struct ListAndLockHeadOptions {
    pub limit: u32,
    pub lock_secs: u32,
}

/// Options for [`RequestQueueClient::prolong_request_lock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProlongLockOptions {
    pub lock_secs: u32,
    /// Re-queue at the forefront once the lock expires or is released.
    pub forefront: bool,
}

/// Options for [`RequestQueueClient::delete_request_lock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteLockOptions {
    pub forefront: bool,
}

/// Client for one named request queue.
pub struct RequestQueueClient {
    name: String,
    queues_dir: PathBuf,
    cache: ConnectionCache,
}

impl RequestQueueClient {
    pub(crate) fn new(name: String, queues_dir: PathBuf, cache: ConnectionCache) -> Self {
        Self {
            name,
            queues_dir,
            cache,
        }
    }

    /// Queue name; also its externally visible id.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn queue_dir(&self) -> PathBuf {
        self.queues_dir.join(&self.name)
    }

    fn db_path(&self) -> PathBuf {
        config::db_path_in(&self.queue_dir())
    }

    /// Bind an emulator to the (lazily opened) cached connection.
    fn emulator(&self) -> Result<RequestQueueEmulator> {
        let handle = self
            .cache
            .open_with(&self.db_path(), RequestQueueEmulator::create_schema)
            .map_err(|err| match err {
                StorageError::NotFound(_) => StorageError::QueueNotFound(self.name.clone()),
                other => other,
            })?;
        Ok(RequestQueueEmulator::new(handle))
    }

    fn existing_queue(&self, em: &RequestQueueEmulator) -> Result<QueueRow> {
        em.select_by_name(&self.name)?
            .ok_or_else(|| StorageError::QueueNotFound(self.name.clone()))
    }

    fn map_queue_error(&self, err: StorageError) -> StorageError {
        if is_foreign_key_violation(&err) {
            StorageError::QueueNotFound(self.name.clone())
        } else {
            err
        }
    }

    /// Queue info. Bumps `accessedAt`.
    pub async fn get(&self) -> Result<RequestQueueInfo> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        em.update_accessed_at(row.id)?;
        Ok(queue_row_to_info(&row))
    }

    /// Rename the queue: disconnect, move the directory, update the row.
    pub async fn update(&mut self, new_name: &str) -> Result<RequestQueueInfo> {
        if new_name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "Request queue name must not be empty.".to_string(),
            ));
        }
        if new_name == self.name {
            return self.get().await;
        }

        let old_dir = self.queue_dir();
        if !old_dir.is_dir() {
            return Err(StorageError::QueueNotFound(self.name.clone()));
        }
        let new_dir = self.queues_dir.join(new_name);
        if new_dir.exists() {
            return Err(StorageError::NameConflict(
                "Request queue name is not unique.".to_string(),
            ));
        }

        self.cache.close(&self.db_path());
        tokio::fs::rename(&old_dir, &new_dir)
            .await
            .map_err(|err| StorageError::io(&old_dir, err))?;
        debug!(old = %self.name, new = %new_name, "renamed request queue");

        let old_name = std::mem::replace(&mut self.name, new_name.to_string());
        let em = self.emulator()?;
        let row = em
            .select_by_name(&old_name)?
            .ok_or_else(|| StorageError::QueueNotFound(old_name.clone()))?;
        em.update_name(row.id, new_name)?;
        let row = self.existing_queue(&em)?;
        Ok(queue_row_to_info(&row))
    }

    /// Drop the queue: disconnect and remove the directory.
    pub async fn delete(&self) -> Result<()> {
        let dir = self.queue_dir();
        if !dir.is_dir() {
            return Err(StorageError::QueueNotFound(self.name.clone()));
        }
        self.cache.close(&self.db_path());
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        Ok(())
    }

    /// The available head of the queue: pending, unlocked requests in
    /// ascending `orderNo` order. Bumps `accessedAt`.
    pub async fn list_head(&self, options: ListHeadOptions) -> Result<QueueHead> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let jsons = em.select_request_jsons_head(row.id, options.limit)?;
        em.update_accessed_at(row.id)?;
        Ok(QueueHead {
            limit: options.limit,
            queue_modified_at: parse_datetime(&row.modified_at),
            had_multiple_clients: false,
            items: parse_request_jsons(jsons)?,
        })
    }

    /// Insert a request unless its `uniqueKey` is already present.
    pub async fn add_request(
        &self,
        request: &Request,
        options: AddRequestOptions,
    ) -> Result<QueueOperationInfo> {
        validate_add(request)?;
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let model = request_model(row.id, request, options.forefront)?;
        em.add_request(&model).map_err(|err| self.map_queue_error(err))
    }

    /// Insert a batch of requests in one transaction. A missing queue row
    /// aborts the whole batch; duplicates become successful
    /// already-present entries.
    pub async fn batch_add_requests(
        &self,
        requests: &[Request],
        options: AddRequestOptions,
    ) -> Result<BatchAddResult> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;

        let models = requests
            .iter()
            .map(|request| {
                validate_add(request)?;
                request_model(row.id, request, options.forefront)
            })
            .collect::<Result<Vec<_>>>()?;

        let processed = em
            .batch_add_requests(&models)
            .map_err(|err| self.map_queue_error(err))?;
        Ok(BatchAddResult {
            processed_requests: processed,
            unprocessed_requests: Vec::new(),
        })
    }

    /// Fetch a single request by id. Bumps `accessedAt`.
    pub async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let json = em.select_request_json(row.id, request_id)?;
        em.update_accessed_at(row.id)?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Overwrite a stored request, or insert it when absent. The returned
    /// flags reflect the state before the call.
    pub async fn update_request(
        &self,
        request: &Request,
        options: AddRequestOptions,
    ) -> Result<QueueOperationInfo> {
        let request_id = request.id.as_deref().ok_or_else(|| {
            StorageError::InvalidArgument("Request must have an id.".to_string())
        })?;
        validate_url_and_unique_key(request)?;
        if request_id != unique_key_to_request_id(&request.unique_key) {
            return Err(StorageError::InvalidArgument(
                "Request ID does not match its uniqueKey.".to_string(),
            ));
        }

        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let model = request_model(row.id, request, options.forefront)?;
        em.update_request(&model)
            .map_err(|err| self.map_queue_error(err))
    }

    /// Atomically take the first `limit` available requests and lock them
    /// for `lock_secs` seconds. Locked requests disappear from head
    /// queries until the lock expires or is released.
    pub async fn list_and_lock_head(
        &self,
        options: ListAndLockHeadOptions,
    ) -> Result<LockedQueueHead> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let jsons = em.list_and_lock_head(row.id, options.limit, options.lock_secs)?;
        em.update_accessed_at(row.id)?;
        Ok(LockedQueueHead {
            limit: options.limit,
            lock_secs: options.lock_secs,
            queue_modified_at: parse_datetime(&row.modified_at),
            had_multiple_clients: false,
            items: parse_request_jsons(jsons)?,
        })
    }

    /// Extend a held lock; returns the new expiry instant.
    pub async fn prolong_request_lock(
        &self,
        request_id: &str,
        options: ProlongLockOptions,
    ) -> Result<ProlongedLock> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        let lock_expires_at =
            em.prolong_request_lock(row.id, request_id, options.lock_secs, options.forefront)?;
        Ok(ProlongedLock { lock_expires_at })
    }

    /// Release a held lock, making the request available immediately.
    pub async fn delete_request_lock(
        &self,
        request_id: &str,
        options: DeleteLockOptions,
    ) -> Result<()> {
        let em = self.emulator()?;
        let row = self.existing_queue(&em)?;
        em.delete_request_lock(row.id, request_id, options.forefront)
    }
}

/// Client for the queue collection: creates queues on demand.
pub struct RequestQueueCollectionClient {
    queues_dir: PathBuf,
    cache: ConnectionCache,
}

impl RequestQueueCollectionClient {
    pub(crate) fn new(queues_dir: PathBuf, cache: ConnectionCache) -> Self {
        Self { queues_dir, cache }
    }

    /// Ensure the queue directory and row exist, then return its info.
    pub async fn get_or_create(&self, name: &str) -> Result<RequestQueueInfo> {
        config::validate_container_name(name)?;
        let dir = self.queues_dir.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;

        let handle = self
            .cache
            .open_with(&config::db_path_in(&dir), RequestQueueEmulator::create_schema)?;
        let em = RequestQueueEmulator::new(handle);
        let row = em.select_or_insert_by_name(name)?;
        Ok(queue_row_to_info(&row))
    }
}

fn queue_row_to_info(row: &QueueRow) -> RequestQueueInfo {
    let pending = (row.total_request_count - row.handled_request_count).max(0);
    RequestQueueInfo {
        id: row.name.clone(),
        name: row.name.clone(),
        created_at: parse_datetime(&row.created_at),
        modified_at: parse_datetime(&row.modified_at),
        accessed_at: parse_datetime(&row.accessed_at),
        total_request_count: row.total_request_count.max(0) as u64,
        handled_request_count: row.handled_request_count.max(0) as u64,
        pending_request_count: pending as u64,
        had_multiple_clients: false,
    }
}

fn parse_request_jsons(jsons: Vec<String>) -> Result<Vec<Request>> {
    jsons
        .into_iter()
        .map(|json| serde_json::from_str(&json).map_err(StorageError::from))
        .collect()
}

fn validate_add(request: &Request) -> Result<()> {
    if request.id.is_some() {
        return Err(StorageError::InvalidArgument(
            "Request already has an id; did you mean to call updateRequest?".to_string(),
        ));
    }
    validate_url_and_unique_key(request)
}

fn validate_url_and_unique_key(request: &Request) -> Result<()> {
    if request.url.is_empty() {
        return Err(StorageError::InvalidArgument(
            "Request must have a url.".to_string(),
        ));
    }
    if request.unique_key.is_empty() {
        return Err(StorageError::InvalidArgument(
            "Request must have a uniqueKey.".to_string(),
        ));
    }
    Ok(())
}

/// Build the storable row: derive the id, pick the order key, and freeze
/// the canonical JSON blob with the id stamped in.
fn request_model(queue_id: i64, request: &Request, forefront: bool) -> Result<RequestModel> {
    let request_id = unique_key_to_request_id(&request.unique_key);
    if let Some(supplied) = &request.id {
        if supplied != &request_id {
            return Err(StorageError::InvalidArgument(
                "Request ID does not match its uniqueKey.".to_string(),
            ));
        }
    }

    let order_no = if request.is_handled() {
        None
    } else {
        let t = now_millis();
        Some(if forefront { -t } else { t })
    };

    let mut stored = request.clone();
    stored.id = Some(request_id.clone());
    let json = serde_json::to_string(&stored)?;

    Ok(RequestModel {
        queue_id,
        id: request_id,
        order_no,
        url: request.url.clone(),
        unique_key: request.unique_key.clone(),
        method: request.method_or_default().to_string(),
        retry_count: i64::from(request.retry_count.unwrap_or(0)),
        json,
    })
}
