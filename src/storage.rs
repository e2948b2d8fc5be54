//! Storage root: lazy directory layout, family clients, and `purge`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::config::{self, StorageConfig, DEFAULT_CONTAINER_NAME};
use crate::database::ConnectionCache;
use crate::dataset::{DatasetClient, DatasetCollectionClient};
use crate::error::{Result, StorageError};
use crate::key_value_store::{KeyValueStoreClient, KeyValueStoreCollectionClient};
use crate::request_queue::{RequestQueueClient, RequestQueueCollectionClient};

/// Entry point to the local storage emulation.
///
/// Mirrors the hosted client's surface: per-family accessors return clients
/// addressed by name, collection accessors create containers. The three
/// family directories come into being on first access; existing content is
/// kept, but populated containers are reported once per family so stale
/// state from a previous run does not go unnoticed.
pub struct ApifyStorageLocal {
    config: StorageConfig,
    cache: ConnectionCache,
    datasets_checked: AtomicBool,
    key_value_stores_checked: AtomicBool,
    request_queues_checked: AtomicBool,
}

impl Default for ApifyStorageLocal {
    fn default() -> Self {
        Self::new()
    }
}

impl ApifyStorageLocal {
    /// Storage rooted per environment/default configuration, using the
    /// process-wide connection cache.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        Self::with_config_and_cache(config, ConnectionCache::global())
    }

    /// Fully injected constructor, used by tests to isolate the cache.
    pub fn with_config_and_cache(config: StorageConfig, cache: ConnectionCache) -> Self {
        cache.set_wal_mode(config.enable_wal_mode);
        Self {
            config,
            cache,
            datasets_checked: AtomicBool::new(false),
            key_value_stores_checked: AtomicBool::new(false),
            request_queues_checked: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Client for one named dataset.
    pub fn dataset(&self, name: &str) -> Result<DatasetClient> {
        config::validate_container_name(name)?;
        let dir = self.ensure_family_dir(self.config.datasets_dir(), &self.datasets_checked)?;
        Ok(DatasetClient::new(name.to_string(), dir))
    }

    /// Collection client creating datasets.
    pub fn datasets(&self) -> Result<DatasetCollectionClient> {
        let dir = self.ensure_family_dir(self.config.datasets_dir(), &self.datasets_checked)?;
        Ok(DatasetCollectionClient::new(dir))
    }

    /// Client for one named key-value store.
    pub fn key_value_store(&self, name: &str) -> Result<KeyValueStoreClient> {
        config::validate_container_name(name)?;
        let dir = self.ensure_family_dir(
            self.config.key_value_stores_dir(),
            &self.key_value_stores_checked,
        )?;
        Ok(KeyValueStoreClient::new(name.to_string(), dir))
    }

    /// Collection client creating key-value stores.
    pub fn key_value_stores(&self) -> Result<KeyValueStoreCollectionClient> {
        let dir = self.ensure_family_dir(
            self.config.key_value_stores_dir(),
            &self.key_value_stores_checked,
        )?;
        Ok(KeyValueStoreCollectionClient::new(dir))
    }

    /// Client for one named request queue.
    pub fn request_queue(&self, name: &str) -> Result<RequestQueueClient> {
        config::validate_container_name(name)?;
        let dir = self.ensure_family_dir(
            self.config.request_queues_dir(),
            &self.request_queues_checked,
        )?;
        Ok(RequestQueueClient::new(
            name.to_string(),
            dir,
            self.cache.clone(),
        ))
    }

    /// Collection client creating request queues.
    pub fn request_queues(&self) -> Result<RequestQueueCollectionClient> {
        let dir = self.ensure_family_dir(
            self.config.request_queues_dir(),
            &self.request_queues_checked,
        )?;
        Ok(RequestQueueCollectionClient::new(dir, self.cache.clone()))
    }

    /// Empty the three default containers. Every file in the default
    /// key-value store whose basename is `INPUT` survives, so a crawler's
    /// input carries over to the next run.
    pub async fn purge(&self) -> Result<()> {
        let dataset_dir = self.config.datasets_dir().join(DEFAULT_CONTAINER_NAME);
        clear_dir(&dataset_dir, |_| false).await?;

        let store_dir = self
            .config
            .key_value_stores_dir()
            .join(DEFAULT_CONTAINER_NAME);
        clear_dir(&store_dir, |path| is_input_record(path)).await?;

        let queue_dir = self
            .config
            .request_queues_dir()
            .join(DEFAULT_CONTAINER_NAME);
        self.cache.close(&config::db_path_in(&queue_dir));
        clear_dir(&queue_dir, |_| false).await?;

        Ok(())
    }

    fn ensure_family_dir(&self, dir: PathBuf, checked: &AtomicBool) -> Result<PathBuf> {
        let existed = dir.is_dir();
        std::fs::create_dir_all(&dir).map_err(|err| StorageError::io(&dir, err))?;

        if !checked.swap(true, Ordering::SeqCst) && existed {
            let preserve_input = dir == self.config.key_value_stores_dir();
            let populated = populated_containers(&dir, preserve_input);
            if !populated.is_empty() {
                warn!(
                    directory = %dir.display(),
                    containers = %populated.join(", "),
                    "storage directory contains data from a previous run; \
                     call purge() or remove it to start clean"
                );
            }
        }
        Ok(dir)
    }
}

/// Names of container directories that hold anything beyond what a clean
/// run would leave behind.
fn populated_containers(family_dir: &Path, preserve_input: bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(family_dir) else {
        return Vec::new();
    };

    let mut populated = Vec::new();
    for entry in entries.flatten() {
        let container = entry.path();
        if !container.is_dir() {
            continue;
        }
        let Ok(children) = std::fs::read_dir(&container) else {
            continue;
        };
        let has_content = children
            .flatten()
            .any(|child| !(preserve_input && is_input_record(&child.path())));
        if has_content {
            if let Some(name) = container.file_name().and_then(|name| name.to_str()) {
                populated.push(name.to_string());
            }
        }
    }
    populated.sort_unstable();
    populated
}

/// `INPUT` with any (or no) extension.
fn is_input_record(path: &Path) -> bool {
    path.file_stem().and_then(|stem| stem.to_str()) == Some("INPUT")
}

/// Delete everything inside `dir` except entries `keep` approves of.
/// Missing directories are fine; `purge` must work on a fresh storage.
async fn clear_dir(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| StorageError::io(dir, err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StorageError::io(dir, err))?
    {
        let path = entry.path();
        if keep(&path) {
            continue;
        }
        let result = if path.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|err| StorageError::io(&path, err))?;
    }
    Ok(())
}
