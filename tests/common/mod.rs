//! Shared setup for integration tests.

use apify_storage_local::{ApifyStorageLocal, ConnectionCache, StorageConfig};
use tempfile::TempDir;

/// Fresh storage in a temp directory with its own connection cache, so
/// tests stay isolated from each other and from the process-wide cache.
pub fn storage() -> (TempDir, ApifyStorageLocal) {
    let dir = TempDir::new().expect("create temp dir");
    let config = StorageConfig::with_storage_dir(dir.path());
    let storage = ApifyStorageLocal::with_config_and_cache(config, ConnectionCache::new(true));
    (dir, storage)
}
