//! Storage root configuration.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding the storage root directory.
pub const ENV_STORAGE_DIR: &str = "APIFY_LOCAL_STORAGE_DIR";

/// Environment variable toggling SQLite WAL journaling. Any value other
/// than `false`/`0` leaves WAL enabled.
pub const ENV_ENABLE_WAL_MODE: &str = "APIFY_LOCAL_STORAGE_ENABLE_WAL_MODE";

/// Default storage root when no override is configured.
pub const DEFAULT_STORAGE_DIR: &str = "./apify_storage";

/// Name of the default container in each storage family.
pub const DEFAULT_CONTAINER_NAME: &str = "default";

/// Storage root settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory holding the three storage-family subdirectories.
    pub storage_dir: PathBuf,
    /// Whether queue databases are opened in WAL mode.
    pub enable_wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let storage_dir = env::var(ENV_STORAGE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_DIR));

        let enable_wal_mode = env::var(ENV_ENABLE_WAL_MODE)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0"))
            .unwrap_or(true);

        Self {
            storage_dir,
            enable_wal_mode,
        }
    }
}

impl StorageConfig {
    /// Create a config rooted at the given directory, ignoring environment
    /// overrides.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            enable_wal_mode: true,
        }
    }

    /// Directory holding the dataset containers.
    pub fn datasets_dir(&self) -> PathBuf {
        self.storage_dir.join("datasets")
    }

    /// Directory holding the key-value store containers.
    pub fn key_value_stores_dir(&self) -> PathBuf {
        self.storage_dir.join("key_value_stores")
    }

    /// Directory holding the request queue containers.
    pub fn request_queues_dir(&self) -> PathBuf {
        self.storage_dir.join("request_queues")
    }

    /// Path of a single queue's database file.
    pub fn queue_db_path(&self, queue_name: &str) -> PathBuf {
        self.request_queues_dir().join(queue_name).join("db.sqlite")
    }
}

/// Path of the database file inside an already-resolved queue directory.
pub(crate) fn db_path_in(queue_dir: &Path) -> PathBuf {
    queue_dir.join("db.sqlite")
}

/// Container names become directory names, so they must not traverse.
pub(crate) fn validate_container_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::StorageError::InvalidArgument(
            "Storage name must not be empty.".to_string(),
        ));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(crate::StorageError::InvalidArgument(format!(
            "Storage name must not contain path separators: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_storage_dir() {
        // The env vars are process-global, so only assert the fallback when
        // the harness has not set them.
        if env::var(ENV_STORAGE_DIR).is_err() {
            let config = StorageConfig::default();
            assert_eq!(config.storage_dir, PathBuf::from(DEFAULT_STORAGE_DIR));
        }
    }

    #[test]
    fn test_family_dirs() {
        let config = StorageConfig::with_storage_dir("/tmp/storage");
        assert_eq!(config.datasets_dir(), PathBuf::from("/tmp/storage/datasets"));
        assert_eq!(
            config.key_value_stores_dir(),
            PathBuf::from("/tmp/storage/key_value_stores")
        );
        assert_eq!(
            config.queue_db_path("default"),
            PathBuf::from("/tmp/storage/request_queues/default/db.sqlite")
        );
    }
}
