//! Key-value store clients: one file per record, named by key with an
//! extension inferred from the record's content type.

use std::path::PathBuf;

use tracing::debug;

use crate::config;
use crate::error::{Result, StorageError};
use crate::models::{fs_datetime, KeyInfo, KeyListing, KeyValueStoreInfo, Record};

/// Key page size when the caller does not specify one.
pub const DEFAULT_LIST_KEYS_LIMIT: u64 = 1000;

/// Longest accepted record key.
const MAX_KEY_LENGTH: usize = 256;

/// Options for [`KeyValueStoreClient::list_keys`].
#[derive(Debug, Clone, Default)]
pub struct ListKeysOptions {
    pub limit: Option<u64>,
    /// Return only keys lexicographically greater than this one.
    pub exclusive_start_key: Option<String>,
}

/// Client for one named key-value store.
pub struct KeyValueStoreClient {
    name: String,
    stores_dir: PathBuf,
}

impl KeyValueStoreClient {
    pub(crate) fn new(name: String, stores_dir: PathBuf) -> Self {
        Self { name, stores_dir }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn store_dir(&self) -> PathBuf {
        self.stores_dir.join(&self.name)
    }

    fn existing_dir(&self) -> Result<PathBuf> {
        let dir = self.store_dir();
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StorageError::NotFound(dir))
        }
    }

    /// Store metadata from directory timestamps.
    pub async fn get(&self) -> Result<KeyValueStoreInfo> {
        let dir = self.existing_dir()?;
        let metadata = tokio::fs::metadata(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        Ok(KeyValueStoreInfo {
            id: self.name.clone(),
            name: self.name.clone(),
            created_at: fs_datetime(metadata.created()),
            modified_at: fs_datetime(metadata.modified()),
            accessed_at: fs_datetime(metadata.accessed()),
        })
    }

    /// Rename the store directory.
    pub async fn update(&mut self, new_name: &str) -> Result<KeyValueStoreInfo> {
        config::validate_container_name(new_name)?;
        if new_name == self.name {
            return self.get().await;
        }
        let old_dir = self.existing_dir()?;
        let new_dir = self.stores_dir.join(new_name);
        if new_dir.exists() {
            return Err(StorageError::NameConflict(
                "Key-value store name is not unique.".to_string(),
            ));
        }
        tokio::fs::rename(&old_dir, &new_dir)
            .await
            .map_err(|err| StorageError::io(&old_dir, err))?;
        self.name = new_name.to_string();
        self.get().await
    }

    /// Remove the store and all its records.
    pub async fn delete(&self) -> Result<()> {
        let dir = self.existing_dir()?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))
    }

    /// Fetch a record; the content type is inferred back from the stored
    /// file's extension.
    pub async fn get_record(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;
        let dir = self.existing_dir()?;
        let Some(path) = record_file(&dir, key).await? else {
            return Ok(None);
        };
        let value = tokio::fs::read(&path)
            .await
            .map_err(|err| StorageError::io(&path, err))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin");
        Ok(Some(Record {
            key: key.to_string(),
            value,
            content_type: extension_to_content_type(extension).to_string(),
        }))
    }

    /// Write a record as `<key>.<ext>`, replacing any previous value
    /// stored under the same key (even under a different extension).
    pub async fn set_record(&self, record: &Record) -> Result<()> {
        validate_key(&record.key)?;
        let dir = self.existing_dir()?;

        if let Some(previous) = record_file(&dir, &record.key).await? {
            tokio::fs::remove_file(&previous)
                .await
                .map_err(|err| StorageError::io(&previous, err))?;
        }

        let extension = content_type_to_extension(&record.content_type);
        let path = dir.join(format!("{}.{extension}", record.key));
        tokio::fs::write(&path, &record.value)
            .await
            .map_err(|err| StorageError::io(&path, err))?;
        debug!(store = %self.name, key = %record.key, "set key-value record");
        Ok(())
    }

    /// Remove a record. Missing keys are a no-op, matching the remote
    /// service.
    pub async fn delete_record(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let dir = self.existing_dir()?;
        if let Some(path) = record_file(&dir, key).await? {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|err| StorageError::io(&path, err))?;
        }
        Ok(())
    }

    /// List keys in lexicographic order with cursor-style paging.
    pub async fn list_keys(&self, options: ListKeysOptions) -> Result<KeyListing> {
        let dir = self.existing_dir()?;
        let limit = options.limit.unwrap_or(DEFAULT_LIST_KEYS_LIMIT);

        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StorageError::io(&dir, err))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let size = entry
                .metadata()
                .await
                .map_err(|err| StorageError::io(&path, err))?
                .len();
            keys.push(KeyInfo {
                key: stem.to_string(),
                size,
            });
        }
        keys.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        if let Some(start) = &options.exclusive_start_key {
            keys.retain(|info| info.key.as_str() > start.as_str());
        }

        let is_truncated = keys.len() as u64 > limit;
        keys.truncate(limit as usize);
        let next_exclusive_start_key = if is_truncated {
            keys.last().map(|info| info.key.clone())
        } else {
            None
        };

        Ok(KeyListing {
            count: keys.len() as u64,
            items: keys,
            limit,
            exclusive_start_key: options.exclusive_start_key,
            is_truncated,
            next_exclusive_start_key,
        })
    }
}

/// Client for the key-value store collection.
pub struct KeyValueStoreCollectionClient {
    stores_dir: PathBuf,
}

impl KeyValueStoreCollectionClient {
    pub(crate) fn new(stores_dir: PathBuf) -> Self {
        Self { stores_dir }
    }

    /// Ensure the store directory exists, then return its info.
    pub async fn get_or_create(&self, name: &str) -> Result<KeyValueStoreInfo> {
        config::validate_container_name(name)?;
        let dir = self.stores_dir.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        KeyValueStoreClient::new(name.to_string(), self.stores_dir.clone())
            .get()
            .await
    }
}

/// Find the file storing `key`, whatever extension it was written with.
async fn record_file(dir: &PathBuf, key: &str) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| StorageError::io(dir, err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StorageError::io(dir, err))?
    {
        let path = entry.path();
        if path.is_file() && path.file_stem().and_then(|stem| stem.to_str()) == Some(key) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::InvalidArgument(format!(
            "Record key must be 1 to {MAX_KEY_LENGTH} characters long."
        )));
    }
    let valid = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '!' | '-' | '_' | '.' | '\'' | '(' | ')'));
    if !valid {
        return Err(StorageError::InvalidArgument(format!(
            "Record key contains invalid characters: {key}"
        )));
    }
    Ok(())
}

/// Map a content type to the extension records are stored under.
fn content_type_to_extension(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/gzip" => "gz",
        "text/html" => "html",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Inverse of [`content_type_to_extension`] for reads.
fn extension_to_content_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "json" => "application/json; charset=utf-8",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "html" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_round_trip() {
        assert_eq!(
            content_type_to_extension("application/json; charset=utf-8"),
            "json"
        );
        assert_eq!(content_type_to_extension("text/plain"), "txt");
        assert_eq!(content_type_to_extension("application/x-unknown"), "bin");
        assert_eq!(
            extension_to_content_type("json"),
            "application/json; charset=utf-8"
        );
        assert_eq!(extension_to_content_type("weird"), "application/octet-stream");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("INPUT").is_ok());
        assert!(validate_key("my-key_1.json('!')").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key(&"x".repeat(300)).is_err());
    }
}
