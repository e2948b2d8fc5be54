//! Dataset clients: append-only item logs, one JSON file per item.
//!
//! Items live directly in the dataset directory as
//! `<9-digit zero-padded index>.json`, starting at `000000001.json`.
//! Indices only ever grow, so appending continues from the highest
//! existing file even after items were downloaded and the process
//! restarted.

use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use crate::config;
use crate::error::{Result, StorageError};
use crate::models::{fs_datetime, DatasetInfo, DatasetItemList};

/// Width of the zero-padded index in item file names.
const INDEX_WIDTH: usize = 9;

/// Item page size when the caller does not specify one.
pub const DEFAULT_LIST_ITEMS_LIMIT: u64 = 250;

/// Options for [`DatasetClient::list_items`].
#[derive(Debug, Clone, Copy)]
pub struct ListItemsOptions {
    pub offset: u64,
    pub limit: u64,
    /// Newest first when set.
    pub desc: bool,
}

impl Default for ListItemsOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_LIST_ITEMS_LIMIT,
            desc: false,
        }
    }
}

/// Client for one named dataset.
pub struct DatasetClient {
    name: String,
    datasets_dir: PathBuf,
}

impl DatasetClient {
    pub(crate) fn new(name: String, datasets_dir: PathBuf) -> Self {
        Self { name, datasets_dir }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn dataset_dir(&self) -> PathBuf {
        self.datasets_dir.join(&self.name)
    }

    fn existing_dir(&self) -> Result<PathBuf> {
        let dir = self.dataset_dir();
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StorageError::NotFound(dir))
        }
    }

    /// Dataset metadata, with the item count taken from the directory.
    pub async fn get(&self) -> Result<DatasetInfo> {
        let dir = self.existing_dir()?;
        let items = item_files(&dir).await?;
        let metadata = tokio::fs::metadata(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        Ok(DatasetInfo {
            id: self.name.clone(),
            name: self.name.clone(),
            item_count: items.len() as u64,
            created_at: fs_datetime(metadata.created()),
            modified_at: fs_datetime(metadata.modified()),
            accessed_at: fs_datetime(metadata.accessed()),
        })
    }

    /// Rename the dataset directory.
    pub async fn update(&mut self, new_name: &str) -> Result<DatasetInfo> {
        config::validate_container_name(new_name)?;
        if new_name == self.name {
            return self.get().await;
        }
        let old_dir = self.existing_dir()?;
        let new_dir = self.datasets_dir.join(new_name);
        if new_dir.exists() {
            return Err(StorageError::NameConflict(
                "Dataset name is not unique.".to_string(),
            ));
        }
        tokio::fs::rename(&old_dir, &new_dir)
            .await
            .map_err(|err| StorageError::io(&old_dir, err))?;
        self.name = new_name.to_string();
        self.get().await
    }

    /// Remove the dataset and everything in it.
    pub async fn delete(&self) -> Result<()> {
        let dir = self.existing_dir()?;
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))
    }

    /// Append one item (a JSON object) or several (an array of objects).
    pub async fn push_items(&self, items: &Value) -> Result<()> {
        let dir = self.existing_dir()?;
        let items = flatten_items(items)?;

        let mut next_index = item_files(&dir)
            .await?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);

        for item in items {
            let path = dir.join(format!("{next_index:0INDEX_WIDTH$}.json"));
            let body = serde_json::to_vec_pretty(item)?;
            tokio::fs::write(&path, body)
                .await
                .map_err(|err| StorageError::io(&path, err))?;
            next_index += 1;
        }
        debug!(dataset = %self.name, "pushed dataset items");
        Ok(())
    }

    /// Page through stored items in index order.
    pub async fn list_items(&self, options: ListItemsOptions) -> Result<DatasetItemList> {
        let dir = self.existing_dir()?;
        let mut files = item_files(&dir).await?;
        let total = files.len() as u64;

        if options.desc {
            files.reverse();
        }

        let mut items = Vec::new();
        for (_, path) in files
            .into_iter()
            .skip(options.offset as usize)
            .take(options.limit as usize)
        {
            let body = tokio::fs::read(&path)
                .await
                .map_err(|err| StorageError::io(&path, err))?;
            items.push(serde_json::from_slice(&body)?);
        }

        Ok(DatasetItemList {
            count: items.len() as u64,
            items,
            total,
            offset: options.offset,
            limit: options.limit,
            desc: options.desc,
        })
    }
}

/// Client for the dataset collection.
pub struct DatasetCollectionClient {
    datasets_dir: PathBuf,
}

impl DatasetCollectionClient {
    pub(crate) fn new(datasets_dir: PathBuf) -> Self {
        Self { datasets_dir }
    }

    /// Ensure the dataset directory exists, then return its info.
    pub async fn get_or_create(&self, name: &str) -> Result<DatasetInfo> {
        config::validate_container_name(name)?;
        let dir = self.datasets_dir.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::io(&dir, err))?;
        DatasetClient::new(name.to_string(), self.datasets_dir.clone())
            .get()
            .await
    }
}

/// Item files in the directory, sorted by index.
async fn item_files(dir: &PathBuf) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| StorageError::io(dir, err))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StorageError::io(dir, err))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        if stem.len() == INDEX_WIDTH && stem.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = stem.parse::<u64>() {
                files.push((index, entry.path()));
            }
        }
    }

    files.sort_unstable_by_key(|(index, _)| *index);
    Ok(files)
}

fn flatten_items(items: &Value) -> Result<Vec<&Value>> {
    match items {
        Value::Object(_) => Ok(vec![items]),
        Value::Array(entries) => {
            if let Some(bad) = entries.iter().find(|entry| !entry.is_object()) {
                return Err(StorageError::InvalidArgument(format!(
                    "Dataset items must be JSON objects, got: {bad}"
                )));
            }
            Ok(entries.iter().collect())
        }
        other => Err(StorageError::InvalidArgument(format!(
            "Dataset items must be JSON objects or arrays of objects, got: {other}"
        ))),
    }
}
