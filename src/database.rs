//! Process-wide cache of SQLite connections, one writer per database file.
//!
//! Every queue lives in its own database file and all access to that file
//! goes through a single cached [`Connection`]. That honors SQLite's
//! single-writer discipline while still allowing any number of queues per
//! process. Pragmas are applied once, when the connection is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{Result, StorageError};

/// Shared handle to one queue's database connection.
pub type DbHandle = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

static GLOBAL: OnceLock<ConnectionCache> = OnceLock::new();

/// Cache mapping database-file paths to open connections.
///
/// Cheap to clone; clones share the same cache. Tests inject their own
/// instance, everything else uses [`ConnectionCache::global`].
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<Mutex<CacheInner>>,
}

struct CacheInner {
    handles: HashMap<PathBuf, DbHandle>,
    wal_mode: bool,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectionCache {
    pub fn new(wal_mode: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                handles: HashMap::new(),
                wal_mode,
            })),
        }
    }

    /// The lazily-initialized process-wide cache.
    pub fn global() -> ConnectionCache {
        GLOBAL.get_or_init(ConnectionCache::default).clone()
    }

    /// Return the cached handle for `path`, opening it if necessary.
    ///
    /// Fails with [`StorageError::NotFound`] when the parent directory is
    /// missing, so callers can tell an absent queue from a broken database.
    pub fn open(&self, path: &Path) -> Result<DbHandle> {
        self.open_with(path, |_| Ok(()))
    }

    /// Like [`open`](Self::open), but runs `init` on the connection when a
    /// fresh one was actually opened. Cached handles skip `init`.
    pub fn open_with(
        &self,
        path: &Path,
        init: impl FnOnce(&Connection) -> Result<()>,
    ) -> Result<DbHandle> {
        let mut inner = self.lock();

        if let Some(handle) = inner.handles.get(path) {
            return Ok(Arc::clone(handle));
        }

        match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            Some(parent) => return Err(StorageError::NotFound(parent.to_path_buf())),
            None => return Err(StorageError::NotFound(path.to_path_buf())),
        }

        let conn = Connection::open(path)?;
        apply_pragmas(&conn, inner.wal_mode)?;
        init(&conn)?;

        let handle: DbHandle = Arc::new(Mutex::new(conn));
        inner.handles.insert(path.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the cached handle for `path`. The connection closes once the
    /// last outstanding clone of the handle is dropped. No-op when absent.
    pub fn close(&self, path: &Path) {
        self.lock().handles.remove(path);
    }

    /// Drop every cached handle.
    pub fn close_all(&self) {
        self.lock().handles.clear();
    }

    /// Journal mode for connections opened after this call. Already-open
    /// handles keep the mode they were opened with.
    pub fn set_wal_mode(&self, wal_mode: bool) {
        self.lock().wal_mode = wal_mode;
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_pragmas(conn: &Connection, wal_mode: bool) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let mode = if wal_mode { "WAL" } else { "DELETE" };
    conn.execute_batch(&format!("PRAGMA journal_mode = {mode};"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_caches_handle() {
        let dir = TempDir::new().unwrap();
        let cache = ConnectionCache::default();
        let path = dir.path().join("db.sqlite");

        let first = cache.open(&path).unwrap();
        let second = cache.open(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.close(&path);
        let third = cache.open(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_missing_parent_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cache = ConnectionCache::default();
        let path = dir.path().join("missing").join("db.sqlite");

        match cache.open(&path) {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_init_runs_once() {
        let dir = TempDir::new().unwrap();
        let cache = ConnectionCache::default();
        let path = dir.path().join("db.sqlite");
        let mut runs = 0;

        cache
            .open_with(&path, |_| {
                runs += 1;
                Ok(())
            })
            .unwrap();
        cache
            .open_with(&path, |_| {
                runs += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(runs, 1);
    }

    #[test]
    fn test_wal_mode_toggle_affects_new_handles() {
        let dir = TempDir::new().unwrap();
        let cache = ConnectionCache::default();
        let path = dir.path().join("db.sqlite");

        cache.set_wal_mode(false);
        let handle = cache.open(&path).unwrap();
        let conn = handle.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "delete");
    }
}
