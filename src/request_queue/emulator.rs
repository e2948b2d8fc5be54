//! Per-queue SQLite persistence engine.
//!
//! One queue lives in one database file. The schema keeps a single
//! `request_queues` row (id = 1) and one `queue_requests` row per request,
//! with `order_no` encoding position, handled state, and lock expiry in a
//! single signed integer:
//!
//! - `NULL` — handled, invisible to head queries.
//! - negative — forefront; positive — tail.
//! - `|order_no| <= now_ms` — available; `|order_no| > now_ms` — locked
//!   until that instant, sign preserved so ordering survives expiry.
//!
//! Counters on the queue row are maintained inside the same transaction as
//! the row mutation; `modified_at`/`accessed_at` are bumped by triggers, so
//! none of the mutation paths touch them directly.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::database::DbHandle;
use crate::error::{Result, StorageError};
use crate::models::{now_timestamp, ProcessedRequest, QueueOperationInfo};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_queues(
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    accessed_at TEXT NOT NULL,
    total_request_count INTEGER NOT NULL DEFAULT 0,
    handled_request_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS queue_requests(
    queue_id INTEGER NOT NULL REFERENCES request_queues(id) ON DELETE CASCADE,
    id TEXT NOT NULL,
    order_no INTEGER,
    url TEXT NOT NULL,
    unique_key TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'GET',
    retry_count INTEGER NOT NULL DEFAULT 0,
    json TEXT NOT NULL,
    PRIMARY KEY (queue_id, id, unique_key)
);

-- Head queries only ever touch pending rows; the partial index answers
-- them without scanning handled ones.
CREATE INDEX IF NOT EXISTS idx_queue_requests_head
    ON queue_requests(queue_id, order_no)
    WHERE order_no IS NOT NULL;

CREATE TRIGGER IF NOT EXISTS trg_queue_requests_insert
AFTER INSERT ON queue_requests
BEGIN
    UPDATE request_queues
    SET modified_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW'),
        accessed_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW')
    WHERE id = NEW.queue_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_queue_requests_update
AFTER UPDATE ON queue_requests
BEGIN
    UPDATE request_queues
    SET modified_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW'),
        accessed_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW')
    WHERE id = NEW.queue_id;
END;

CREATE TRIGGER IF NOT EXISTS trg_queue_requests_delete
AFTER DELETE ON queue_requests
BEGIN
    UPDATE request_queues
    SET modified_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW'),
        accessed_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'NOW')
    WHERE id = OLD.queue_id;
END;
"#;

const QUEUE_COLUMNS: &str =
    "id, name, created_at, modified_at, accessed_at, total_request_count, handled_request_count";

/// Raw queue row as stored.
#[derive(Debug, Clone)]
pub(crate) struct QueueRow {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    pub modified_at: String,
    pub accessed_at: String,
    pub total_request_count: i64,
    pub handled_request_count: i64,
}

impl QueueRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: row.get(2)?,
            modified_at: row.get(3)?,
            accessed_at: row.get(4)?,
            total_request_count: row.get(5)?,
            handled_request_count: row.get(6)?,
        })
    }
}

/// Request row ready for insertion, with the canonical JSON blob and the
/// mirrored index columns already computed by the client.
#[derive(Debug, Clone)]
pub(crate) struct RequestModel {
    pub queue_id: i64,
    pub id: String,
    pub order_no: Option<i64>,
    pub url: String,
    pub unique_key: String,
    pub method: String,
    pub retry_count: i64,
    pub json: String,
}

pub(crate) struct RequestQueueEmulator {
    handle: DbHandle,
}

impl RequestQueueEmulator {
    pub fn new(handle: DbHandle) -> Self {
        Self { handle }
    }

    /// Idempotent schema creation, run once per freshly opened connection.
    pub fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn select_by_name(&self, name: &str) -> Result<Option<QueueRow>> {
        let conn = self.conn();
        let row = conn
            .prepare_cached(&format!(
                "SELECT {QUEUE_COLUMNS} FROM request_queues WHERE name = ?1"
            ))?
            .query_row(params![name], QueueRow::from_row)
            .optional()?;
        Ok(row)
    }

    /// Return the queue row for `name`, inserting it first when absent.
    pub fn select_or_insert_by_name(&self, name: &str) -> Result<QueueRow> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = tx
            .prepare_cached(&format!(
                "SELECT {QUEUE_COLUMNS} FROM request_queues WHERE name = ?1"
            ))?
            .query_row(params![name], QueueRow::from_row)
            .optional()?;

        let row = match existing {
            Some(row) => row,
            None => {
                let now = now_timestamp();
                tx.execute(
                    "INSERT INTO request_queues(id, name, created_at, modified_at, accessed_at)
                     VALUES(1, ?1, ?2, ?2, ?2)",
                    params![name, now],
                )?;
                tx.prepare_cached(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM request_queues WHERE name = ?1"
                ))?
                .query_row(params![name], QueueRow::from_row)?
            }
        };

        tx.commit()?;
        Ok(row)
    }

    pub fn update_name(&self, queue_id: i64, name: &str) -> Result<()> {
        let conn = self.conn();
        let now = now_timestamp();
        conn.execute(
            "UPDATE request_queues SET name = ?1, modified_at = ?2, accessed_at = ?2 WHERE id = ?3",
            params![name, now, queue_id],
        )?;
        Ok(())
    }

    pub fn update_accessed_at(&self, queue_id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE request_queues SET accessed_at = ?1 WHERE id = ?2",
            params![now_timestamp(), queue_id],
        )?;
        Ok(())
    }

    pub fn select_request_json(&self, queue_id: i64, request_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let row = conn
            .prepare_cached("SELECT json FROM queue_requests WHERE queue_id = ?1 AND id = ?2")?
            .query_row(params![queue_id, request_id], |row| row.get(0))
            .optional()?;
        Ok(row)
    }

    /// JSON blobs of the available head: pending, unlocked, lowest
    /// `order_no` first.
    pub fn select_request_jsons_head(&self, queue_id: i64, limit: u32) -> Result<Vec<String>> {
        let now = now_millis();
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT json FROM queue_requests
             WHERE queue_id = ?1 AND order_no IS NOT NULL AND order_no BETWEEN ?2 AND ?3
             ORDER BY order_no ASC
             LIMIT ?4",
        )?;
        let jsons = stmt
            .query_map(params![queue_id, -now, now, limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(jsons)
    }

    /// Insert-if-absent with first-wins semantics.
    pub fn add_request(&self, model: &RequestModel) -> Result<QueueOperationInfo> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let info = add_request_tx(&tx, model)?;
        tx.commit()?;
        Ok(info)
    }

    /// Batch variant of [`add_request`](Self::add_request). A missing queue
    /// row aborts the whole batch; per-item duplicates are folded into the
    /// processed entries like the single-request path.
    pub fn batch_add_requests(&self, models: &[RequestModel]) -> Result<Vec<ProcessedRequest>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut processed = Vec::with_capacity(models.len());
        for model in models {
            let info = add_request_tx(&tx, model)?;
            processed.push(ProcessedRequest {
                request_id: info.request_id,
                unique_key: model.unique_key.clone(),
                was_already_present: info.was_already_present,
                was_already_handled: info.was_already_handled,
            });
        }

        tx.commit()?;
        Ok(processed)
    }

    /// Overwrite an existing row, or fall back to insertion when absent.
    /// Returned flags reflect the state *before* the update.
    pub fn update_request(&self, model: &RequestModel) -> Result<QueueOperationInfo> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = select_request_order_no(&tx, model.queue_id, &model.id)?;

        let info = match existing {
            None => add_request_tx(&tx, model)?,
            Some(old_order_no) => {
                tx.execute(
                    "UPDATE queue_requests
                     SET order_no = ?1, url = ?2, unique_key = ?3, method = ?4,
                         retry_count = ?5, json = ?6
                     WHERE queue_id = ?7 AND id = ?8",
                    params![
                        model.order_no,
                        model.url,
                        model.unique_key,
                        model.method,
                        model.retry_count,
                        model.json,
                        model.queue_id,
                        model.id,
                    ],
                )?;

                let was_handled = old_order_no.is_none();
                let is_handled = model.order_no.is_none();
                let delta_handled = match (was_handled, is_handled) {
                    (false, true) => 1,
                    (true, false) => -1,
                    _ => 0,
                };
                if delta_handled != 0 {
                    adjust_counts(&tx, model.queue_id, 0, delta_handled)?;
                }

                QueueOperationInfo {
                    request_id: model.id.clone(),
                    was_already_present: true,
                    was_already_handled: was_handled,
                }
            }
        };

        tx.commit()?;
        Ok(info)
    }

    /// Structurally supported but not reachable through the public client.
    #[allow(dead_code)]
    pub fn delete_request_by_id(&self, queue_id: i64, request_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM queue_requests WHERE queue_id = ?1 AND id = ?2",
            params![queue_id, request_id],
        )?;
        Ok(())
    }

    /// Atomically take the first `limit` available requests and push their
    /// lock expiry `lock_secs` into the future, preserving sign. Returns
    /// the JSON blobs as they were before locking.
    pub fn list_and_lock_head(
        &self,
        queue_id: i64,
        limit: u32,
        lock_secs: u32,
    ) -> Result<Vec<String>> {
        let now = now_millis();
        let unlock = now + i64::from(lock_secs) * 1000;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let rows: Vec<(String, String, i64)> = tx
            .prepare_cached(
                "SELECT id, json, order_no FROM queue_requests
                 WHERE queue_id = ?1 AND order_no IS NOT NULL AND order_no BETWEEN ?2 AND ?3
                 ORDER BY order_no ASC
                 LIMIT ?4",
            )?
            .query_map(params![queue_id, -now, now, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (request_id, _, order_no) in &rows {
            let locked_order_no = if *order_no < 0 { -unlock } else { unlock };
            tx.execute(
                "UPDATE queue_requests SET order_no = ?1 WHERE queue_id = ?2 AND id = ?3",
                params![locked_order_no, queue_id, request_id],
            )?;
        }

        tx.commit()?;
        Ok(rows.into_iter().map(|(_, json, _)| json).collect())
    }

    /// Extend a held lock by `lock_secs` and return the new expiry.
    pub fn prolong_request_lock(
        &self,
        queue_id: i64,
        request_id: &str,
        lock_secs: u32,
        forefront: bool,
    ) -> Result<DateTime<Utc>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let order_no = select_request_order_no(&tx, queue_id, request_id)?
            .flatten()
            .ok_or_else(|| StorageError::RequestNotLocked {
                id: request_id.to_string(),
            })?;

        let unlock = order_no.abs() + i64::from(lock_secs) * 1000;
        let new_order_no = if forefront { -unlock } else { unlock };
        tx.execute(
            "UPDATE queue_requests SET order_no = ?1 WHERE queue_id = ?2 AND id = ?3",
            params![new_order_no, queue_id, request_id],
        )?;

        tx.commit()?;
        Ok(DateTime::<Utc>::from_timestamp_millis(unlock).unwrap_or_else(Utc::now))
    }

    /// Release a held lock before expiry, restoring availability now.
    pub fn delete_request_lock(
        &self,
        queue_id: i64,
        request_id: &str,
        forefront: bool,
    ) -> Result<()> {
        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let order_no = select_request_order_no(&tx, queue_id, request_id)?.flatten();
        let locked = matches!(order_no, Some(n) if n.abs() > now);
        if !locked {
            return Err(StorageError::RequestNotLocked {
                id: request_id.to_string(),
            });
        }

        let new_order_no = if forefront { -now } else { now };
        tx.execute(
            "UPDATE queue_requests SET order_no = ?1 WHERE queue_id = ?2 AND id = ?3",
            params![new_order_no, queue_id, request_id],
        )?;

        tx.commit()?;
        Ok(())
    }
}

/// Milliseconds since the epoch; the single clock source for order keys,
/// lock acquisition, and head filtering.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fast existence and state probe: outer `None` when the row is absent,
/// inner `None` when it is handled.
fn select_request_order_no(
    tx: &Transaction<'_>,
    queue_id: i64,
    request_id: &str,
) -> Result<Option<Option<i64>>> {
    let row = tx
        .prepare_cached("SELECT order_no FROM queue_requests WHERE queue_id = ?1 AND id = ?2")?
        .query_row(params![queue_id, request_id], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?;
    Ok(row)
}

fn add_request_tx(tx: &Transaction<'_>, model: &RequestModel) -> Result<QueueOperationInfo> {
    let inserted = tx.execute(
        "INSERT INTO queue_requests(queue_id, id, order_no, url, unique_key, method, retry_count, json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            model.queue_id,
            model.id,
            model.order_no,
            model.url,
            model.unique_key,
            model.method,
            model.retry_count,
            model.json,
        ],
    );

    match inserted {
        Ok(_) => {
            let delta_handled = if model.order_no.is_none() { 1 } else { 0 };
            adjust_counts(tx, model.queue_id, 1, delta_handled)?;
            // A fresh insertion always reports both flags false, even when
            // the caller added an already-handled request.
            Ok(QueueOperationInfo {
                request_id: model.id.clone(),
                was_already_present: false,
                was_already_handled: false,
            })
        }
        Err(err) if is_unique_violation(&err) => {
            // First write wins: leave the stored row untouched and report
            // the state it is in.
            let existing = select_request_order_no(tx, model.queue_id, &model.id)?;
            Ok(QueueOperationInfo {
                request_id: model.id.clone(),
                was_already_present: true,
                was_already_handled: matches!(existing, Some(None)),
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn adjust_counts(
    tx: &Transaction<'_>,
    queue_id: i64,
    delta_total: i64,
    delta_handled: i64,
) -> Result<()> {
    tx.execute(
        "UPDATE request_queues
         SET total_request_count = total_request_count + ?1,
             handled_request_count = handled_request_count + ?2
         WHERE id = ?3",
        params![delta_total, delta_handled, queue_id],
    )?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Queue row missing during request insertion surfaces as a foreign-key
/// failure; the client re-raises it with the queue name.
pub(crate) fn is_foreign_key_violation(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn open_emulator() -> RequestQueueEmulator {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        RequestQueueEmulator::create_schema(&conn).unwrap();
        // Schema creation must be idempotent.
        RequestQueueEmulator::create_schema(&conn).unwrap();
        RequestQueueEmulator::new(Arc::new(Mutex::new(conn)))
    }

    fn model(queue_id: i64, unique_key: &str, order_no: Option<i64>) -> RequestModel {
        RequestModel {
            queue_id,
            id: format!("id-{unique_key}"),
            order_no,
            url: format!("https://example.com/{unique_key}"),
            unique_key: unique_key.to_string(),
            method: "GET".to_string(),
            retry_count: 0,
            json: "{}".to_string(),
        }
    }

    #[test]
    fn test_add_request_first_write_wins() {
        let emulator = open_emulator();
        let queue = emulator.select_or_insert_by_name("queue").unwrap();

        let first = model(queue.id, "a", Some(100));
        let info = emulator.add_request(&first).unwrap();
        assert!(!info.was_already_present);

        let mut second = first.clone();
        second.url = "https://example.com/other".to_string();
        let info = emulator.add_request(&second).unwrap();
        assert!(info.was_already_present);
        assert!(!info.was_already_handled);

        let json = emulator.select_request_json(queue.id, &first.id).unwrap();
        assert_eq!(json.as_deref(), Some("{}"));
        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert_eq!(row.total_request_count, 1);
    }

    #[test]
    fn test_add_request_without_queue_row_is_fk_violation() {
        let emulator = open_emulator();
        let err = emulator.add_request(&model(1, "a", Some(100))).unwrap_err();
        assert!(is_foreign_key_violation(&err));
    }

    #[test]
    fn test_counters_follow_handled_transitions() {
        let emulator = open_emulator();
        let queue = emulator.select_or_insert_by_name("queue").unwrap();

        emulator.add_request(&model(queue.id, "a", Some(100))).unwrap();
        emulator.add_request(&model(queue.id, "b", None)).unwrap();

        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert_eq!(row.total_request_count, 2);
        assert_eq!(row.handled_request_count, 1);

        // Pending -> handled.
        let handled = model(queue.id, "a", None);
        let info = emulator.update_request(&handled).unwrap();
        assert!(info.was_already_present);
        assert!(!info.was_already_handled);
        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert_eq!(row.handled_request_count, 2);

        // Handled -> handled is a no-op for counters.
        emulator.update_request(&handled).unwrap();
        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert_eq!(row.handled_request_count, 2);

        // Handled -> pending.
        emulator.update_request(&model(queue.id, "a", Some(200))).unwrap();
        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert_eq!(row.handled_request_count, 1);
        assert_eq!(row.total_request_count, 2);
    }

    #[test]
    fn test_triggers_bump_queue_timestamps() {
        let emulator = open_emulator();
        let queue = emulator.select_or_insert_by_name("queue").unwrap();

        emulator.add_request(&model(queue.id, "a", Some(100))).unwrap();
        let row = emulator.select_by_name("queue").unwrap().unwrap();
        assert!(row.modified_at >= queue.modified_at);
        assert!(row.accessed_at >= row.modified_at);
    }

    #[test]
    fn test_delete_request_cascades_from_queue_deletion() {
        let emulator = open_emulator();
        let queue = emulator.select_or_insert_by_name("queue").unwrap();
        emulator.add_request(&model(queue.id, "a", Some(100))).unwrap();

        {
            let conn = emulator.conn();
            conn.execute("DELETE FROM request_queues WHERE id = 1", [])
                .unwrap();
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM queue_requests", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0);
        }
    }
}
