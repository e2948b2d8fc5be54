//! Wire-level models shared by the storage clients.
//!
//! Field names serialize in camelCase so stored JSON and operation results
//! match what the hosted storage API returns. A [`Request`] round-trips the
//! caller's exact object: unknown fields are captured in `extra` and written
//! back verbatim.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A crawl target submitted to a request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Derived from `unique_key`; never supplied by callers on add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target URL.
    pub url: String,
    /// Caller-chosen deduplication key.
    pub unique_key: String,
    /// HTTP verb, `GET` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Present once the request has been completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    /// Arbitrary user payload, preserved verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
    /// Any other fields the caller attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Request {
    /// Minimal request with `url` doubling as the deduplication key.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: None,
            unique_key: url.clone(),
            url,
            method: None,
            retry_count: None,
            handled_at: None,
            user_data: None,
            extra: Map::new(),
        }
    }

    /// HTTP verb with the `GET` default applied.
    pub fn method_or_default(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}

/// Result of a single add/update operation on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub was_already_present: bool,
    /// Reflects the state the request was in *before* this operation.
    pub was_already_handled: bool,
}

/// Per-request entry in a batch-add result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRequest {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Entry for a request a batch add could not process. Present for API
/// parity with the hosted service; this implementation never populates it
/// because a missing queue aborts the whole batch instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnprocessedRequest {
    pub unique_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Result of a batch add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAddResult {
    pub processed_requests: Vec<ProcessedRequest>,
    pub unprocessed_requests: Vec<UnprocessedRequest>,
}

/// Queue metadata as returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQueueInfo {
    /// Externally the queue name doubles as its id.
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub pending_request_count: u64,
    pub had_multiple_clients: bool,
}

/// Head of a queue: the next available requests in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHead {
    pub limit: u32,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
    pub items: Vec<Request>,
}

/// Head of a queue with the returned requests locked for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedQueueHead {
    pub limit: u32,
    pub lock_secs: u32,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
    pub items: Vec<Request>,
}

/// New expiry returned by a successful lock prolongation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProlongedLock {
    pub lock_expires_at: DateTime<Utc>,
}

/// Dataset metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub id: String,
    pub name: String,
    pub item_count: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Page of dataset items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetItemList {
    pub items: Vec<Value>,
    pub total: u64,
    pub offset: u64,
    pub count: u64,
    pub limit: u64,
    pub desc: bool,
}

/// Key-value store metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValueStoreInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// One key in a store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub key: String,
    pub size: u64,
}

/// Page of store keys in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyListing {
    pub items: Vec<KeyInfo>,
    pub count: u64,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_start_key: Option<String>,
    pub is_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_exclusive_start_key: Option<String>,
}

/// A single key-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Vec<u8>,
    pub content_type: String,
}

impl Record {
    /// JSON record, stored pretty-printed like the hosted service does.
    pub fn json(key: impl Into<String>, value: &Value) -> crate::Result<Self> {
        Ok(Self {
            key: key.into(),
            value: serde_json::to_vec_pretty(value)?,
            content_type: "application/json; charset=utf-8".to_string(),
        })
    }

    /// Plain-text record.
    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into().into_bytes(),
            content_type: "text/plain; charset=utf-8".to_string(),
        }
    }

    /// Parse the stored bytes back into a JSON value.
    pub fn as_json(&self) -> crate::Result<Value> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// Parse an RFC 3339 timestamp written by this crate, falling back to the
/// current instant when the stored text is unreadable.
pub(crate) fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Current instant formatted the way every timestamp in the storage is
/// written: UTC, millisecond precision, `Z` suffix.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Filesystem timestamp as UTC, falling back to the current instant on
/// platforms that do not report it.
pub(crate) fn fs_datetime(time: std::io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "url": "https://example.com",
            "uniqueKey": "https://example.com",
            "userData": { "label": "detail", "depth": 3 },
            "noRetry": true,
        });
        let request: Request = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(request.extra.get("noRetry"), Some(&json!(true)));

        let back = serde_json::to_value(&request).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_request_method_default() {
        let request = Request::from_url("https://example.com");
        assert_eq!(request.method_or_default(), "GET");
        assert!(!request.is_handled());
    }

    #[test]
    fn test_parse_datetime_round_trip() {
        let now = now_timestamp();
        let parsed = parse_datetime(&now);
        assert_eq!(parsed.to_rfc3339_opts(SecondsFormat::Millis, true), now);
    }
}
