use bson::{Bson, Document};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{QanError, Result};

/// Plan summary reported for collection scans.
const COLLSCAN: &str = "COLLSCAN";

// ─── Operation kind ──────────────────────────────────────────────

/// What kind of operation an event describes.
///
/// Every profiler `op` string lands in exactly one variant; anything that
/// is not a plain CRUD operation is treated as a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Find,
    Insert,
    Update,
    Delete,
    Command,
}

impl OpKind {
    pub fn from_op(op: &str) -> Self {
        match op {
            "query" => Self::Find,
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" | "remove" => Self::Delete,
            _ => Self::Command,
        }
    }
}

// ─── Raw event ───────────────────────────────────────────────────

/// One observed execution, as read from the target.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// `<database>.<collection>`
    pub namespace: String,
    /// Raw operation name (`query`, `insert`, `command`, ...).
    pub operation: String,
    /// The executed command; key order is preserved.
    pub command: Document,
    pub timestamp: DateTime<Utc>,
    pub response_length: u64,
    pub docs_examined: u64,
    pub docs_returned: u64,
    pub duration_millis: u64,
    pub keys_examined: u64,
    pub plan_summary: Option<String>,
    pub app_name: Option<String>,
    pub client: Option<String>,
    pub user: Option<String>,
    pub locks: LockMetrics,
    pub storage: StorageMetrics,
}

/// Lock activity from the profiler's `locks` section.
///
/// Only the intent-shared modes are kept: `r` (read) and, for the global
/// lock, `w` (write).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMetrics {
    pub global_acquire_count_read: u64,
    pub global_acquire_count_write: u64,
    pub database_acquire_count_read: u64,
    pub database_acquire_wait_count_read: u64,
    /// Absent when the operation never waited for the database lock.
    pub database_time_acquiring_micros_read: Option<u64>,
    pub collection_acquire_count_read: u64,
}

/// Storage engine reads from `storage.data`; absent when served from cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageMetrics {
    pub bytes_read: Option<u64>,
    pub time_reading_micros: Option<u64>,
}

impl RawEvent {
    /// Minimal event with zeroed metrics, mostly useful for sources that
    /// fill fields in afterwards.
    pub fn new(namespace: impl Into<String>, operation: impl Into<String>, command: Document) -> Self {
        Self {
            namespace: namespace.into(),
            operation: operation.into(),
            command,
            timestamp: Utc::now(),
            response_length: 0,
            docs_examined: 0,
            docs_returned: 0,
            duration_millis: 0,
            keys_examined: 0,
            plan_summary: None,
            app_name: None,
            client: None,
            user: None,
            locks: LockMetrics::default(),
            storage: StorageMetrics::default(),
        }
    }

    pub fn kind(&self) -> OpKind {
        OpKind::from_op(&self.operation)
    }

    /// Decode one `system.profile` document.
    ///
    /// `ns`, `op` and `ts` are mandatory. Numeric fields accept any BSON
    /// number and default to zero. Old profiler entries keep the command
    /// under `query` instead of `command`.
    pub fn from_profile_document(doc: &Document) -> Result<Self> {
        let namespace = doc.get_str("ns")?.to_string();
        let operation = doc.get_str("op")?.to_string();

        let timestamp = match doc.get("ts") {
            Some(Bson::DateTime(dt)) => Utc
                .timestamp_millis_opt(dt.timestamp_millis())
                .single()
                .ok_or_else(|| QanError::Decode(format!("ts out of range: {dt}")))?,
            Some(other) => {
                return Err(QanError::Decode(format!(
                    "ts has unexpected type {:?}",
                    other.element_type()
                )))
            }
            None => return Err(QanError::Decode("missing field ts".into())),
        };

        let command = match (doc.get("command"), doc.get("query")) {
            (Some(Bson::Document(cmd)), _) => cmd.clone(),
            (_, Some(Bson::Document(query))) => query.clone(),
            _ => Document::new(),
        };

        Ok(Self {
            namespace,
            operation,
            command,
            timestamp,
            response_length: number(doc, "responseLength"),
            docs_examined: number(doc, "docsExamined"),
            docs_returned: number(doc, "nreturned"),
            duration_millis: number(doc, "millis"),
            keys_examined: number(doc, "keysExamined"),
            plan_summary: string(doc, "planSummary"),
            app_name: string(doc, "appName"),
            client: string(doc, "client"),
            user: string(doc, "user"),
            locks: LockMetrics {
                global_acquire_count_read: nested(doc, &["locks", "Global", "acquireCount", "r"]).unwrap_or(0),
                global_acquire_count_write: nested(doc, &["locks", "Global", "acquireCount", "w"]).unwrap_or(0),
                database_acquire_count_read: nested(doc, &["locks", "Database", "acquireCount", "r"]).unwrap_or(0),
                database_acquire_wait_count_read: nested(doc, &["locks", "Database", "acquireWaitCount", "r"])
                    .unwrap_or(0),
                database_time_acquiring_micros_read: nested(doc, &["locks", "Database", "timeAcquiringMicros", "r"]),
                collection_acquire_count_read: nested(doc, &["locks", "Collection", "acquireCount", "r"])
                    .unwrap_or(0),
            },
            storage: StorageMetrics {
                bytes_read: nested(doc, &["storage", "data", "bytesRead"]),
                time_reading_micros: nested(doc, &["storage", "data", "timeReadingMicros"]),
            },
        })
    }
}

fn as_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(v) => Some((*v).max(0) as u64),
        Bson::Int64(v) => Some((*v).max(0) as u64),
        Bson::Double(v) if v.is_finite() => Some(v.max(0.0) as u64),
        _ => None,
    }
}

fn number(doc: &Document, key: &str) -> u64 {
    doc.get(key).and_then(as_u64).unwrap_or(0)
}

/// Number at a path of sub-document keys, if every step is present.
fn nested(doc: &Document, path: &[&str]) -> Option<u64> {
    let (last, parents) = path.split_last()?;
    let mut current = doc;
    for key in parents {
        current = current.get_document(key).ok()?;
    }
    current.get(*last).and_then(as_u64)
}

fn string(doc: &Document, key: &str) -> Option<String> {
    doc.get_str(key).ok().filter(|s| !s.is_empty()).map(str::to_string)
}

// ─── Metrics ─────────────────────────────────────────────────────

/// Per-event values fed into the aggregator.
///
/// The numeric fields are aggregated; the optional strings are context
/// kept on the bucket (first example, last-seen plan/app/client/user).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMetrics {
    pub query_time_ms: u64,
    pub docs_examined: u64,
    pub docs_returned: u64,
    pub response_length: u64,
    pub keys_examined: u64,
    pub full_scan: bool,
    pub example: Option<String>,
    pub plan_summary: Option<String>,
    pub app_name: Option<String>,
    pub client: Option<String>,
    pub user: Option<String>,
    pub locks: LockMetrics,
    pub storage: StorageMetrics,
}

impl EventMetrics {
    pub fn from_event(event: &RawEvent, example: Option<String>) -> Self {
        Self {
            query_time_ms: event.duration_millis,
            docs_examined: event.docs_examined,
            docs_returned: event.docs_returned,
            response_length: event.response_length,
            keys_examined: event.keys_examined,
            full_scan: event.plan_summary.as_deref() == Some(COLLSCAN),
            example,
            plan_summary: event.plan_summary.clone(),
            app_name: event.app_name.clone(),
            client: event.client.clone(),
            user: event.user.clone(),
            locks: event.locks,
            storage: event.storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn op_kind_mapping() {
        assert_eq!(OpKind::from_op("query"), OpKind::Find);
        assert_eq!(OpKind::from_op("insert"), OpKind::Insert);
        assert_eq!(OpKind::from_op("update"), OpKind::Update);
        assert_eq!(OpKind::from_op("remove"), OpKind::Delete);
        assert_eq!(OpKind::from_op("delete"), OpKind::Delete);
        assert_eq!(OpKind::from_op("command"), OpKind::Command);
        assert_eq!(OpKind::from_op("getmore"), OpKind::Command);
    }

    #[test]
    fn decode_profile_document() {
        let ts = bson::DateTime::from_millis(1_700_000_000_000);
        let doc = doc! {
            "op": "query",
            "ns": "test.people",
            "command": { "find": "people", "filter": { "name": "x" } },
            "keysExamined": 3_i32,
            "docsExamined": 10_i64,
            "nreturned": 2.0,
            "responseLength": 45_i32,
            "millis": 7_i32,
            "planSummary": "COLLSCAN",
            "ts": ts,
            "client": "127.0.0.1",
            "appName": "mongosh",
            "user": "",
        };

        let event = RawEvent::from_profile_document(&doc).unwrap();
        assert_eq!(event.namespace, "test.people");
        assert_eq!(event.kind(), OpKind::Find);
        assert_eq!(event.command.get_str("find").unwrap(), "people");
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(event.keys_examined, 3);
        assert_eq!(event.docs_examined, 10);
        assert_eq!(event.docs_returned, 2);
        assert_eq!(event.response_length, 45);
        assert_eq!(event.duration_millis, 7);
        assert_eq!(event.app_name.as_deref(), Some("mongosh"));
        assert_eq!(event.user, None);

        let metrics = EventMetrics::from_event(&event, None);
        assert!(metrics.full_scan);
        assert_eq!(metrics.query_time_ms, 7);
    }

    #[test]
    fn decode_locks_and_storage() {
        let doc = doc! {
            "op": "query",
            "ns": "test.people",
            "ts": bson::DateTime::now(),
            "locks": {
                "Global": { "acquireCount": { "r": 2_i64, "w": 1_i64 } },
                "Database": {
                    "acquireCount": { "r": 3_i64 },
                    "acquireWaitCount": { "r": 1_i64 },
                    "timeAcquiringMicros": { "r": 250_i64 },
                },
                "Collection": { "acquireCount": { "r": 4_i32 } },
            },
            "storage": { "data": { "bytesRead": 8192_i64, "timeReadingMicros": 1500_i64 } },
        };

        let event = RawEvent::from_profile_document(&doc).unwrap();
        assert_eq!(
            event.locks,
            LockMetrics {
                global_acquire_count_read: 2,
                global_acquire_count_write: 1,
                database_acquire_count_read: 3,
                database_acquire_wait_count_read: 1,
                database_time_acquiring_micros_read: Some(250),
                collection_acquire_count_read: 4,
            }
        );
        assert_eq!(event.storage.bytes_read, Some(8192));
        assert_eq!(event.storage.time_reading_micros, Some(1500));

        let metrics = EventMetrics::from_event(&event, None);
        assert_eq!(metrics.locks, event.locks);
        assert_eq!(metrics.storage, event.storage);
    }

    #[test]
    fn missing_locks_and_storage_decode_as_absent() {
        let doc = doc! { "op": "insert", "ns": "a.b", "ts": bson::DateTime::now() };
        let event = RawEvent::from_profile_document(&doc).unwrap();
        assert_eq!(event.locks, LockMetrics::default());
        assert_eq!(event.storage, StorageMetrics::default());
    }

    #[test]
    fn decode_rejects_missing_mandatory_fields() {
        let no_ns = doc! { "op": "insert", "ts": bson::DateTime::now() };
        assert!(matches!(
            RawEvent::from_profile_document(&no_ns),
            Err(QanError::Decode(_))
        ));

        let bad_ts = doc! { "op": "insert", "ns": "a.b", "ts": "yesterday" };
        assert!(matches!(
            RawEvent::from_profile_document(&bad_ts),
            Err(QanError::Decode(_))
        ));
    }

    #[test]
    fn legacy_query_field_is_used_as_command() {
        let doc = doc! {
            "op": "query",
            "ns": "a.b",
            "query": { "filter": { "x": 1 } },
            "ts": bson::DateTime::now(),
        };
        let event = RawEvent::from_profile_document(&doc).unwrap();
        assert!(event.command.contains_key("filter"));
    }
}
