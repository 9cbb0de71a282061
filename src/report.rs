use chrono::{DateTime, Utc};
use serde::Serialize;

pub use crate::aggregator::stats::MetricStats;

/// Everything collected for one closed window.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub agent_id: String,
    /// Ordered by `(database, fingerprint)`.
    pub buckets: Vec<Bucket>,
}

impl Report {
    /// Bucket for a given database and fingerprint, if present.
    pub fn bucket(&self, database: &str, fingerprint: &str) -> Option<&Bucket> {
        self.buckets
            .iter()
            .find(|b| b.database == database && b.fingerprint == fingerprint)
    }
}

/// Statistics for one `(database, fingerprint)` pair inside one window.
#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    /// Stable hash of the fingerprint text (16 uppercase hex chars).
    pub query_id: String,
    pub fingerprint: String,
    pub database: String,
    pub collection: String,
    pub namespace: String,
    pub operation: String,
    pub keys: String,
    pub agent_id: String,
    pub period_start: DateTime<Utc>,
    pub period_length_secs: u64,

    /// First query seen for this fingerprint in the window.
    pub example: Option<String>,
    pub is_truncated: bool,
    pub plan_summary: Option<String>,
    pub app_name: Option<String>,
    pub client: Option<String>,
    pub user: Option<String>,

    pub num_queries: u64,
    /// Seconds.
    pub query_time: MetricStats,
    pub docs_examined: MetricStats,
    pub docs_returned: MetricStats,
    /// Bytes.
    pub response_length: MetricStats,
    pub keys_examined: MetricStats,
    /// Queries that scanned the whole collection.
    pub full_scan_cnt: u64,

    pub locks: LockStats,
    /// Bytes read from disk by the storage engine.
    pub storage_bytes_read: MetricStats,
    /// Seconds spent reading from disk.
    pub storage_time_reading: MetricStats,
}

/// Lock acquisitions summed over the bucket's queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LockStats {
    pub global_acquire_count_read: u64,
    pub global_acquire_count_write: u64,
    pub database_acquire_count_read: u64,
    pub database_acquire_wait_count_read: u64,
    /// Seconds waited for the database lock, over queries that waited.
    pub database_time_acquiring_read: MetricStats,
    pub collection_acquire_count_read: u64,
}
