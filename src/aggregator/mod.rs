//! Windowed statistics engine.
//!
//! Events from every target land here. Buckets are keyed by
//! `(database, fingerprint)` and live for one window; when the window closes
//! they are turned into a [`Report`] and pushed onto the report queue.

pub mod stats;

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{DEFAULT_INTERVAL, DEFAULT_REPORT_QUEUE_CAPACITY};
use crate::error::{QanError, Result};
use crate::event::EventMetrics;
use crate::fingerprint::Fingerprint;
use crate::report::{Bucket, LockStats, Report};
use crate::truncate;

use stats::MetricAccumulator;

const MILLIS_PER_SECOND: f64 = 1000.0;
const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Receiving side of the aggregator's output.
pub type ReportQueue = mpsc::Receiver<Report>;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe windowed aggregator.
/// Parsers call `add()`, the sender drains the queue returned by `start()`.
pub struct Aggregator {
    agent_id: String,
    interval: Duration,
    max_query_length: i32,
    queue_capacity: usize,
    inner: Mutex<Inner>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    running: bool,
    /// Anchor every window is aligned to.
    start: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    buckets: BTreeMap<(String, String), BucketAccumulator>,
    tx: Option<mpsc::Sender<Report>>,
}

/// Running totals for one `(database, fingerprint)` pair.
struct BucketAccumulator {
    namespace: String,
    collection: String,
    operation: String,
    keys: String,
    num_queries: u64,
    query_time: MetricAccumulator,
    docs_examined: MetricAccumulator,
    docs_returned: MetricAccumulator,
    response_length: MetricAccumulator,
    keys_examined: MetricAccumulator,
    full_scan_cnt: u64,
    locks: LockCounters,
    storage_bytes_read: MetricAccumulator,
    storage_time_reading: MetricAccumulator,
    example: Option<String>,
    plan_summary: Option<String>,
    app_name: Option<String>,
    client: Option<String>,
    user: Option<String>,
}

impl BucketAccumulator {
    fn new(fp: &Fingerprint) -> Self {
        Self {
            namespace: fp.namespace.clone(),
            collection: fp.collection.clone(),
            operation: fp.operation.clone(),
            keys: fp.keys.clone(),
            num_queries: 0,
            query_time: MetricAccumulator::new(),
            docs_examined: MetricAccumulator::new(),
            docs_returned: MetricAccumulator::new(),
            response_length: MetricAccumulator::new(),
            keys_examined: MetricAccumulator::new(),
            full_scan_cnt: 0,
            locks: LockCounters::default(),
            storage_bytes_read: MetricAccumulator::new(),
            storage_time_reading: MetricAccumulator::new(),
            example: None,
            plan_summary: None,
            app_name: None,
            client: None,
            user: None,
        }
    }

    fn record(&mut self, m: &EventMetrics) {
        self.num_queries += 1;
        self.query_time.record(m.query_time_ms);
        self.docs_examined.record(m.docs_examined);
        self.docs_returned.record(m.docs_returned);
        self.response_length.record(m.response_length);
        self.keys_examined.record(m.keys_examined);
        if m.full_scan {
            self.full_scan_cnt += 1;
        }
        self.locks.record(m);
        if let Some(bytes) = m.storage.bytes_read {
            self.storage_bytes_read.record(bytes);
        }
        if let Some(micros) = m.storage.time_reading_micros {
            self.storage_time_reading.record(micros);
        }

        if self.example.is_none() {
            self.example = m.example.clone();
        }
        // Context fields: last seen wins
        for (slot, value) in [
            (&mut self.plan_summary, &m.plan_summary),
            (&mut self.app_name, &m.app_name),
            (&mut self.client, &m.client),
            (&mut self.user, &m.user),
        ] {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
    }
}

/// Lock counts are plain sums; only the wait time gets full statistics.
#[derive(Default)]
struct LockCounters {
    global_acquire_read: u64,
    global_acquire_write: u64,
    database_acquire_read: u64,
    database_acquire_wait_read: u64,
    database_time_acquiring_read: MetricAccumulator,
    collection_acquire_read: u64,
}

impl LockCounters {
    fn record(&mut self, m: &EventMetrics) {
        let l = &m.locks;
        self.global_acquire_read = self.global_acquire_read.saturating_add(l.global_acquire_count_read);
        self.global_acquire_write = self.global_acquire_write.saturating_add(l.global_acquire_count_write);
        self.database_acquire_read = self.database_acquire_read.saturating_add(l.database_acquire_count_read);
        self.database_acquire_wait_read = self
            .database_acquire_wait_read
            .saturating_add(l.database_acquire_wait_count_read);
        self.collection_acquire_read = self
            .collection_acquire_read
            .saturating_add(l.collection_acquire_count_read);
        if let Some(micros) = l.database_time_acquiring_micros_read {
            self.database_time_acquiring_read.record(micros);
        }
    }

    fn stats(&self) -> LockStats {
        LockStats {
            global_acquire_count_read: self.global_acquire_read,
            global_acquire_count_write: self.global_acquire_write,
            database_acquire_count_read: self.database_acquire_read,
            database_acquire_wait_count_read: self.database_acquire_wait_read,
            database_time_acquiring_read: self.database_time_acquiring_read.stats(MICROS_PER_SECOND),
            collection_acquire_count_read: self.collection_acquire_read,
        }
    }
}

// ─── Aggregator impl ─────────────────────────────────────────────

impl Aggregator {
    /// Create a stopped aggregator whose windows are aligned to `start`.
    ///
    /// A zero `interval` falls back to [`DEFAULT_INTERVAL`]; a zero queue
    /// capacity to [`DEFAULT_REPORT_QUEUE_CAPACITY`].
    pub fn new(
        start: DateTime<Utc>,
        agent_id: impl Into<String>,
        interval: Duration,
        max_query_length: i32,
        report_queue_capacity: usize,
    ) -> Self {
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        let queue_capacity = if report_queue_capacity == 0 {
            DEFAULT_REPORT_QUEUE_CAPACITY
        } else {
            report_queue_capacity
        };

        let window_end = start + delta(interval);
        Self {
            agent_id: agent_id.into(),
            interval,
            max_query_length,
            queue_capacity,
            inner: Mutex::new(Inner {
                running: false,
                start,
                window_start: start,
                window_end,
                buckets: BTreeMap::new(),
                tx: None,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Bounds of the window currently being filled.
    pub fn current_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let inner = self.inner.lock();
        (inner.window_start, inner.window_end)
    }

    /// Open the report queue and start the window timer.
    pub fn start(self: &Arc<Self>) -> Result<ReportQueue> {
        let mut inner = self.inner.lock();
        if inner.running {
            debug!("aggregator already running");
            return Err(QanError::AlreadyRunning("aggregator"));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (window_start, window_end) = self.window_for(inner.start, Utc::now());
        inner.window_start = window_start;
        inner.window_end = window_end;
        inner.tx = Some(tx);
        inner.running = true;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_timer(cancel.clone()));
        *self.timer.lock() = Some((cancel, handle));

        debug!(
            window_start = %window_start,
            interval_secs = self.interval.as_secs_f64(),
            "aggregator started"
        );
        Ok(rx)
    }

    /// Stop the timer and close the report queue.
    ///
    /// The partially filled window is discarded.
    pub async fn stop(&self) {
        let timer = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            inner.tx = None;
            if !inner.buckets.is_empty() {
                debug!(buckets = inner.buckets.len(), "dropping unfinished window");
            }
            inner.buckets.clear();
            self.timer.lock().take()
        };

        if let Some((cancel, handle)) = timer {
            cancel.cancel();
            let _ = handle.await;
        }
        debug!("aggregator stopped");
    }

    /// Record one event, attributed to the window containing "now".
    pub async fn add(&self, database: &str, fp: &Fingerprint, metrics: &EventMetrics) -> Result<()> {
        self.add_at(Utc::now(), database, fp, metrics).await
    }

    /// Record one event with an explicit observation time.
    ///
    /// If `now` is past the current window, that window is closed first.
    pub async fn add_at(
        &self,
        now: DateTime<Utc>,
        database: &str,
        fp: &Fingerprint,
        metrics: &EventMetrics,
    ) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return Err(QanError::NotRunning("aggregator"));
            }
            let pending = self.roll(&mut inner, now);
            inner
                .buckets
                .entry((database.to_string(), fp.fingerprint.clone()))
                .or_insert_with(|| BucketAccumulator::new(fp))
                .record(metrics);
            pending
        };

        self.emit(pending).await;
        Ok(())
    }

    /// Close the current window if `now` is past its end.
    pub async fn flush_at(&self, now: DateTime<Utc>) {
        let pending = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            self.roll(&mut inner, now)
        };
        self.emit(pending).await;
    }

    // ── Window handling ─────────────────────────────────────────

    /// Window `[start + k·interval, start + (k+1)·interval)` containing `ts`.
    /// Timestamps before `start` belong to the first window.
    fn window_for(&self, start: DateTime<Utc>, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let interval_ms = self.interval.as_millis().max(1) as i64;
        let elapsed_ms = (ts - start).num_milliseconds().max(0);
        let k = elapsed_ms / interval_ms;
        let window_start = start + TimeDelta::milliseconds(k * interval_ms);
        (window_start, window_start + TimeDelta::milliseconds(interval_ms))
    }

    /// Advance the window if it is over; returns the report to send, if any.
    fn roll(&self, inner: &mut Inner, now: DateTime<Utc>) -> Option<(Report, mpsc::Sender<Report>)> {
        if now < inner.window_end {
            return None;
        }

        let report = self.take_report(inner);
        let (window_start, window_end) = self.window_for(inner.start, now);
        inner.window_start = window_start;
        inner.window_end = window_end;

        let tx = inner.tx.clone()?;
        report.map(|r| (r, tx))
    }

    async fn emit(&self, pending: Option<(Report, mpsc::Sender<Report>)>) {
        let Some((report, tx)) = pending else {
            return;
        };
        debug!(
            start = %report.start_ts,
            buckets = report.buckets.len(),
            "sending report"
        );
        // Blocks while the queue is full
        if tx.send(report).await.is_err() {
            warn!("report queue closed, dropping report");
        }
    }

    async fn run_timer(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let deadline = self.inner.lock().window_end;
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            self.flush_at(Utc::now()).await;
        }
    }

    // ── Report building ─────────────────────────────────────────

    fn take_report(&self, inner: &mut Inner) -> Option<Report> {
        if inner.buckets.is_empty() {
            trace!(
                "no queries in window {} - {}",
                inner.window_start.to_rfc3339(),
                inner.window_end.to_rfc3339()
            );
            return None;
        }

        let period_start = inner.window_start;
        let buckets = mem::take(&mut inner.buckets)
            .into_iter()
            .map(|((database, fingerprint), acc)| self.make_bucket(database, fingerprint, acc, period_start))
            .collect();

        Some(Report {
            start_ts: inner.window_start,
            end_ts: inner.window_end,
            agent_id: self.agent_id.clone(),
            buckets,
        })
    }

    fn make_bucket(
        &self,
        database: String,
        fingerprint: String,
        acc: BucketAccumulator,
        period_start: DateTime<Utc>,
    ) -> Bucket {
        let query_id = format!("{:016X}", xxh3_64(fingerprint.as_bytes()));
        let (fingerprint, _) = truncate::query(&fingerprint, self.max_query_length);
        let (example, is_truncated) = match acc.example {
            Some(example) => {
                let (example, truncated) = truncate::query(&example, self.max_query_length);
                (Some(example), truncated)
            }
            None => (None, false),
        };

        Bucket {
            query_id,
            fingerprint,
            database,
            collection: acc.collection,
            namespace: acc.namespace,
            operation: acc.operation,
            keys: acc.keys,
            agent_id: self.agent_id.clone(),
            period_start,
            period_length_secs: self.interval.as_secs(),
            example,
            is_truncated,
            plan_summary: acc.plan_summary,
            app_name: acc.app_name,
            client: acc.client,
            user: acc.user,
            num_queries: acc.num_queries,
            query_time: acc.query_time.stats(MILLIS_PER_SECOND),
            docs_examined: acc.docs_examined.stats(1.0),
            docs_returned: acc.docs_returned.stats(1.0),
            response_length: acc.response_length.stats(1.0),
            keys_examined: acc.keys_examined.stats(1.0),
            full_scan_cnt: acc.full_scan_cnt,
            locks: acc.locks.stats(),
            storage_bytes_read: acc.storage_bytes_read.stats(1.0),
            storage_time_reading: acc.storage_time_reading.stats(MICROS_PER_SECOND),
        }
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::milliseconds(d.as_millis() as i64)
}
