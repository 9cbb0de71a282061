use std::time::Duration;

use serde::Deserialize;

use crate::error::{QanError, Result};

// ─── Defaults ────────────────────────────────────────────────────

/// Length of one aggregation window.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// How often the engine re-lists targets.
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Reports buffered between the aggregator and the sender.
pub const DEFAULT_REPORT_QUEUE_CAPACITY: usize = 1000;

/// Events buffered between a collector and its parser.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 100;

// ─── Config ──────────────────────────────────────────────────────

/// Everything the collection core needs from its host.
///
/// Loading this (files, flags, env) is the host's job; the core only
/// validates it.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection string for the monitored instance.
    pub dsn: String,

    /// Identity stamped on every report.
    pub agent_id: String,

    /// Aggregation window length (seconds).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Target re-discovery period (seconds).
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,

    /// Maximum fingerprint/example length: 0 selects the default,
    /// negative disables truncation.
    #[serde(default)]
    pub max_query_length: i32,

    /// Do not attach example queries to buckets.
    #[serde(default)]
    pub disable_query_examples: bool,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_report_queue_capacity")]
    pub report_queue_capacity: usize,
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL.as_secs()
}
fn default_rescan_interval_secs() -> u64 {
    DEFAULT_RESCAN_INTERVAL.as_secs()
}
fn default_event_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE_CAPACITY
}
fn default_report_queue_capacity() -> usize {
    DEFAULT_REPORT_QUEUE_CAPACITY
}

impl Config {
    /// Config with every optional field at its default.
    pub fn new(dsn: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            agent_id: agent_id.into(),
            interval_secs: default_interval_secs(),
            rescan_interval_secs: default_rescan_interval_secs(),
            max_query_length: 0,
            disable_query_examples: false,
            event_queue_capacity: default_event_queue_capacity(),
            report_queue_capacity: default_report_queue_capacity(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    /// Reject configurations that cannot work before any monitoring starts.
    pub fn validate(&self) -> Result<()> {
        if self.dsn.trim().is_empty() {
            return Err(QanError::Config("dsn must not be empty".into()));
        }
        if self.agent_id.trim().is_empty() {
            return Err(QanError::Config("agent_id must not be empty".into()));
        }
        if self.interval_secs == 0 {
            return Err(QanError::Config("interval_secs must be positive".into()));
        }
        if self.rescan_interval_secs == 0 {
            return Err(QanError::Config(
                "rescan_interval_secs must be positive".into(),
            ));
        }
        if self.event_queue_capacity == 0 || self.report_queue_capacity == 0 {
            return Err(QanError::Config("queue capacities must be positive".into()));
        }
        Ok(())
    }
}
