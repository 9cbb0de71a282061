//! Query analytics collection core for MongoDB.
//!
//! Profiler events are tailed per database, reduced to normalized
//! fingerprints, aggregated into fixed windows and handed to a [`Writer`]
//! as [`Report`]s.

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fingerprint;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod monitor;
pub mod parser;
pub mod registry;
pub mod report;
pub mod sender;
pub mod source;
pub mod truncate;

pub use aggregator::Aggregator;
pub use config::Config;
pub use engine::Engine;
pub use error::{QanError, Result};
pub use event::{EventMetrics, LockMetrics, OpKind, RawEvent, StorageMetrics};
pub use fingerprint::{fingerprint, Fingerprint};
pub use monitor::{Monitor, MonitorState};
pub use registry::TargetRegistry;
pub use report::{Bucket, LockStats, Report};
pub use sender::{Sender, Writer};
pub use source::{Connector, EventSource, EventStream};
