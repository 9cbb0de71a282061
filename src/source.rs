use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;
use crate::event::RawEvent;

/// Continuous stream of events for one target.
///
/// Items that fail to decode are yielded as `Err(QanError::Decode(_))` and
/// skipped by the collector; any other error ends the stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send>>;

/// Where events come from: one session against the monitored instance,
/// shared read-only by every collector.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Identifiers of the targets that can currently be monitored.
    async fn list_targets(&self) -> Result<Vec<String>>;

    /// Start tailing `target` from "now"; earlier events are never replayed.
    async fn open_event_stream(&self, target: &str) -> Result<EventStream>;

    /// Release the session.
    async fn close(&self) {}
}

/// Opens sessions; called once per engine start.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn EventSource>>;
}
