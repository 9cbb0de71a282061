use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::error::{QanError, Result};
use crate::event::RawEvent;
use crate::source::{EventSource, EventStream};

/// Receiving side of a collector: decoded events in arrival order.
pub type EventQueue = mpsc::Receiver<RawEvent>;

/// Tails one target and pushes its events onto a bounded queue.
pub struct Collector {
    target: String,
    source: Arc<dyn EventSource>,
    capacity: usize,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Collector {
    pub fn new(target: impl Into<String>, source: Arc<dyn EventSource>, capacity: usize) -> Self {
        Self {
            target: target.into(),
            source,
            capacity: if capacity == 0 { DEFAULT_EVENT_QUEUE_CAPACITY } else { capacity },
            pump: Mutex::new(None),
        }
    }

    /// Open the stream and start forwarding.
    ///
    /// A failure to open is returned as is; there is no retry here.
    pub async fn start(&self) -> Result<EventQueue> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return Err(QanError::AlreadyRunning("collector"));
        }

        let stream = self.source.open_event_stream(&self.target).await?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward(self.target.clone(), stream, tx, cancel.clone()));
        *pump = Some((cancel, handle));

        debug!(db = %self.target, "collector started");
        Ok(rx)
    }

    /// Stop forwarding and wait for the pump task to exit. Idempotent.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.pump.lock().await.take() else {
            return;
        };
        cancel.cancel();
        let _ = handle.await;
        debug!(db = %self.target, "collector stopped");
    }
}

async fn forward(
    target: String,
    mut stream: EventStream,
    tx: mpsc::Sender<RawEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            debug!(db = %target, "event queue dropped by consumer");
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) if e.is_per_event() => {
                warn!(db = %target, "skipping undecodable event: {e}");
            }
            Some(Err(e)) => {
                warn!(db = %target, "event stream failed: {e}");
                return;
            }
            None => {
                debug!(db = %target, "event stream ended");
                return;
            }
        }
    }
}
