use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::aggregator::Aggregator;
use crate::collector::EventQueue;
use crate::error::{QanError, Result};
use crate::event::{EventMetrics, RawEvent};
use crate::fingerprint::{fingerprint, mask::render_document};

/// Turns one target's events into aggregator samples.
pub struct Parser {
    target: String,
    aggregator: Arc<Aggregator>,
    with_examples: bool,
    state: Mutex<State>,
}

struct State {
    queue: Option<EventQueue>,
    worker: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Parser {
    pub fn new(
        target: impl Into<String>,
        queue: EventQueue,
        aggregator: Arc<Aggregator>,
        with_examples: bool,
    ) -> Self {
        Self {
            target: target.into(),
            aggregator,
            with_examples,
            state: Mutex::new(State {
                queue: Some(queue),
                worker: None,
            }),
        }
    }

    /// Start consuming. A second call while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.worker.is_some() {
            return Ok(());
        }
        let queue = state.queue.take().ok_or(QanError::QueueClosed("parser"))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            self.target.clone(),
            queue,
            Arc::clone(&self.aggregator),
            self.with_examples,
            cancel.clone(),
        ));
        state.worker = Some((cancel, handle));
        debug!(db = %self.target, "parser started");
        Ok(())
    }

    /// Stop consuming and wait for the worker. Idempotent.
    pub async fn stop(&self) {
        let Some((cancel, handle)) = self.state.lock().await.worker.take() else {
            return;
        };
        cancel.cancel();
        let _ = handle.await;
        debug!(db = %self.target, "parser stopped");
    }

    /// True once the worker has exited on its own (end of stream).
    pub async fn is_finished(&self) -> bool {
        match &self.state.lock().await.worker {
            Some((_, handle)) => handle.is_finished(),
            None => false,
        }
    }
}

async fn run(
    target: String,
    mut queue: EventQueue,
    aggregator: Arc<Aggregator>,
    with_examples: bool,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = queue.recv() => match event {
                Some(event) => event,
                None => {
                    debug!(db = %target, "event queue closed, parser exiting");
                    return;
                }
            },
        };
        process(&target, &event, &aggregator, with_examples).await;
    }
}

async fn process(target: &str, event: &RawEvent, aggregator: &Aggregator, with_examples: bool) {
    let fp = match fingerprint(event) {
        Ok(fp) => fp,
        Err(e) => {
            warn!(db = %target, ns = %event.namespace, op = %event.operation, "dropping event: {e}");
            return;
        }
    };

    let example = with_examples.then(|| render_document(&event.command));
    let metrics = EventMetrics::from_event(event, example);
    trace!(db = %target, fingerprint = %fp.fingerprint, "adding event");

    if let Err(e) = aggregator.add(&fp.database, &fp, &metrics).await {
        debug!(db = %target, "aggregator rejected event: {e}");
    }
}
