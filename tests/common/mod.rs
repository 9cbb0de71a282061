#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::Document;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use qan_profiler::{Connector, EventSource, EventStream, QanError, RawEvent, Report, Result, Writer};

/// In-memory event source: targets are set by the test, events are pushed
/// into per-target channels.
#[derive(Default)]
pub struct MockSource {
    targets: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    streams: Mutex<HashMap<String, mpsc::Sender<Result<RawEvent>>>>,
    pub opens: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockSource {
    pub fn new(targets: &[&str]) -> Arc<Self> {
        let source = Self::default();
        source.set_targets(targets);
        Arc::new(source)
    }

    pub fn set_targets(&self, targets: &[&str]) {
        *self.targets.lock() = targets.iter().map(|t| t.to_string()).collect();
    }

    pub fn fail(&self, target: &str) {
        self.failing.lock().insert(target.to_string());
    }

    pub fn heal(&self, target: &str) {
        self.failing.lock().remove(target);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Push an event into the currently open stream of `target`.
    pub async fn push(&self, target: &str, event: RawEvent) {
        let tx = self
            .streams
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_else(|| panic!("no open stream for {target}"));
        tx.send(Ok(event)).await.expect("stream receiver dropped");
    }

    /// End the stream of `target`, as if the server closed the cursor.
    pub fn end(&self, target: &str) {
        self.streams.lock().remove(target);
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn list_targets(&self) -> Result<Vec<String>> {
        Ok(self.targets.lock().clone())
    }

    async fn open_event_stream(&self, target: &str) -> Result<EventStream> {
        if self.failing.lock().contains(target) {
            return Err(QanError::Connection(format!("cannot open {target}")));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.streams.lock().insert(target.to_string(), tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    pub source: Arc<MockSource>,
    pub fail: bool,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn EventSource>> {
        if self.fail {
            return Err(QanError::Connection("connection refused".into()));
        }
        let source: Arc<dyn EventSource> = self.source.clone();
        Ok(source)
    }
}

#[derive(Default)]
pub struct CollectingWriter {
    pub reports: tokio::sync::Mutex<Vec<Report>>,
}

#[async_trait]
impl Writer for CollectingWriter {
    async fn write(&self, report: Report) -> Result<()> {
        self.reports.lock().await.push(report);
        Ok(())
    }
}

pub fn insert(namespace: &str) -> RawEvent {
    let collection = namespace.split_once('.').map(|(_, c)| c).unwrap_or_default();
    let mut command = Document::new();
    command.insert("insert", collection);
    let mut event = RawEvent::new(namespace, "insert", command);
    event.duration_millis = 2;
    event
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
