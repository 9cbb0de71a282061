use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::aggregator::ReportQueue;
use crate::error::{QanError, Result};
use crate::report::Report;

/// Upstream consumer of finished reports.
#[async_trait]
pub trait Writer: Send + Sync + 'static {
    async fn write(&self, report: Report) -> Result<()>;
}

/// Moves reports from the aggregator to a [`Writer`], one at a time.
///
/// Delivery is at-most-once: a failed write is logged and the report is
/// dropped.
pub struct Sender {
    writer: Arc<dyn Writer>,
    state: Mutex<State>,
}

struct State {
    /// Present while stopped; moved into the worker while running.
    queue: Option<ReportQueue>,
    worker: Option<(CancellationToken, JoinHandle<ReportQueue>)>,
}

impl Sender {
    pub fn new(queue: ReportQueue, writer: Arc<dyn Writer>) -> Self {
        Self {
            writer,
            state: Mutex::new(State {
                queue: Some(queue),
                worker: None,
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.worker.is_some()
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.worker.is_some() {
            return Ok(());
        }
        let queue = state.queue.take().ok_or(QanError::QueueClosed("sender"))?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(queue, Arc::clone(&self.writer), cancel.clone()));
        state.worker = Some((cancel, handle));
        debug!("sender started");
        Ok(())
    }

    /// Stop the worker; reports still queued stay in the queue.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some((cancel, handle)) = state.worker.take() else {
            return;
        };
        cancel.cancel();
        match handle.await {
            Ok(queue) => state.queue = Some(queue),
            Err(e) => error!("sender worker failed: {e}"),
        }
        debug!("sender stopped");
    }
}

async fn run(mut queue: ReportQueue, writer: Arc<dyn Writer>, cancel: CancellationToken) -> ReportQueue {
    loop {
        let report = tokio::select! {
            _ = cancel.cancelled() => break,
            report = queue.recv() => match report {
                Some(report) => report,
                None => {
                    debug!("report queue closed");
                    // Park until stopped so the queue can be handed back.
                    cancel.cancelled().await;
                    break;
                }
            },
        };

        let start_ts = report.start_ts;
        if let Err(e) = writer.write(report).await {
            let e = match e {
                e @ QanError::Delivery(_) => e,
                other => QanError::Delivery(other.to_string()),
            };
            error!(start = %start_ts, "discarding report: {e}");
        }
    }
    queue
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct CountingWriter {
        calls: AtomicUsize,
        fail_first: bool,
        delivered: tokio::sync::Mutex<Vec<Report>>,
    }

    #[async_trait]
    impl Writer for CountingWriter {
        async fn write(&self, report: Report) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(QanError::Delivery("upstream unavailable".into()));
            }
            self.delivered.lock().await.push(report);
            Ok(())
        }
    }

    fn report(agent: &str) -> Report {
        let now = Utc::now();
        Report {
            start_ts: now,
            end_ts: now,
            agent_id: agent.to_string(),
            buckets: Vec::new(),
        }
    }

    async fn wait_for_calls(writer: &CountingWriter, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while writer.calls.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("writer was not called in time");
    }

    #[tokio::test]
    async fn failed_write_is_dropped_and_next_report_delivered() {
        let (tx, rx) = mpsc::channel(4);
        let writer = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail_first: true,
            delivered: Default::default(),
        });
        let sender = Sender::new(rx, writer.clone());
        sender.start().await.unwrap();

        tx.send(report("first")).await.unwrap();
        tx.send(report("second")).await.unwrap();
        wait_for_calls(&writer, 2).await;

        let delivered = writer.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].agent_id, "second");
        drop(delivered);
        sender.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent_and_restartable() {
        let (tx, rx) = mpsc::channel(4);
        let writer = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail_first: false,
            delivered: Default::default(),
        });
        let sender = Sender::new(rx, writer.clone());
        sender.start().await.unwrap();
        sender.start().await.unwrap();
        assert!(sender.is_running().await);

        sender.stop().await;
        sender.stop().await;
        assert!(!sender.is_running().await);

        sender.start().await.unwrap();
        tx.send(report("after-restart")).await.unwrap();
        wait_for_calls(&writer, 1).await;
        sender.stop().await;
    }
}
