use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{QanError, Result};
use crate::monitor::Monitor;
use crate::registry::{MonitorFactory, TargetRegistry};
use crate::sender::{Sender, Writer};
use crate::source::{Connector, EventSource};

/// Top-level lifecycle: one session, one aggregator, one sender and a
/// registry of per-target monitors kept current by a rescan loop.
pub struct Engine {
    config: Config,
    connector: Arc<dyn Connector>,
    writer: Arc<dyn Writer>,
    running: Mutex<Option<Running>>,
}

struct Running {
    source: Arc<dyn EventSource>,
    aggregator: Arc<Aggregator>,
    sender: Sender,
    registry: Arc<TargetRegistry>,
    cancel: CancellationToken,
    rescan: JoinHandle<()>,
}

impl Engine {
    pub fn new(config: Config, connector: Arc<dyn Connector>, writer: Arc<dyn Writer>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            writer,
            running: Mutex::new(None),
        })
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start monitoring. Returns once the first target scan has finished.
    ///
    /// A failed first scan is logged, not returned: the rescan loop retries.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let source = self.connector.connect().await?;

        let aggregator = Arc::new(Aggregator::new(
            Utc::now(),
            self.config.agent_id.clone(),
            self.config.interval(),
            self.config.max_query_length,
            self.config.report_queue_capacity,
        ));
        let reports = match aggregator.start() {
            Ok(reports) => reports,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        let sender = Sender::new(reports, Arc::clone(&self.writer));
        if let Err(e) = sender.start().await {
            aggregator.stop().await;
            source.close().await;
            return Err(e);
        }

        let factory: MonitorFactory = {
            let source = Arc::clone(&source);
            let aggregator = Arc::clone(&aggregator);
            let capacity = self.config.event_queue_capacity;
            let with_examples = !self.config.disable_query_examples;
            Arc::new(move |target: &str| {
                Monitor::new(
                    target,
                    Arc::clone(&source),
                    Arc::clone(&aggregator),
                    capacity,
                    with_examples,
                )
            })
        };
        let registry = Arc::new(TargetRegistry::new(Arc::clone(&source), factory));

        let cancel = CancellationToken::new();
        let (first_scan_tx, first_scan_rx) = oneshot::channel();
        let rescan = tokio::spawn(rescan_loop(
            Arc::clone(&registry),
            self.config.rescan_interval(),
            cancel.clone(),
            first_scan_tx,
        ));

        match first_scan_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("initial scan failed, will retry: {e}"),
            Err(_) => debug!("rescan loop exited before the first scan"),
        }

        *running = Some(Running {
            source,
            aggregator,
            sender,
            registry,
            cancel,
            rescan,
        });
        info!(agent_id = %self.config.agent_id, "query analytics started");
        Ok(())
    }

    /// Stop everything started by [`Engine::start`]. Idempotent.
    ///
    /// Shutdown always runs to the end; a rescan task that panicked is
    /// reported afterwards as [`QanError::Shutdown`].
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        let rescan = running.rescan.await;
        running.registry.stop_all().await;
        running.aggregator.stop().await;
        running.sender.stop().await;
        running.source.close().await;
        info!(agent_id = %self.config.agent_id, "query analytics stopped");

        rescan.map_err(|e| {
            error!("rescan loop failed: {e}");
            QanError::Shutdown(format!("rescan loop: {e}"))
        })
    }

    /// Ids of the targets monitored right now; empty when stopped.
    pub async fn targets(&self) -> Vec<String> {
        let registry = match &*self.running.lock().await {
            Some(running) => Arc::clone(&running.registry),
            None => return Vec::new(),
        };
        registry.targets().await
    }
}

async fn rescan_loop(
    registry: Arc<TargetRegistry>,
    period: std::time::Duration,
    cancel: CancellationToken,
    first_scan: oneshot::Sender<Result<()>>,
) {
    let first = tokio::select! {
        _ = cancel.cancelled() => Err(QanError::NotRunning("engine")),
        result = registry.monitor_all() => result,
    };
    let _ = first_scan.send(first);

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = registry.monitor_all().await {
                    error!("target scan failed: {e}");
                }
            }
        }
    }
    debug!("rescan loop exited");
}
