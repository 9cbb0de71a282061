use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::monitor::Monitor;
use crate::source::EventSource;

/// Builds a (stopped) monitor for a target.
pub type MonitorFactory = Arc<dyn Fn(&str) -> Monitor + Send + Sync>;

/// Keeps exactly one running [`Monitor`] per live target.
pub struct TargetRegistry {
    source: Arc<dyn EventSource>,
    factory: MonitorFactory,
    monitors: Mutex<BTreeMap<String, Arc<Monitor>>>,
}

impl TargetRegistry {
    pub fn new(source: Arc<dyn EventSource>, factory: MonitorFactory) -> Self {
        Self {
            source,
            factory,
            monitors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reconcile the monitor set with the targets the source reports now.
    ///
    /// Monitors for vanished targets are stopped, dead ones are replaced and
    /// new targets get a fresh monitor. The first start failure is returned;
    /// targets after it are picked up on the next call.
    pub async fn monitor_all(&self) -> Result<()> {
        let live: BTreeSet<String> = self.source.list_targets().await?.into_iter().collect();
        let mut monitors = self.monitors.lock().await;

        let vanished: Vec<String> = monitors
            .keys()
            .filter(|target| !live.contains(*target))
            .cloned()
            .collect();
        for target in vanished {
            if let Some(monitor) = monitors.remove(&target) {
                info!(db = %monitor.target(), "target is gone, stopping its monitor");
                monitor.stop().await;
            }
        }

        let mut unhealthy = Vec::new();
        for (target, monitor) in monitors.iter() {
            if !monitor.is_healthy().await {
                unhealthy.push(target.clone());
            }
        }
        for target in unhealthy {
            if let Some(monitor) = monitors.remove(&target) {
                warn!(db = %monitor.target(), "replacing unhealthy monitor");
                monitor.stop().await;
            }
        }

        for target in &live {
            if monitors.contains_key(target) {
                continue;
            }
            let monitor = Arc::new((self.factory)(target));
            monitor.start().await?;
            monitors.insert(target.clone(), monitor);
        }

        debug!(monitors = monitors.len(), "scan complete");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.lock().await;
        for (_, monitor) in std::mem::take(&mut *monitors) {
            monitor.stop().await;
        }
    }

    pub async fn get(&self, target: &str) -> Option<Arc<Monitor>> {
        self.monitors.lock().await.get(target).cloned()
    }

    pub async fn get_all(&self) -> BTreeMap<String, Arc<Monitor>> {
        self.monitors.lock().await.clone()
    }

    pub async fn targets(&self) -> Vec<String> {
        self.monitors.lock().await.keys().cloned().collect()
    }
}
