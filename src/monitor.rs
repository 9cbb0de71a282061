use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::collector::Collector;
use crate::error::Result;
use crate::parser::Parser;
use crate::source::EventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
        };
        f.write_str(s)
    }
}

/// A collector and a parser for one target, started and stopped together.
pub struct Monitor {
    target: String,
    source: Arc<dyn EventSource>,
    aggregator: Arc<Aggregator>,
    event_queue_capacity: usize,
    with_examples: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    state: MonitorState,
    collector: Option<Collector>,
    parser: Option<Parser>,
}

impl Monitor {
    pub fn new(
        target: impl Into<String>,
        source: Arc<dyn EventSource>,
        aggregator: Arc<Aggregator>,
        event_queue_capacity: usize,
        with_examples: bool,
    ) -> Self {
        Self {
            target: target.into(),
            source,
            aggregator,
            event_queue_capacity,
            with_examples,
            inner: Mutex::new(Inner {
                state: MonitorState::Stopped,
                collector: None,
                parser: None,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn state(&self) -> MonitorState {
        self.inner.lock().await.state
    }

    /// Start collecting. Either both halves run afterwards or neither does.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == MonitorState::Running {
            return Ok(());
        }
        inner.state = MonitorState::Starting;

        let collector = Collector::new(
            self.target.clone(),
            Arc::clone(&self.source),
            self.event_queue_capacity,
        );
        let queue = match collector.start().await {
            Ok(queue) => queue,
            Err(e) => {
                inner.state = MonitorState::Stopped;
                return Err(e);
            }
        };

        let parser = Parser::new(
            self.target.clone(),
            queue,
            Arc::clone(&self.aggregator),
            self.with_examples,
        );
        if let Err(e) = parser.start().await {
            collector.stop().await;
            inner.state = MonitorState::Stopped;
            return Err(e);
        }

        inner.collector = Some(collector);
        inner.parser = Some(parser);
        inner.state = MonitorState::Running;
        info!(db = %self.target, "monitoring started");
        Ok(())
    }

    /// Stop both halves. Safe to call in any state.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let was_running = inner.state != MonitorState::Stopped;

        if let Some(collector) = inner.collector.take() {
            collector.stop().await;
        }
        if let Some(parser) = inner.parser.take() {
            parser.stop().await;
        }
        inner.state = MonitorState::Stopped;

        if was_running {
            info!(db = %self.target, "monitoring stopped");
        }
    }

    /// Running and still receiving events; false once the stream has ended.
    pub async fn is_healthy(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != MonitorState::Running {
            return false;
        }
        match &inner.parser {
            Some(parser) => {
                let finished = parser.is_finished().await;
                if finished {
                    warn!(db = %self.target, "event stream is gone");
                }
                !finished
            }
            None => false,
        }
    }
}
