use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qan_profiler::mongo::MongoConnector;
use qan_profiler::{Config, Engine, QanError, Report, Result, Writer};

/// Prints every report to stdout as one JSON line.
struct StdoutWriter;

#[async_trait]
impl Writer for StdoutWriter {
    async fn write(&self, report: Report) -> Result<()> {
        let line = serde_json::to_string(&report).map_err(|e| QanError::Delivery(e.to_string()))?;
        println!("{line}");
        Ok(())
    }
}

fn config_from_env() -> Result<Config> {
    let dsn = std::env::var("QAN_DSN").unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string());
    let agent_id = std::env::var("QAN_AGENT_ID").unwrap_or_else(|_| "qan-local".to_string());
    let mut config = Config::new(dsn, agent_id);

    if let Ok(secs) = std::env::var("QAN_INTERVAL_SECS") {
        config.interval_secs = secs
            .parse()
            .map_err(|e| QanError::Config(format!("QAN_INTERVAL_SECS: {e}")))?;
    }
    Ok(config)
}

async fn run() -> Result<()> {
    let config = config_from_env()?;
    let connector = Arc::new(MongoConnector::new(config.dsn.clone(), config.agent_id.clone()));
    let engine = Engine::new(config, connector, Arc::new(StdoutWriter))?;

    engine.start().await?;
    info!(targets = ?engine.targets().await, "profiling, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
    }
    engine.stop().await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qan_profiler=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(1);
    }
}
