//! MongoDB profiler as an [`EventSource`].
//!
//! Every non-system database is a target; its `system.profile` collection is
//! tailed with an awaiting cursor.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::options::{ClientOptions, CursorType};
use mongodb::Client;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::error::{QanError, Result};
use crate::event::RawEvent;
use crate::source::{Connector, EventSource, EventStream};

const PROFILE_COLLECTION: &str = "system.profile";
const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];

/// Connects to one instance with the profiler's application name.
pub struct MongoConnector {
    dsn: String,
    agent_id: String,
}

impl MongoConnector {
    pub fn new(dsn: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self) -> Result<Arc<dyn EventSource>> {
        let mut options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|e| QanError::Config(format!("invalid dsn: {e}")))?;
        options.app_name = Some(format!("QAN-mongodb-profiler-{}", self.agent_id));
        options.direct_connection = Some(true);

        let client = Client::with_options(options)?;
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        info!("connected to mongodb");

        Ok(Arc::new(ProfilerSource { client }))
    }
}

/// One client session shared by all collectors.
pub struct ProfilerSource {
    client: Client,
}

#[async_trait]
impl EventSource for ProfilerSource {
    async fn list_targets(&self) -> Result<Vec<String>> {
        let mut names = self.client.list_database_names().await?;
        names.retain(|name| !SYSTEM_DATABASES.contains(&name.as_str()));
        names.sort();
        Ok(names)
    }

    async fn open_event_stream(&self, target: &str) -> Result<EventStream> {
        let filter = doc! {
            "ns": { "$ne": format!("{target}.{PROFILE_COLLECTION}") },
            "ts": { "$gt": bson::DateTime::now() },
        };
        let cursor = self
            .client
            .database(target)
            .collection::<Document>(PROFILE_COLLECTION)
            .find(filter)
            .sort(doc! { "$natural": 1 })
            .cursor_type(CursorType::TailableAwait)
            .await?;
        debug!(db = %target, "tailing profiler");

        let events = cursor.map(|item| {
            item.map_err(QanError::from)
                .and_then(|doc| RawEvent::from_profile_document(&doc))
        });
        Ok(Box::pin(events))
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        debug!("mongodb client shut down");
    }
}
