//! Outbound event hand-off to notification and verification workflows.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pricewatch_core::MonitorEvent;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: MonitorEvent) -> Result<()>;
}

/// Writes each event to the log. Used when no outbox is configured.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: MonitorEvent) -> Result<()> {
        let payload = serde_json::to_string(&event).context("serializing event")?;
        info!(item_id = %event.item_id(), event = %payload, "monitor event");
        Ok(())
    }
}

/// Appends events as JSON lines to an outbox file picked up by downstream workers.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn publish(&self, event: MonitorEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event).context("serializing event")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await.context("flushing event outbox")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<MonitorEvent>>,
}

impl MemoryEventSink {
    pub async fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: MonitorEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
