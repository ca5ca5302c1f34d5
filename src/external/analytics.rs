use anyhow::Result;
use log::info;

#[async_trait::async_trait]
pub trait Analytics: Send + Sync {
    async fn track(&self, event: &str, properties: serde_json::Value) -> Result<()>;
}

/// Writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnalytics;

#[async_trait::async_trait]
impl Analytics for LogAnalytics {
    async fn track(&self, event: &str, properties: serde_json::Value) -> Result<()> {
        info!(target: "analytics", "{} {}", event, properties);
        Ok(())
    }
}
