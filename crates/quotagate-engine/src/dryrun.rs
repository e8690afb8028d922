//! NAS client that only logs what it would send.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use quotagate_enforce::{CoaAttribute, Device, NasClient, RateLimitCommand, Result};

/// Logs every command and reports success.
#[derive(Debug, Default)]
pub struct LoggingNasClient {
    commands: AtomicU64,
}

impl LoggingNasClient {
    /// Creates a client with a zeroed command count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands "sent" so far, probes excluded.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NasClient for LoggingNasClient {
    async fn apply_rate_limit(&self, device: &Device, command: &RateLimitCommand) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            device = %device.name,
            queue = %command.target,
            subscriber = %command.subscriber,
            class = %command.class,
            rate = %command.rate,
            kind = ?command.queue,
            "set queue"
        );
        Ok(())
    }

    async fn issue_coa(&self, device: &Device, session_id: &str, attributes: &[CoaAttribute]) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let attributes: Vec<String> = attributes
            .iter()
            .map(|a| format!("{}={}", a.name, a.value))
            .collect();
        tracing::info!(device = %device.name, session = session_id, ?attributes, "change of authorization");
        Ok(())
    }

    async fn disconnect(&self, device: &Device, username: &str, session_id: Option<&str>) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        tracing::info!(device = %device.name, username, session = ?session_id, "disconnect");
        Ok(())
    }

    async fn ping(&self, _device: &Device) -> Result<()> {
        Ok(())
    }
}
