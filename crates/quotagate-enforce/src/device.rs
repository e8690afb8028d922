//! NAS devices and the vendor client seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotagate_policy::{DeviceId, RateLimit};
use serde::{Deserialize, Serialize};

use crate::circuitbreaker::CircuitState;
use crate::command::{CoaAttribute, RateLimitCommand};
use crate::error::Result;

/// Router vendor. Decides the RADIUS attributes used for CoA rate limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceVendor {
    /// MikroTik RouterOS.
    Mikrotik,
    /// Cisco IOS / ASR BNG.
    Cisco,
    /// Anything speaking WISPr bandwidth attributes.
    #[default]
    Generic,
}

impl DeviceVendor {
    /// CoA attributes that set `rate` on an active session.
    pub fn rate_attributes(&self, rate: RateLimit) -> Vec<CoaAttribute> {
        match self {
            // rx/tx from the router's side: upload first.
            DeviceVendor::Mikrotik => vec![CoaAttribute::new(
                "Mikrotik-Rate-Limit",
                format!("{}k/{}k", rate.upload_kbps, rate.download_kbps),
            )],
            DeviceVendor::Cisco => vec![
                CoaAttribute::new(
                    "Cisco-AVPair",
                    format!("ip:sub-qos-policy-in=QG-{}K", rate.upload_kbps),
                ),
                CoaAttribute::new(
                    "Cisco-AVPair",
                    format!("ip:sub-qos-policy-out=QG-{}K", rate.download_kbps),
                ),
            ],
            DeviceVendor::Generic => vec![
                CoaAttribute::new(
                    "WISPr-Bandwidth-Max-Down",
                    rate.download_kbps.saturating_mul(1000).to_string(),
                ),
                CoaAttribute::new(
                    "WISPr-Bandwidth-Max-Up",
                    rate.upload_kbps.saturating_mul(1000).to_string(),
                ),
            ],
        }
    }
}

/// Queue placement applied to every queue created on the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueParams {
    /// Parent queue the subscriber queues hang under.
    #[serde(default)]
    pub parent: Option<String>,
    /// Burst allowance above the limit, in percent (0 = no burst).
    #[serde(default)]
    pub burst_percent: u32,
    /// Queue priority, 1 (highest) to 8.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    8
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            parent: None,
            burst_percent: 0,
            priority: default_priority(),
        }
    }
}

/// A NAS that can be commanded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier.
    pub id: DeviceId,
    /// Display name.
    pub name: String,
    /// Vendor.
    #[serde(default)]
    pub vendor: DeviceVendor,
    /// Management address.
    pub address: String,
    /// The device exposes a queue management API.
    #[serde(default)]
    pub api_enabled: bool,
    /// The device accepts RADIUS CoA.
    #[serde(default)]
    pub supports_coa: bool,
    /// Queue placement.
    #[serde(default)]
    pub queue_params: QueueParams,
}

/// Online when commands are being delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// Commands flow.
    Online,
    /// Commands are queued until a probe succeeds.
    Offline,
}

/// Point-in-time view of a device for operators.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceStatus {
    /// Device identifier.
    pub device: DeviceId,
    /// Display name.
    pub name: String,
    /// Online or offline.
    pub reachability: Reachability,
    /// Breaker state behind `reachability`.
    pub breaker: CircuitState,
    /// Last successful command or probe.
    pub last_seen: Option<DateTime<Utc>>,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Targets waiting for delivery.
    pub pending: usize,
    /// Targets with an acknowledged state.
    pub applied: usize,
}

/// Vendor API / RADIUS client used to talk to NAS devices.
///
/// Implementations must be idempotent: re-sending the same state is a no-op on the device.
#[async_trait]
pub trait NasClient: Send + Sync + 'static {
    /// Creates or updates a traffic-shaping queue.
    async fn apply_rate_limit(&self, device: &Device, command: &RateLimitCommand) -> Result<()>;

    /// Sends a Change-of-Authorization for an active session.
    async fn issue_coa(
        &self,
        device: &Device,
        session_id: &str,
        attributes: &[CoaAttribute],
    ) -> Result<()>;

    /// Disconnects a subscriber so the next login picks up the new policy.
    async fn disconnect(&self, device: &Device, username: &str, session_id: Option<&str>) -> Result<()>;

    /// Reachability probe. `Ok` means online.
    async fn ping(&self, device: &Device) -> Result<()>;
}
