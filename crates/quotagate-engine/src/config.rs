use std::path::Path;

use chrono::{FixedOffset, NaiveTime};
use quotagate_enforce::DispatcherConfig;
use quotagate_policy::plan::parse_wall_time;
use quotagate_policy::rollover::parse_utc_offset;
use quotagate_policy::RolloverPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of subscriber partitions (worker tasks).
    pub partitions: usize,
    /// Bounded queue depth per partition.
    pub partition_queue_depth: usize,
    /// Process-wide timezone, e.g. `"+03:00"`.
    pub timezone: String,
    /// Local time the daily horizon resets, `"HH:MM:SS"`. `None` defers daily resets.
    pub daily_reset_time: Option<String>,
    /// Expected interval between interim updates.
    pub interim_interval_secs: u64,
    /// Missed interims after which a session is resynchronised.
    pub max_missed_updates: u32,
    /// Period of the background re-evaluation sweep (0 disables it).
    pub reevaluate_interval_secs: u64,
    /// Sessions silent for this long are treated as ended (0 keeps them forever).
    /// Must exceed the resync window.
    pub session_idle_secs: u64,
    /// Enforcement dispatch settings.
    pub dispatcher: DispatcherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 8,
            partition_queue_depth: 1024,
            timezone: String::from("+00:00"),
            daily_reset_time: Some(String::from("00:00:00")),
            interim_interval_secs: 300,
            max_missed_updates: 3,
            reevaluate_interval_secs: 60,
            session_idle_secs: 3_600,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: EngineConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: EngineConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Checks ranges and parses the time settings.
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(EngineError::Config("partitions must be at least 1".to_string()));
        }
        if self.partition_queue_depth == 0 {
            return Err(EngineError::Config(
                "partition_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.interim_interval_secs == 0 {
            return Err(EngineError::Config(
                "interim_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.dispatcher.max_concurrent_commands == 0 {
            return Err(EngineError::Config(
                "dispatcher.max_concurrent_commands must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.command_timeout_ms == 0 {
            return Err(EngineError::Config(
                "dispatcher.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        let resync_window = self
            .interim_interval_secs
            .saturating_mul(u64::from(self.max_missed_updates.max(1)));
        if self.session_idle_secs != 0 && self.session_idle_secs <= resync_window {
            return Err(EngineError::Config(format!(
                "session_idle_secs must exceed interim_interval_secs * max_missed_updates ({})",
                resync_window
            )));
        }
        self.utc_offset()?;
        self.reset_time()?;
        Ok(())
    }

    /// Parsed timezone.
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.timezone).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Parsed daily reset time.
    pub fn reset_time(&self) -> Result<Option<NaiveTime>> {
        self.daily_reset_time
            .as_deref()
            .map(parse_wall_time)
            .transpose()
            .map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Rollover policy for these settings.
    pub fn rollover_policy(&self) -> Result<RolloverPolicy> {
        Ok(RolloverPolicy::new(self.reset_time()?, self.utc_offset()?))
    }

    /// Idle horizon after which a session cursor is dropped, if enabled.
    pub fn session_idle(&self) -> Option<chrono::Duration> {
        match self.session_idle_secs {
            0 => None,
            // Capped at roughly a century.
            secs => Some(chrono::Duration::seconds(secs.min(3_153_600_000) as i64)),
        }
    }

    /// Interim interval as a duration.
    pub fn interim_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interim_interval_secs)
    }
}
