//! Provisioning data the engine consumes but does not own: plans, CDN mappings,
//! devices, subscribers and rules.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::FixedOffset;
use quotagate_enforce::Device;
use quotagate_policy::{
    CdnId, CdnMapping, GlobalRule, OverrideRule, Plan, PlanId, RuleRepository,
};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::{MemoryStore, SubscriberRecord};

/// Everything read from the catalog file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Service plans.
    #[serde(default)]
    pub plans: Vec<Plan>,
    /// CDN mappings.
    #[serde(default)]
    pub cdns: Vec<CdnMapping>,
    /// NAS devices.
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Subscribers.
    #[serde(default)]
    pub subscribers: Vec<SubscriberRecord>,
    /// Per-subscriber override rules.
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
    /// Global rules.
    #[serde(default)]
    pub globals: Vec<GlobalRule>,
}

impl Catalog {
    /// Loads a TOML or JSON catalog, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported catalog file extension: {}", ext),
        }
    }

    /// Checks plans and cross references.
    ///
    /// A subscriber pointing at an unknown plan is only logged: the engine keeps
    /// accounting for them and skips enforcement.
    pub fn validate(&self) -> Result<()> {
        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            plan.validate()?;
            if !plan_ids.insert(plan.id) {
                return Err(EngineError::Config(format!("duplicate plan {}", plan.id)));
            }
        }

        let mut cdn_ids = HashSet::new();
        for cdn in &self.cdns {
            if !cdn_ids.insert(cdn.id) {
                return Err(EngineError::Config(format!("duplicate cdn {}", cdn.id)));
            }
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id) {
                return Err(EngineError::Config(format!("duplicate device {}", device.id)));
            }
        }

        let mut subscriber_ids = HashSet::new();
        for sub in &self.subscribers {
            if sub.id.as_u64() == 0 {
                return Err(EngineError::Config(format!(
                    "subscriber {} has id 0",
                    sub.username
                )));
            }
            if !subscriber_ids.insert(sub.id) {
                return Err(EngineError::Config(format!("duplicate subscriber {}", sub.id)));
            }
            if !device_ids.contains(&sub.device_id) {
                return Err(EngineError::Config(format!(
                    "subscriber {} references unknown device {}",
                    sub.id, sub.device_id
                )));
            }
            if !plan_ids.contains(&sub.plan_id) {
                tracing::warn!(subscriber = %sub.id, plan = %sub.plan_id, "subscriber references unknown plan");
            }
        }
        Ok(())
    }

    /// Plans by id.
    pub fn plan_index(&self) -> HashMap<PlanId, Plan> {
        self.plans.iter().map(|p| (p.id, p.clone())).collect()
    }

    /// CDN mappings by id.
    pub fn cdn_index(&self) -> HashMap<CdnId, CdnMapping> {
        self.cdns.iter().map(|c| (c.id, c.clone())).collect()
    }

    /// A rule repository loaded with the catalog's rules.
    pub fn rule_repository(&self, utc_offset: FixedOffset) -> Result<RuleRepository> {
        let repo = RuleRepository::new(utc_offset);
        for rule in &self.overrides {
            repo.add_override(rule.clone())?;
        }
        for rule in &self.globals {
            repo.add_global(rule.clone())?;
        }
        Ok(repo)
    }

    /// A memory store seeded with the catalog's subscribers.
    pub fn memory_store(&self) -> MemoryStore {
        MemoryStore::with_records(self.subscribers.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate_policy::{SubscriberId, TrafficClass};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[[plans]]
id = 1
name = "home-50"
base = { download_kbps = 50000, upload_kbps = 10000 }
daily_quota_bytes = 30000000000
daily_tiers = [
    { threshold_bytes = 5000000000, download_kbps = 20000, upload_kbps = 5000 },
    { threshold_bytes = 10000000000, download_kbps = 10000, upload_kbps = 2000 },
]

[plans.time_of_day]
window = { start = "01:00:00", end = "07:00:00" }
ratio_percent = 200

[[cdns]]
id = 3
name = "video-cache"
bypass_quota = true
shared_queue = true
speed_limit = { download_kbps = 100000, upload_kbps = 5000 }

[[devices]]
id = 1
name = "bng-1"
vendor = "mikrotik"
address = "10.0.0.1"
api_enabled = true

[[subscribers]]
id = 42
username = "alice"
plan_id = 1
device_id = 1
renewal_at = "2024-06-01T00:00:00Z"

[[overrides]]
id = 100
subscriber = 42
scope = "internet"
enabled = true
rate = { download_kbps = 80000, upload_kbps = 20000 }
priority = 10
created_at = "2024-06-01T00:00:00Z"

[[globals]]
id = 200
name = "night boost"
enabled = true
auto_apply = true
window = { start = "01:00:00", end = "05:00:00" }
days = ["Sat", "Sun"]
multiplier_percent = 150
priority = 1
created_at = "2024-06-01T00:00:00Z"
"#;

    fn sample() -> Catalog {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let catalog = sample();
        assert_eq!(catalog.plans.len(), 1);
        assert_eq!(catalog.plans[0].daily_tiers.len(), 2);
        assert!(catalog.plans[0].time_of_day.as_ref().unwrap().apply_inside);
        assert!(catalog.cdns[0].bypass_quota);
        assert!(catalog.devices[0].api_enabled);
        assert!(!catalog.devices[0].supports_coa);
        assert_eq!(catalog.subscribers[0].username, "alice");
        assert_eq!(catalog.globals[0].days.len(), 2);
        assert!(catalog.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let catalog = Catalog::from_file(file.path()).unwrap();
        assert_eq!(catalog.overrides.len(), 1);
    }

    #[test]
    fn test_rule_repository_loaded() {
        let repo = sample().rule_repository(FixedOffset::east_opt(0).unwrap()).unwrap();
        let at = chrono::DateTime::parse_from_rfc3339("2024-06-03T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let active = repo.active_rules_for(SubscriberId::new(42), TrafficClass::Internet, at);
        assert_eq!(active.top_override().map(|r| r.priority), Some(10));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let mut catalog = sample();
        catalog.subscribers[0].device_id = quotagate_policy::DeviceId::new(9);
        assert!(matches!(catalog.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_plan_rejected() {
        let mut catalog = sample();
        catalog.plans[0].daily_tiers.reverse();
        assert!(matches!(catalog.validate(), Err(EngineError::Policy(_))));
    }

    #[test]
    fn test_memory_store_seeded() {
        let store = sample().memory_store();
        assert_eq!(store.len(), 1);
        assert!(store.get(SubscriberId::new(42)).is_some());
    }
}
