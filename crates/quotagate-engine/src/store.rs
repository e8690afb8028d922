//! Subscriber persistence seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quotagate_policy::{DeviceId, PlanId, SubscriberId, SubscriberUsage};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A subscriber and their usage state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Subscriber identifier.
    pub id: SubscriberId,
    /// Login name.
    pub username: String,
    /// Current plan.
    pub plan_id: PlanId,
    /// NAS serving the subscriber.
    pub device_id: DeviceId,
    /// Start of the current billing month.
    #[serde(default)]
    pub renewal_at: Option<DateTime<Utc>>,
    /// Counters, FUP levels and session cursors.
    #[serde(default)]
    pub usage: SubscriberUsage,
}

impl SubscriberRecord {
    /// Creates a record with empty usage.
    pub fn new(id: SubscriberId, username: impl Into<String>, plan_id: PlanId, device_id: DeviceId) -> Self {
        Self {
            id,
            username: username.into(),
            plan_id,
            device_id,
            renewal_at: None,
            usage: SubscriberUsage::new(),
        }
    }
}

/// Loads and saves subscriber records.
///
/// The engine serialises all access to one subscriber, so implementations only
/// need per-record atomicity.
#[async_trait]
pub trait SubscriberStore: Send + Sync + 'static {
    /// Fetches a record.
    async fn load(&self, id: SubscriberId) -> Result<Option<SubscriberRecord>>;

    /// Writes a record back.
    async fn save(&self, record: &SubscriberRecord) -> Result<()>;

    /// All known subscriber ids.
    async fn ids(&self) -> Result<Vec<SubscriberId>>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<SubscriberId, SubscriberRecord>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `records`.
    pub fn with_records(records: impl IntoIterator<Item = SubscriberRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: SubscriberRecord) {
        self.records.insert(record.id, record);
    }

    /// Snapshot of a record.
    pub fn get(&self, id: SubscriberId) -> Option<SubscriberRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn load(&self, id: SubscriberId) -> Result<Option<SubscriberRecord>> {
        Ok(self.get(id))
    }

    async fn save(&self, record: &SubscriberRecord) -> Result<()> {
        self.insert(record.clone());
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<SubscriberId>> {
        let mut ids: Vec<SubscriberId> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64) -> SubscriberRecord {
        SubscriberRecord::new(SubscriberId::new(id), format!("user{id}"), PlanId::new(1), DeviceId::new(1))
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.load(SubscriberId::new(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStore::new();
        let mut rec = record(7);
        rec.usage.add_usage(100, 10);
        store.save(&rec).await.unwrap();

        let loaded = store.load(SubscriberId::new(7)).await.unwrap().unwrap();
        assert_eq!(loaded.usage.daily.total(), 110);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ids_sorted() {
        let store = MemoryStore::with_records([record(9), record(2), record(5)]);
        let ids = store.ids().await.unwrap();
        assert_eq!(ids, vec![SubscriberId::new(2), SubscriberId::new(5), SubscriberId::new(9)]);
    }

    #[test]
    fn test_record_deserialize_defaults_usage() {
        let rec: SubscriberRecord = serde_json::from_str(
            r#"{"id": 3, "username": "carol", "plan_id": 2, "device_id": 1}"#,
        )
        .unwrap();
        assert_eq!(rec.usage, SubscriberUsage::new());
        assert!(rec.renewal_at.is_none());
    }
}
