//! Per-subscriber usage state.
//!
//! Daily and monthly counters only ever grow within a period. They are zeroed
//! by [`crate::rollover::RolloverPolicy`] and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TrafficClass, UsageCounters};

/// Identifies one accounting stream: a session and the class it reports on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Accounting session id as delivered by the NAS.
    pub session_id: String,
    /// Traffic class of the stream.
    pub class: TrafficClass,
}

impl SessionKey {
    /// Creates a key.
    pub fn new(session_id: impl Into<String>, class: TrafficClass) -> Self {
        Self {
            session_id: session_id.into(),
            class,
        }
    }
}

/// Last-seen cumulative counters for one accounting stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    /// Stream identity.
    pub key: SessionKey,
    /// Last cumulative input octets (subscriber upload).
    pub input_octets: u64,
    /// Last cumulative output octets (subscriber download).
    pub output_octets: u64,
    /// Total bytes credited from this stream so far.
    pub credited_bytes: u64,
    /// Timestamp of the last event applied to this stream.
    pub last_update: DateTime<Utc>,
    /// Number of events applied to this stream.
    pub updates: u64,
}

impl SessionCursor {
    /// Creates an empty cursor.
    pub fn new(key: SessionKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            input_octets: 0,
            output_octets: 0,
            credited_bytes: 0,
            last_update: at,
            updates: 0,
        }
    }
}

/// Usage state for one subscriber.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberUsage {
    /// Counters for the current day.
    pub daily: UsageCounters,
    /// Counters for the current billing month.
    pub monthly: UsageCounters,
    /// Daily FUP tier reached (0 = normal, 1-3 = tier).
    pub daily_fup_level: u8,
    /// Monthly FUP tier reached (0 = normal, 1-3 = tier).
    pub monthly_fup_level: u8,
    /// When the daily counters were last zeroed.
    pub last_daily_reset: Option<DateTime<Utc>>,
    /// When the monthly counters were last zeroed.
    pub last_monthly_reset: Option<DateTime<Utc>>,
    /// Timestamp of the last accounting event applied.
    pub last_quota_sync: Option<DateTime<Utc>>,
    /// Bytes attributed to quota-exempt CDN traffic.
    pub bypass_bytes: u64,
    /// Live accounting streams.
    #[serde(default)]
    pub sessions: Vec<SessionCursor>,
}

impl SubscriberUsage {
    /// Creates empty usage state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a stream cursor.
    pub fn cursor(&self, key: &SessionKey) -> Option<&SessionCursor> {
        self.sessions.iter().find(|c| &c.key == key)
    }

    /// Returns the cursor for `key`, creating it if missing.
    pub fn cursor_mut_or_insert(&mut self, key: &SessionKey, at: DateTime<Utc>) -> &mut SessionCursor {
        let idx = match self.sessions.iter().position(|c| &c.key == key) {
            Some(idx) => idx,
            None => {
                self.sessions.push(SessionCursor::new(key.clone(), at));
                self.sessions.len() - 1
            }
        };
        &mut self.sessions[idx]
    }

    /// Drops a stream cursor, returning it.
    pub fn remove_cursor(&mut self, key: &SessionKey) -> Option<SessionCursor> {
        let idx = self.sessions.iter().position(|c| &c.key == key)?;
        Some(self.sessions.swap_remove(idx))
    }

    /// Drops cursors last updated before `cutoff`, except `keep`. Returns the dropped ones.
    ///
    /// Covers sessions whose stop record never arrived.
    pub fn prune_idle(&mut self, cutoff: DateTime<Utc>, keep: Option<&SessionKey>) -> Vec<SessionCursor> {
        let (idle, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|c| c.last_update < cutoff && Some(&c.key) != keep);
        self.sessions = live;
        idle
    }

    /// Traffic classes with at least one live stream, sorted and deduplicated.
    pub fn live_classes(&self) -> Vec<TrafficClass> {
        let mut classes: Vec<TrafficClass> = self.sessions.iter().map(|c| c.key.class).collect();
        classes.sort();
        classes.dedup();
        classes
    }

    /// Most recently updated session id for `class`, if any.
    pub fn latest_session(&self, class: TrafficClass) -> Option<&str> {
        self.sessions
            .iter()
            .filter(|c| c.key.class == class)
            .max_by_key(|c| c.last_update)
            .map(|c| c.key.session_id.as_str())
    }

    /// Adds quota-counted bytes to both horizons.
    pub fn add_usage(&mut self, download: u64, upload: u64) {
        self.daily.add(download, upload);
        self.monthly.add(download, upload);
    }
}
