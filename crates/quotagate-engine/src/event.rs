//! RADIUS accounting events as handed over by the collector.

use chrono::{DateTime, Utc};
use quotagate_policy::{DeviceId, SessionKey, SubscriberId, TrafficClass};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Accounting record type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Session opened.
    Start,
    /// Periodic counter update.
    InterimUpdate,
    /// Session closed; counters are final.
    Stop,
}

/// One parsed accounting record. Counters are cumulative for the session.
///
/// Input octets are bytes the subscriber sent (upload); output octets are bytes
/// the subscriber received (download).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountingEvent {
    /// Subscriber, resolved upstream from the username.
    #[serde(rename = "subscriberID", alias = "subscriberId")]
    pub subscriber_id: SubscriberId,
    /// NAS session identifier.
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
    /// NAS that reported the record.
    #[serde(rename = "deviceID", alias = "deviceId")]
    pub device_id: DeviceId,
    /// Cumulative bytes from the subscriber.
    pub cumulative_input_octets: u64,
    /// Cumulative bytes to the subscriber.
    pub cumulative_output_octets: u64,
    /// Record type.
    pub event_kind: EventKind,
    /// When the NAS produced the record.
    pub timestamp: DateTime<Utc>,
    /// Traffic class the counters belong to.
    #[serde(default)]
    pub traffic_class: TrafficClass,
}

impl AccountingEvent {
    /// Parses one JSON line.
    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| EngineError::MalformedEvent {
            reason: e.to_string(),
        })
    }

    /// Rejects records no subscriber can own.
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_id.as_u64() == 0 {
            return Err(EngineError::MalformedEvent {
                reason: "subscriber id 0".to_string(),
            });
        }
        if self.session_id.trim().is_empty() {
            return Err(EngineError::MalformedEvent {
                reason: format!("empty session id for subscriber {}", self.subscriber_id),
            });
        }
        Ok(())
    }

    /// Cursor key for this record's stream.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.session_id.clone(), self.traffic_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate_policy::CdnId;

    #[test]
    fn test_parse_interim_line() {
        let event = AccountingEvent::from_json_line(
            r#"{"subscriberID": 42, "sessionID": "abc", "deviceID": 1,
                "cumulativeInputOctets": 100, "cumulativeOutputOctets": 900,
                "eventKind": "interim_update", "timestamp": "2024-06-03T10:00:00Z",
                "trafficClass": {"cdn": 7}}"#,
        )
        .unwrap();
        assert_eq!(event.subscriber_id, SubscriberId::new(42));
        assert_eq!(event.event_kind, EventKind::InterimUpdate);
        assert_eq!(event.traffic_class, TrafficClass::Cdn(CdnId::new(7)));
        assert_eq!(event.cumulative_output_octets, 900);
    }

    #[test]
    fn test_traffic_class_defaults_to_internet() {
        let event = AccountingEvent::from_json_line(
            r#"{"subscriberId": 1, "sessionId": "s", "deviceId": 1,
                "cumulativeInputOctets": 0, "cumulativeOutputOctets": 0,
                "eventKind": "start", "timestamp": "2024-06-03T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(event.traffic_class, TrafficClass::Internet);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            AccountingEvent::from_json_line("not json"),
            Err(EngineError::MalformedEvent { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_session_and_zero_subscriber() {
        let mut event = AccountingEvent::from_json_line(
            r#"{"subscriberID": 5, "sessionID": " ", "deviceID": 1,
                "cumulativeInputOctets": 0, "cumulativeOutputOctets": 0,
                "eventKind": "start", "timestamp": "2024-06-03T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(event.validate().is_err());
        event.session_id = "s1".to_string();
        assert!(event.validate().is_ok());
        event.subscriber_id = SubscriberId::new(0);
        assert!(event.validate().is_err());
    }
}
