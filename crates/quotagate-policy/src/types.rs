//! Identifiers and small value types shared by every QuotaGate subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates the identifier from its raw value.
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Returns the raw value.
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                $name(id)
            }
        }
    };
}

id_type!(
    /// Identifies a subscriber account.
    SubscriberId
);
id_type!(
    /// Identifies an access-network device (NAS).
    DeviceId
);
id_type!(
    /// Identifies a service plan.
    PlanId
);
id_type!(
    /// Identifies a CDN / service mapping.
    CdnId
);
id_type!(
    /// Identifies an override or global rule.
    RuleId
);

/// The class of traffic a counter, rule or queue applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// General internet traffic.
    Internet,
    /// Traffic towards a specific CDN.
    Cdn(CdnId),
}

impl TrafficClass {
    /// Returns the CDN this class is scoped to, if any.
    pub fn cdn(&self) -> Option<CdnId> {
        match self {
            TrafficClass::Internet => None,
            TrafficClass::Cdn(id) => Some(*id),
        }
    }
}

impl Default for TrafficClass {
    fn default() -> Self {
        TrafficClass::Internet
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficClass::Internet => write!(f, "internet"),
            TrafficClass::Cdn(id) => write!(f, "cdn-{}", id),
        }
    }
}

/// A download/upload rate pair in kbit/s.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    /// Download rate (towards the subscriber).
    pub download_kbps: u64,
    /// Upload rate (from the subscriber).
    pub upload_kbps: u64,
}

impl RateLimit {
    /// Creates a rate pair.
    pub const fn new(download_kbps: u64, upload_kbps: u64) -> Self {
        Self {
            download_kbps,
            upload_kbps,
        }
    }

    /// Scales both directions by `percent` (100 = unchanged).
    ///
    /// A non-zero rate never scales below 1 kbit/s.
    pub fn scale_percent(self, percent: u32) -> Self {
        fn scale(rate: u64, percent: u32) -> u64 {
            if rate == 0 {
                return 0;
            }
            let scaled = (rate as u128 * percent as u128 / 100) as u64;
            scaled.max(1)
        }
        Self {
            download_kbps: scale(self.download_kbps, percent),
            upload_kbps: scale(self.upload_kbps, percent),
        }
    }

    /// Lowers each direction to `cap`'s value; a zero component in `cap` is unset.
    pub fn min_per_direction(self, cap: RateLimit) -> Self {
        fn lower(current: u64, cap: u64) -> u64 {
            if cap == 0 {
                current
            } else {
                current.min(cap)
            }
        }
        Self {
            download_kbps: lower(self.download_kbps, cap.download_kbps),
            upload_kbps: lower(self.upload_kbps, cap.upload_kbps),
        }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}k/{}k", self.download_kbps, self.upload_kbps)
    }
}

/// Byte counters for one accounting horizon.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    /// Bytes delivered to the subscriber.
    pub download_bytes: u64,
    /// Bytes sent by the subscriber.
    pub upload_bytes: u64,
}

impl UsageCounters {
    /// Combined download and upload bytes; this is what FUP and quota caps measure.
    pub fn total(&self) -> u64 {
        self.download_bytes.saturating_add(self.upload_bytes)
    }

    /// Adds a delta to both directions.
    pub fn add(&mut self, download: u64, upload: u64) {
        self.download_bytes = self.download_bytes.saturating_add(download);
        self.upload_bytes = self.upload_bytes.saturating_add(upload);
    }

    /// Zeroes both directions.
    pub fn clear(&mut self) {
        *self = UsageCounters::default();
    }
}
