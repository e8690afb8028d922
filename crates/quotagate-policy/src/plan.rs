//! Service plans, FUP tiers, time-of-day windows and CDN mappings.
//!
//! Plans are administrator-owned and treated as immutable for the duration
//! of a billing period; the engine only ever reads them.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};
use crate::types::{CdnId, PlanId, RateLimit};

/// Maximum number of FUP tiers per horizon.
pub const MAX_FUP_TIERS: usize = 3;

/// One fair-use throttling step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FupTier {
    /// Usage (download + upload bytes) at which this tier engages.
    pub threshold_bytes: u64,
    /// Throttled download rate; 0 leaves download unchanged.
    pub download_kbps: u64,
    /// Throttled upload rate; 0 leaves upload unchanged.
    pub upload_kbps: u64,
}

impl FupTier {
    /// Creates a tier.
    pub fn new(threshold_bytes: u64, download_kbps: u64, upload_kbps: u64) -> Self {
        Self {
            threshold_bytes,
            download_kbps,
            upload_kbps,
        }
    }

    /// The tier's rate as a cap.
    pub fn rate(&self) -> RateLimit {
        RateLimit::new(self.download_kbps, self.upload_kbps)
    }
}

/// A span of local wall-clock time. Wraps across midnight when `end <= start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start.
    pub start: NaiveTime,
    /// Exclusive end.
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Creates a window.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Returns true if `time` falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else if self.start == self.end {
            // Zero-length window is read as "all day".
            true
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// A plan's time-of-day speed ratio.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDayRatio {
    /// The window the ratio is keyed on.
    pub window: TimeWindow,
    /// Speed percentage (100 = unchanged, 200 = double).
    pub ratio_percent: u32,
    /// Apply inside the window when true, outside it when false.
    #[serde(default = "default_true")]
    pub apply_inside: bool,
}

impl TimeOfDayRatio {
    /// Returns the ratio in effect at local time `time`, if any.
    pub fn ratio_at(&self, time: NaiveTime) -> Option<u32> {
        if self.window.contains(time) == self.apply_inside {
            Some(self.ratio_percent)
        } else {
            None
        }
    }
}

fn default_true() -> bool {
    true
}

/// A service plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Display name.
    pub name: String,
    /// Base speed.
    pub base: RateLimit,
    /// Daily FUP tiers, ordered by threshold.
    #[serde(default)]
    pub daily_tiers: Vec<FupTier>,
    /// Monthly FUP tiers, ordered by threshold.
    #[serde(default)]
    pub monthly_tiers: Vec<FupTier>,
    /// Hard daily cap in bytes (0 = unlimited).
    #[serde(default)]
    pub daily_quota_bytes: u64,
    /// Hard monthly cap in bytes (0 = unlimited).
    #[serde(default)]
    pub monthly_quota_bytes: u64,
    /// Optional time-of-day ratio.
    #[serde(default)]
    pub time_of_day: Option<TimeOfDayRatio>,
}

impl Plan {
    /// Creates a plan with no tiers, caps or time-of-day ratio.
    pub fn new(id: PlanId, name: impl Into<String>, base: RateLimit) -> Self {
        Self {
            id,
            name: name.into(),
            base,
            daily_tiers: Vec::new(),
            monthly_tiers: Vec::new(),
            daily_quota_bytes: 0,
            monthly_quota_bytes: 0,
            time_of_day: None,
        }
    }

    /// Checks tier ordering and ratio sanity.
    pub fn validate(&self) -> Result<()> {
        validate_tiers(self.id, "daily", &self.daily_tiers)?;
        validate_tiers(self.id, "monthly", &self.monthly_tiers)?;
        if let Some(tod) = &self.time_of_day {
            if tod.ratio_percent == 0 {
                return Err(PolicyError::InvalidPlan {
                    plan: self.id,
                    reason: "time-of-day ratio must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Highest daily tier reached by `total` bytes, with its 1-based level.
    pub fn daily_tier_for(&self, total: u64) -> Option<(u8, &FupTier)> {
        tier_for(&self.daily_tiers, total)
    }

    /// Highest monthly tier reached by `total` bytes, with its 1-based level.
    pub fn monthly_tier_for(&self, total: u64) -> Option<(u8, &FupTier)> {
        tier_for(&self.monthly_tiers, total)
    }

    /// Per-direction minimum over every configured tier of both horizons.
    ///
    /// Returns `None` when the plan has no tiers at all.
    pub fn most_restrictive_tier_rate(&self) -> Option<RateLimit> {
        let mut tiers = self.daily_tiers.iter().chain(self.monthly_tiers.iter());
        let first = tiers.next()?.rate();
        Some(tiers.fold(first, |acc, tier| {
            RateLimit::new(
                min_set(acc.download_kbps, tier.download_kbps),
                min_set(acc.upload_kbps, tier.upload_kbps),
            )
        }))
    }

    /// True when `daily_total` or `monthly_total` has reached a hard cap.
    pub fn cap_reached(&self, daily_total: u64, monthly_total: u64) -> bool {
        (self.daily_quota_bytes > 0 && daily_total >= self.daily_quota_bytes)
            || (self.monthly_quota_bytes > 0 && monthly_total >= self.monthly_quota_bytes)
    }
}

fn min_set(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

fn tier_for(tiers: &[FupTier], total: u64) -> Option<(u8, &FupTier)> {
    tiers
        .iter()
        .enumerate()
        .rev()
        .find(|(_, tier)| total >= tier.threshold_bytes)
        .map(|(idx, tier)| ((idx + 1) as u8, tier))
}

fn validate_tiers(plan: PlanId, horizon: &str, tiers: &[FupTier]) -> Result<()> {
    if tiers.len() > MAX_FUP_TIERS {
        return Err(PolicyError::InvalidPlan {
            plan,
            reason: format!("{} {} tiers configured, at most {}", tiers.len(), horizon, MAX_FUP_TIERS),
        });
    }
    let mut previous = 0u64;
    for (idx, tier) in tiers.iter().enumerate() {
        if tier.threshold_bytes == 0 {
            return Err(PolicyError::InvalidPlan {
                plan,
                reason: format!("{} tier {} has a zero threshold", horizon, idx + 1),
            });
        }
        if tier.threshold_bytes <= previous {
            return Err(PolicyError::InvalidPlan {
                plan,
                reason: format!("{} tier thresholds must be strictly increasing", horizon),
            });
        }
        previous = tier.threshold_bytes;
    }
    Ok(())
}

/// Maps a CDN / service to its accounting and shaping behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnMapping {
    /// Mapping identifier.
    pub id: CdnId,
    /// Display name.
    pub name: String,
    /// Traffic to this CDN is exempt from quota counters.
    #[serde(default)]
    pub bypass_quota: bool,
    /// CDN-specific speed, used as the base when no override applies.
    #[serde(default)]
    pub speed_limit: Option<RateLimit>,
    /// Shape with a shared (PCQ) queue instead of a per-subscriber queue.
    #[serde(default)]
    pub shared_queue: bool,
}

/// Parses `HH:MM` or `HH:MM:SS` into a wall-clock time.
pub fn parse_wall_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| PolicyError::InvalidTime {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1_000_000_000;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn tiered_plan() -> Plan {
        let mut plan = Plan::new(PlanId::new(1), "home-50", RateLimit::new(50_000, 10_000));
        plan.daily_tiers = vec![
            FupTier::new(5 * GB, 20_000, 5_000),
            FupTier::new(10 * GB, 10_000, 2_000),
            FupTier::new(20 * GB, 2_000, 1_000),
        ];
        plan.monthly_tiers = vec![FupTier::new(100 * GB, 8_000, 0)];
        plan
    }

    mod windows {
        use super::*;

        #[test]
        fn test_plain_window() {
            let w = TimeWindow::new(t(8, 0), t(18, 0));
            assert!(w.contains(t(8, 0)));
            assert!(w.contains(t(12, 30)));
            assert!(!w.contains(t(18, 0)));
            assert!(!w.contains(t(2, 0)));
        }

        #[test]
        fn test_window_wraps_midnight() {
            let w = TimeWindow::new(t(22, 0), t(6, 0));
            assert!(w.contains(t(23, 0)));
            assert!(w.contains(t(0, 0)));
            assert!(w.contains(t(5, 59)));
            assert!(!w.contains(t(6, 0)));
            assert!(!w.contains(t(12, 0)));
        }

        #[test]
        fn test_ratio_inside_and_outside() {
            let inside = TimeOfDayRatio {
                window: TimeWindow::new(t(1, 0), t(7, 0)),
                ratio_percent: 200,
                apply_inside: true,
            };
            assert_eq!(inside.ratio_at(t(3, 0)), Some(200));
            assert_eq!(inside.ratio_at(t(9, 0)), None);

            let outside = TimeOfDayRatio {
                apply_inside: false,
                ..inside
            };
            assert_eq!(outside.ratio_at(t(3, 0)), None);
            assert_eq!(outside.ratio_at(t(9, 0)), Some(200));
        }
    }

    mod tiers {
        use super::*;

        #[test]
        fn test_below_first_tier() {
            assert!(tiered_plan().daily_tier_for(GB).is_none());
        }

        #[test]
        fn test_between_second_and_third() {
            let plan = tiered_plan();
            let (level, tier) = plan.daily_tier_for(15 * GB).unwrap();
            assert_eq!(level, 2);
            assert_eq!(tier.download_kbps, 10_000);
        }

        #[test]
        fn test_threshold_is_inclusive() {
            let plan = tiered_plan();
            assert_eq!(plan.daily_tier_for(5 * GB).unwrap().0, 1);
            assert_eq!(plan.daily_tier_for(25 * GB).unwrap().0, 3);
        }

        #[test]
        fn test_most_restrictive_skips_unset_directions() {
            let rate = tiered_plan().most_restrictive_tier_rate().unwrap();
            assert_eq!(rate, RateLimit::new(2_000, 1_000));
            let bare = Plan::new(PlanId::new(2), "bare", RateLimit::new(1, 1));
            assert!(bare.most_restrictive_tier_rate().is_none());
        }

        #[test]
        fn test_cap_reached() {
            let mut plan = tiered_plan();
            assert!(!plan.cap_reached(u64::MAX, u64::MAX));
            plan.daily_quota_bytes = 30 * GB;
            assert!(!plan.cap_reached(29 * GB, 0));
            assert!(plan.cap_reached(30 * GB, 0));
            plan.monthly_quota_bytes = 200 * GB;
            assert!(plan.cap_reached(0, 200 * GB));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn test_valid_plan() {
            assert!(tiered_plan().validate().is_ok());
        }

        #[test]
        fn test_too_many_tiers() {
            let mut plan = tiered_plan();
            plan.daily_tiers.push(FupTier::new(40 * GB, 1_000, 500));
            assert!(matches!(plan.validate(), Err(PolicyError::InvalidPlan { .. })));
        }

        #[test]
        fn test_non_increasing_thresholds() {
            let mut plan = tiered_plan();
            plan.daily_tiers[2].threshold_bytes = 10 * GB;
            assert!(plan.validate().is_err());
        }

        #[test]
        fn test_zero_threshold() {
            let mut plan = tiered_plan();
            plan.monthly_tiers[0].threshold_bytes = 0;
            assert!(plan.validate().is_err());
        }

        #[test]
        fn test_zero_ratio() {
            let mut plan = tiered_plan();
            plan.time_of_day = Some(TimeOfDayRatio {
                window: TimeWindow::new(t(0, 0), t(6, 0)),
                ratio_percent: 0,
                apply_inside: true,
            });
            assert!(plan.validate().is_err());
        }
    }

    #[test]
    fn test_parse_wall_time() {
        assert_eq!(parse_wall_time("04:30").unwrap(), t(4, 30));
        assert_eq!(parse_wall_time("04:30:00").unwrap(), t(4, 30));
        assert!(parse_wall_time("25:00").is_err());
    }
}
