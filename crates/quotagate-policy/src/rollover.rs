//! Lazy daily/monthly period rollover.
//!
//! There is no global reset sweep. Every path that touches a subscriber calls
//! [`RolloverPolicy::apply`] first, which zeroes whichever horizon has crossed
//! its boundary since the last recorded reset. A subscriber that is never
//! touched simply rolls over late; the change is visible on the next read.
//!
//! Rollover never resets early: a missing reset time or a reset timestamp in
//! the future defers the reset and reports why.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde::Serialize;

use crate::error::{PolicyError, Result};
use crate::usage::SubscriberUsage;

/// Accounting horizon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    /// Calendar day in the configured timezone.
    Daily,
    /// Billing month, driven by plan renewal.
    Monthly,
}

/// Why a reset that might be due was not performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RolloverDeferral {
    /// No daily reset time is configured.
    MissingResetTime,
    /// The recorded reset timestamp is ahead of the clock.
    ClockSkew {
        /// Horizon whose timestamp is ahead.
        horizon: Horizon,
    },
}

/// What a rollover check did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloverOutcome {
    /// Daily counters and level were zeroed.
    pub daily_reset: bool,
    /// Monthly counters and level were zeroed.
    pub monthly_reset: bool,
    /// Resets that were deferred.
    pub deferrals: Vec<RolloverDeferral>,
}

impl RolloverOutcome {
    /// True if any horizon was reset.
    pub fn any_reset(&self) -> bool {
        self.daily_reset || self.monthly_reset
    }
}

/// Decides when a subscriber's counters roll over.
#[derive(Clone, Debug)]
pub struct RolloverPolicy {
    daily_reset_time: Option<NaiveTime>,
    utc_offset: FixedOffset,
}

impl RolloverPolicy {
    /// Creates a policy. `utc_offset` is the process-wide timezone preference.
    pub fn new(daily_reset_time: Option<NaiveTime>, utc_offset: FixedOffset) -> Self {
        Self {
            daily_reset_time,
            utc_offset,
        }
    }

    /// The configured daily reset time, if any.
    pub fn daily_reset_time(&self) -> Option<NaiveTime> {
        self.daily_reset_time
    }

    /// The timezone preference.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Most recent daily boundary at or before `now`.
    pub fn current_daily_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let reset = self.daily_reset_time?;
        let local = now.with_timezone(&self.utc_offset);
        let today = local.date_naive();
        let candidate = today
            .and_time(reset)
            .and_local_timezone(self.utc_offset)
            .single()?;
        let boundary = if candidate <= local {
            candidate
        } else {
            today
                .pred_opt()?
                .and_time(reset)
                .and_local_timezone(self.utc_offset)
                .single()?
        };
        Some(boundary.with_timezone(&Utc))
    }

    /// First daily boundary strictly after `now`.
    pub fn next_daily_boundary(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.current_daily_boundary(now)
            .map(|b| b + Duration::days(1))
    }

    /// Zeroes any horizon whose period has ended.
    ///
    /// Bypass bytes and session cursors are left alone; they are session-scoped.
    pub fn apply(
        &self,
        usage: &mut SubscriberUsage,
        renewal_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RolloverOutcome {
        let mut outcome = RolloverOutcome::default();
        self.apply_daily(usage, now, &mut outcome);
        apply_monthly(usage, renewal_at, now, &mut outcome);
        outcome
    }

    fn apply_daily(&self, usage: &mut SubscriberUsage, now: DateTime<Utc>, outcome: &mut RolloverOutcome) {
        let Some(boundary) = self.current_daily_boundary(now) else {
            outcome.deferrals.push(RolloverDeferral::MissingResetTime);
            return;
        };
        match usage.last_daily_reset {
            None => usage.last_daily_reset = Some(boundary),
            Some(last) if last > now => outcome.deferrals.push(RolloverDeferral::ClockSkew {
                horizon: Horizon::Daily,
            }),
            Some(last) if last < boundary => {
                usage.daily.clear();
                usage.daily_fup_level = 0;
                usage.last_daily_reset = Some(now);
                outcome.daily_reset = true;
                tracing::debug!(%boundary, "daily counters rolled over");
            }
            Some(_) => {}
        }
    }
}

fn apply_monthly(
    usage: &mut SubscriberUsage,
    renewal_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    outcome: &mut RolloverOutcome,
) {
    let Some(renewal) = renewal_at else {
        return;
    };
    if renewal > now {
        return;
    }
    match usage.last_monthly_reset {
        None => usage.last_monthly_reset = Some(renewal),
        Some(last) if last > now => outcome.deferrals.push(RolloverDeferral::ClockSkew {
            horizon: Horizon::Monthly,
        }),
        Some(last) if renewal > last => {
            usage.monthly.clear();
            usage.monthly_fup_level = 0;
            usage.last_monthly_reset = Some(now);
            outcome.monthly_reset = true;
            tracing::debug!(%renewal, "monthly counters rolled over");
        }
        Some(_) => {}
    }
}

/// Parses a UTC offset such as `+03:00`, `-0530`, `Z` or `UTC`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset> {
    let trimmed = match value.trim() {
        alias if alias.eq_ignore_ascii_case("utc") || alias.eq_ignore_ascii_case("z") => "+00:00",
        offset => offset,
    };
    trimmed.parse::<FixedOffset>().map_err(|e| PolicyError::InvalidTime {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
