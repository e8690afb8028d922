//! Effective rate resolution.
//!
//! [`PolicyResolver::resolve`] is a pure function of the subscriber snapshot,
//! the plan, the live rules and the clock. It cannot fail: a missing CDN
//! mapping or rule simply falls back to the plan.
//!
//! Order of evaluation:
//!
//! 1. quota exemption from the CDN mapping (accounting only)
//! 2. the best live override rule for the class is the base speed
//! 3. otherwise the CDN speed limit, otherwise the plan speed
//! 4. daily and monthly FUP tiers cap the speed; the lower of the two wins
//! 5. the plan's time-of-day ratio and the best global rule compound
//! 6. a reached hard cap lowers the speed to the most restrictive tier; it never
//!    raises a speed that is already slower

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{CdnMapping, Plan};
use crate::rules::ActiveRules;
use crate::types::{CdnId, RateLimit, RuleId, TrafficClass};
use crate::usage::SubscriberUsage;

/// Where the base speed came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    /// The plan's base speed.
    Plan,
    /// A CDN mapping's speed limit.
    CdnLimit(CdnId),
    /// A subscriber override rule.
    Override(RuleId),
}

/// Everything the resolver looks at.
#[derive(Clone, Copy, Debug)]
pub struct ResolveInput<'a> {
    /// Current usage (already rolled over).
    pub usage: &'a SubscriberUsage,
    /// The subscriber's plan.
    pub plan: &'a Plan,
    /// Mapping for the class's CDN, if the class is CDN-scoped and mapped.
    pub cdn: Option<&'a CdnMapping>,
    /// Traffic class being resolved.
    pub class: TrafficClass,
    /// Live rules for the subscriber and class.
    pub rules: &'a ActiveRules,
    /// Resolution instant.
    pub now: DateTime<Utc>,
}

/// The resolved policy for one subscriber and traffic class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    /// Traffic class.
    pub class: TrafficClass,
    /// Effective speed.
    pub rate: RateLimit,
    /// False for quota-exempt CDN traffic.
    pub counts_against_quota: bool,
    /// Daily FUP level reached (0 = none).
    pub daily_fup_level: u8,
    /// Monthly FUP level reached (0 = none).
    pub monthly_fup_level: u8,
    /// A hard daily or monthly cap has been reached.
    pub quota_capped: bool,
    /// Origin of the base speed.
    pub source: RateSource,
}

/// Resolves effective rates.
#[derive(Clone, Debug)]
pub struct PolicyResolver {
    utc_offset: FixedOffset,
}

impl PolicyResolver {
    /// Creates a resolver; time-of-day windows are read in `utc_offset`.
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self { utc_offset }
    }

    /// Resolves the effective rate for `input.class`.
    pub fn resolve(&self, input: &ResolveInput<'_>) -> ResolvedPolicy {
        let plan = input.plan;
        let cdn = input
            .cdn
            .filter(|mapping| input.class.cdn() == Some(mapping.id));

        let counts_against_quota = !cdn.map_or(false, |mapping| mapping.bypass_quota);

        let (mut rate, source) = match (input.rules.top_override(), cdn) {
            (Some(rule), _) => (rule.rate, RateSource::Override(rule.id)),
            (None, Some(mapping)) => match mapping.speed_limit {
                Some(limit) => (limit, RateSource::CdnLimit(mapping.id)),
                None => (plan.base, RateSource::Plan),
            },
            (None, None) => (plan.base, RateSource::Plan),
        };

        let daily_total = input.usage.daily.total();
        let monthly_total = input.usage.monthly.total();

        let mut daily_fup_level = 0;
        if let Some((level, tier)) = plan.daily_tier_for(daily_total) {
            daily_fup_level = level;
            rate = rate.min_per_direction(tier.rate());
        }
        let mut monthly_fup_level = 0;
        if let Some((level, tier)) = plan.monthly_tier_for(monthly_total) {
            monthly_fup_level = level;
            rate = rate.min_per_direction(tier.rate());
        }

        let local_time = input.now.with_timezone(&self.utc_offset).time();
        if let Some(pct) = plan.time_of_day.as_ref().and_then(|tod| tod.ratio_at(local_time)) {
            rate = rate.scale_percent(pct);
        }
        if let Some(global) = input.rules.globals.iter().find(|g| g.covers_plan(plan.id)) {
            rate = rate.scale_percent(global.multiplier_percent);
        }

        let quota_capped = plan.cap_reached(daily_total, monthly_total);
        if quota_capped {
            if let Some(cap) = plan.most_restrictive_tier_rate() {
                rate = rate.min_per_direction(cap);
            }
        }

        ResolvedPolicy {
            class: input.class,
            rate,
            counts_against_quota,
            daily_fup_level,
            monthly_fup_level,
            quota_capped,
            source,
        }
    }
}
