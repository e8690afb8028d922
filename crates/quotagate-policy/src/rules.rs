//! Bandwidth override rules and network-wide boost rules.
//!
//! Rules are never deleted on expiry. Every lookup evaluates `enabled` and
//! `expires_at` against the caller's clock, so an expired rule simply stops
//! being returned. Only an explicit [`RuleRepository::remove_override`] or
//! [`RuleRepository::remove_global`] takes a rule out of the repository.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc, Weekday};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::RwLock;

use crate::error::{PolicyError, Result};
use crate::plan::TimeWindow;
use crate::types::{CdnId, PlanId, RateLimit, RuleId, SubscriberId, TrafficClass};

/// Traffic an override rule applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// General internet traffic.
    Internet,
    /// Traffic to one CDN.
    Cdn(CdnId),
}

impl RuleScope {
    /// Returns true if the scope covers `class`.
    pub fn covers(&self, class: TrafficClass) -> bool {
        match (self, class) {
            (RuleScope::Internet, TrafficClass::Internet) => true,
            (RuleScope::Cdn(rule_cdn), TrafficClass::Cdn(cdn)) => *rule_cdn == cdn,
            _ => false,
        }
    }
}

/// A per-subscriber speed override.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Rule identifier.
    pub id: RuleId,
    /// Subscriber the rule belongs to.
    pub subscriber: SubscriberId,
    /// Traffic the rule applies to.
    pub scope: RuleScope,
    /// Disabled rules are kept but never selected.
    pub enabled: bool,
    /// The explicit speed.
    pub rate: RateLimit,
    /// Higher wins among rules of the same scope.
    #[serde(default)]
    pub priority: i32,
    /// Creation time; breaks priority ties (newest wins).
    pub created_at: DateTime<Utc>,
    /// Expiry; `None` is permanent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OverrideRule {
    /// Enabled and not yet expired at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled && not_expired(self.expires_at, now)
    }

    /// Display-only time left before expiry; zero once expired, `None` if permanent.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        time_remaining(self.expires_at, now)
    }
}

/// A network-wide speed multiplier, optionally scheduled and scoped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRule {
    /// Rule identifier.
    pub id: RuleId,
    /// Display name.
    pub name: String,
    /// Disabled rules are kept but never selected.
    pub enabled: bool,
    /// When set, `days` and `window` decide activation; otherwise the rule is
    /// live whenever it is enabled.
    #[serde(default)]
    pub auto_apply: bool,
    /// Local time window.
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Local weekdays; empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    /// Speed percentage (100 = unchanged).
    pub multiplier_percent: u32,
    /// Plans the rule is limited to; empty means all.
    #[serde(default)]
    pub plans: Vec<PlanId>,
    /// CDNs the rule is limited to; empty means all traffic classes.
    #[serde(default)]
    pub cdns: Vec<CdnId>,
    /// Higher wins when several rules apply.
    #[serde(default)]
    pub priority: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry; `None` is permanent.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GlobalRule {
    /// Enabled, unexpired, and inside its schedule at local time `local`.
    pub fn is_active(&self, now: DateTime<Utc>, local: DateTime<FixedOffset>) -> bool {
        if !self.enabled || !not_expired(self.expires_at, now) {
            return false;
        }
        if !self.auto_apply {
            return true;
        }
        let day_ok = self.days.is_empty() || self.days.contains(&local.weekday());
        let window_ok = self.window.map_or(true, |w| w.contains(local.time()));
        day_ok && window_ok
    }

    /// Returns true if the rule's CDN scoping covers `class`.
    pub fn covers_class(&self, class: TrafficClass) -> bool {
        if self.cdns.is_empty() {
            return true;
        }
        class.cdn().map_or(false, |cdn| self.cdns.contains(&cdn))
    }

    /// Returns true if the rule's plan scoping covers `plan`.
    pub fn covers_plan(&self, plan: PlanId) -> bool {
        self.plans.is_empty() || self.plans.contains(&plan)
    }

    /// Display-only time left before expiry.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        time_remaining(self.expires_at, now)
    }
}

fn not_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(true, |at| now < at)
}

fn time_remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    expires_at.map(|at| (at - now).max(Duration::zero()))
}

fn by_precedence(
    a: (i32, DateTime<Utc>, RuleId),
    b: (i32, DateTime<Utc>, RuleId),
) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| b.2.cmp(&a.2))
}

/// Rules that are live for one subscriber and traffic class, best first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveRules {
    /// Override rules, highest priority first, newest first on ties.
    pub overrides: Vec<OverrideRule>,
    /// Global rules, highest priority first.
    pub globals: Vec<GlobalRule>,
}

impl ActiveRules {
    /// The winning override, if any.
    pub fn top_override(&self) -> Option<&OverrideRule> {
        self.overrides.first()
    }
}

/// Holds subscriber-scoped and global rules.
pub struct RuleRepository {
    overrides: DashMap<SubscriberId, Vec<OverrideRule>>,
    override_owner: DashMap<RuleId, SubscriberId>,
    globals: RwLock<Vec<GlobalRule>>,
    utc_offset: FixedOffset,
}

impl RuleRepository {
    /// Creates an empty repository. Global schedules are read in `utc_offset`.
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            overrides: DashMap::new(),
            override_owner: DashMap::new(),
            globals: RwLock::new(Vec::new()),
            utc_offset,
        }
    }

    /// Registers a subscriber override.
    pub fn add_override(&self, rule: OverrideRule) -> Result<()> {
        if self.override_owner.contains_key(&rule.id) {
            return Err(PolicyError::DuplicateRule(rule.id));
        }
        tracing::debug!(rule = %rule.id, subscriber = %rule.subscriber, "override rule added");
        self.override_owner.insert(rule.id, rule.subscriber);
        self.overrides.entry(rule.subscriber).or_default().push(rule);
        Ok(())
    }

    /// Deletes a subscriber override.
    pub fn remove_override(&self, id: RuleId) -> Result<OverrideRule> {
        let (_, subscriber) = self
            .override_owner
            .remove(&id)
            .ok_or(PolicyError::RuleNotFound(id))?;
        let mut rules = self
            .overrides
            .get_mut(&subscriber)
            .ok_or(PolicyError::RuleNotFound(id))?;
        let idx = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(PolicyError::RuleNotFound(id))?;
        Ok(rules.remove(idx))
    }

    /// Flips an override's enabled flag.
    pub fn set_override_enabled(&self, id: RuleId, enabled: bool) -> Result<()> {
        let subscriber = *self
            .override_owner
            .get(&id)
            .ok_or(PolicyError::RuleNotFound(id))?;
        let mut rules = self
            .overrides
            .get_mut(&subscriber)
            .ok_or(PolicyError::RuleNotFound(id))?;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(PolicyError::RuleNotFound(id))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// Every override registered for `subscriber`, live or not.
    pub fn overrides_for(&self, subscriber: SubscriberId) -> Vec<OverrideRule> {
        self.overrides
            .get(&subscriber)
            .map(|rules| rules.clone())
            .unwrap_or_default()
    }

    /// Registers a global rule.
    pub fn add_global(&self, rule: GlobalRule) -> Result<()> {
        if rule.multiplier_percent == 0 {
            return Err(PolicyError::InvalidRule {
                rule: rule.id,
                reason: "multiplier must be greater than zero".to_string(),
            });
        }
        let mut globals = self.globals.write().unwrap_or_else(|e| e.into_inner());
        if globals.iter().any(|g| g.id == rule.id) {
            return Err(PolicyError::DuplicateRule(rule.id));
        }
        globals.push(rule);
        Ok(())
    }

    /// Deletes a global rule.
    pub fn remove_global(&self, id: RuleId) -> Result<GlobalRule> {
        let mut globals = self.globals.write().unwrap_or_else(|e| e.into_inner());
        let idx = globals
            .iter()
            .position(|g| g.id == id)
            .ok_or(PolicyError::RuleNotFound(id))?;
        Ok(globals.remove(idx))
    }

    /// Every global rule, live or not.
    pub fn globals(&self) -> Vec<GlobalRule> {
        self.globals.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rules live for `subscriber` and `class` at `now`, ordered best first.
    pub fn active_rules_for(
        &self,
        subscriber: SubscriberId,
        class: TrafficClass,
        now: DateTime<Utc>,
    ) -> ActiveRules {
        let mut overrides: Vec<OverrideRule> = self
            .overrides
            .get(&subscriber)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.scope.covers(class) && r.is_active(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        overrides.sort_by(|a, b| {
            by_precedence((a.priority, a.created_at, a.id), (b.priority, b.created_at, b.id))
        });

        let local = now.with_timezone(&self.utc_offset);
        let mut globals: Vec<GlobalRule> = self
            .globals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|g| g.covers_class(class) && g.is_active(now, local))
            .cloned()
            .collect();
        globals.sort_by(|a, b| {
            by_precedence((a.priority, a.created_at, a.id), (b.priority, b.created_at, b.id))
        });

        ActiveRules { overrides, globals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        // 2024-06-03 is a Monday.
        Utc.with_ymd_and_hms(2024, 6, d, h, 0, 0).unwrap()
    }

    fn repo() -> RuleRepository {
        RuleRepository::new(FixedOffset::east_opt(0).unwrap())
    }

    fn override_rule(id: u64, priority: i32, created: DateTime<Utc>) -> OverrideRule {
        OverrideRule {
            id: RuleId::new(id),
            subscriber: SubscriberId::new(1),
            scope: RuleScope::Internet,
            enabled: true,
            rate: RateLimit::new(id * 1_000, id * 100),
            priority,
            created_at: created,
            expires_at: None,
        }
    }

    fn global_rule(id: u64, multiplier: u32) -> GlobalRule {
        GlobalRule {
            id: RuleId::new(id),
            name: format!("boost-{}", id),
            enabled: true,
            auto_apply: true,
            window: None,
            days: Vec::new(),
            multiplier_percent: multiplier,
            plans: Vec::new(),
            cdns: Vec::new(),
            priority: 0,
            created_at: utc(1, 0),
            expires_at: None,
        }
    }

    mod overrides {
        use super::*;

        #[test]
        fn test_priority_descending() {
            let repo = repo();
            repo.add_override(override_rule(1, 5, utc(1, 0))).unwrap();
            repo.add_override(override_rule(2, 10, utc(1, 0))).unwrap();
            let active = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(3, 0));
            assert_eq!(active.top_override().unwrap().id, RuleId::new(2));
            assert_eq!(active.overrides.len(), 2);
        }

        #[test]
        fn test_priority_tie_newest_wins() {
            let repo = repo();
            repo.add_override(override_rule(1, 5, utc(2, 0))).unwrap();
            repo.add_override(override_rule(2, 5, utc(1, 0))).unwrap();
            let active = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(3, 0));
            assert_eq!(active.top_override().unwrap().id, RuleId::new(1));
        }

        #[test]
        fn test_expired_rule_never_selected() {
            let repo = repo();
            let mut expired = override_rule(1, 10, utc(1, 0));
            expired.expires_at = Some(utc(2, 0));
            repo.add_override(expired).unwrap();
            repo.add_override(override_rule(2, 5, utc(1, 0))).unwrap();

            let before = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(1, 12));
            assert_eq!(before.top_override().unwrap().id, RuleId::new(1));

            let after = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(2, 0));
            assert_eq!(after.top_override().unwrap().id, RuleId::new(2));
            // Expired rules stay in the repository.
            assert_eq!(repo.overrides_for(SubscriberId::new(1)).len(), 2);
        }

        #[test]
        fn test_disabled_rule_skipped() {
            let repo = repo();
            repo.add_override(override_rule(1, 10, utc(1, 0))).unwrap();
            repo.set_override_enabled(RuleId::new(1), false).unwrap();
            let active = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(3, 0));
            assert!(active.top_override().is_none());
        }

        #[test]
        fn test_scope_filtering() {
            let repo = repo();
            let mut cdn_rule = override_rule(1, 10, utc(1, 0));
            cdn_rule.scope = RuleScope::Cdn(CdnId::new(9));
            repo.add_override(cdn_rule).unwrap();

            let internet = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(3, 0));
            assert!(internet.overrides.is_empty());
            let cdn = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Cdn(CdnId::new(9)), utc(3, 0));
            assert_eq!(cdn.overrides.len(), 1);
            let other = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Cdn(CdnId::new(8)), utc(3, 0));
            assert!(other.overrides.is_empty());
        }

        #[test]
        fn test_duplicate_and_remove() {
            let repo = repo();
            repo.add_override(override_rule(1, 0, utc(1, 0))).unwrap();
            assert!(matches!(
                repo.add_override(override_rule(1, 0, utc(1, 0))),
                Err(PolicyError::DuplicateRule(_))
            ));
            let removed = repo.remove_override(RuleId::new(1)).unwrap();
            assert_eq!(removed.id, RuleId::new(1));
            assert!(matches!(
                repo.remove_override(RuleId::new(1)),
                Err(PolicyError::RuleNotFound(_))
            ));
            assert!(repo.overrides_for(SubscriberId::new(1)).is_empty());
        }

        #[test]
        fn test_time_remaining() {
            let mut rule = override_rule(1, 0, utc(1, 0));
            assert!(rule.time_remaining(utc(1, 0)).is_none());
            rule.expires_at = Some(utc(1, 6));
            assert_eq!(rule.time_remaining(utc(1, 2)), Some(Duration::hours(4)));
            assert_eq!(rule.time_remaining(utc(2, 0)), Some(Duration::zero()));
        }
    }

    mod globals {
        use super::*;

        #[test]
        fn test_schedule_days_and_window() {
            let mut rule = global_rule(1, 200);
            rule.days = vec![Weekday::Sat, Weekday::Sun];
            rule.window = Some(TimeWindow::new(
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            ));
            let offset = FixedOffset::east_opt(0).unwrap();
            // Saturday 2024-06-08
            let sat_night = utc(8, 2);
            assert!(rule.is_active(sat_night, sat_night.with_timezone(&offset)));
            let sat_noon = utc(8, 12);
            assert!(!rule.is_active(sat_noon, sat_noon.with_timezone(&offset)));
            let mon_night = utc(3, 2);
            assert!(!rule.is_active(mon_night, mon_night.with_timezone(&offset)));
        }

        #[test]
        fn test_manual_rule_ignores_schedule() {
            let mut rule = global_rule(1, 200);
            rule.auto_apply = false;
            rule.days = vec![Weekday::Sun];
            let offset = FixedOffset::east_opt(0).unwrap();
            let mon = utc(3, 12);
            assert!(rule.is_active(mon, mon.with_timezone(&offset)));
            rule.enabled = false;
            assert!(!rule.is_active(mon, mon.with_timezone(&offset)));
        }

        #[test]
        fn test_cdn_scoping() {
            let mut rule = global_rule(1, 150);
            assert!(rule.covers_class(TrafficClass::Internet));
            rule.cdns = vec![CdnId::new(2)];
            assert!(!rule.covers_class(TrafficClass::Internet));
            assert!(rule.covers_class(TrafficClass::Cdn(CdnId::new(2))));
            assert!(!rule.covers_class(TrafficClass::Cdn(CdnId::new(3))));
        }

        #[test]
        fn test_plan_scoping() {
            let mut rule = global_rule(1, 150);
            assert!(rule.covers_plan(PlanId::new(7)));
            rule.plans = vec![PlanId::new(1)];
            assert!(!rule.covers_plan(PlanId::new(7)));
        }

        #[test]
        fn test_zero_multiplier_rejected() {
            let repo = repo();
            assert!(matches!(
                repo.add_global(global_rule(1, 0)),
                Err(PolicyError::InvalidRule { .. })
            ));
        }

        #[test]
        fn test_active_globals_sorted_and_filtered() {
            let repo = repo();
            let mut low = global_rule(1, 150);
            low.priority = 1;
            let mut high = global_rule(2, 300);
            high.priority = 9;
            let mut expired = global_rule(3, 500);
            expired.priority = 20;
            expired.expires_at = Some(utc(2, 0));
            repo.add_global(low).unwrap();
            repo.add_global(high).unwrap();
            repo.add_global(expired).unwrap();

            let active = repo.active_rules_for(SubscriberId::new(1), TrafficClass::Internet, utc(3, 0));
            let ids: Vec<RuleId> = active.globals.iter().map(|g| g.id).collect();
            assert_eq!(ids, vec![RuleId::new(2), RuleId::new(1)]);
            assert_eq!(repo.globals().len(), 3);
            repo.remove_global(RuleId::new(3)).unwrap();
            assert_eq!(repo.globals().len(), 2);
        }
    }
}
