//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    events_received: AtomicU64,
    events_applied: AtomicU64,
    events_dropped: AtomicU64,
    zero_delta_events: AtomicU64,
    out_of_order_events: AtomicU64,
    counter_resets: AtomicU64,
    resyncs: AtomicU64,
    sessions_pruned: AtomicU64,
    daily_rollovers: AtomicU64,
    monthly_rollovers: AtomicU64,
    rollover_deferrals: AtomicU64,
    reevaluations: AtomicU64,
    missing_plans: AtomicU64,
    policies_emitted: AtomicU64,
    policies_unchanged: AtomicU64,
    enforcement_errors: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Records accepted by `submit`.
    pub events_received: u64,
    /// Records ingested.
    pub events_applied: u64,
    /// Records dropped as malformed, unknown or unstorable.
    pub events_dropped: u64,
    /// Ingested records that credited nothing.
    pub zero_delta_events: u64,
    /// Records older than their stream's cursor.
    pub out_of_order_events: u64,
    /// Counter restarts detected.
    pub counter_resets: u64,
    /// Stale streams resynchronised.
    pub resyncs: u64,
    /// Idle stream cursors dropped without a stop record.
    pub sessions_pruned: u64,
    /// Daily horizons zeroed.
    pub daily_rollovers: u64,
    /// Monthly horizons zeroed.
    pub monthly_rollovers: u64,
    /// Rollovers held back by skew or missing configuration.
    pub rollover_deferrals: u64,
    /// Re-evaluations processed.
    pub reevaluations: u64,
    /// Subscribers whose plan was not in the catalog.
    pub missing_plans: u64,
    /// Desired states queued for devices.
    pub policies_emitted: u64,
    /// Desired states the device already had.
    pub policies_unchanged: u64,
    /// Desired states the dispatcher refused.
    pub enforcement_errors: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    event_received => events_received,
    event_applied => events_applied,
    event_dropped => events_dropped,
    zero_delta => zero_delta_events,
    out_of_order => out_of_order_events,
    counter_reset => counter_resets,
    resync => resyncs,
    session_pruned => sessions_pruned,
    daily_rollover => daily_rollovers,
    monthly_rollover => monthly_rollovers,
    rollover_deferral => rollover_deferrals,
    reevaluation => reevaluations,
    missing_plan => missing_plans,
    policy_emitted => policies_emitted,
    policy_unchanged => policies_unchanged,
    enforcement_error => enforcement_errors,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            events_received: get(&self.events_received),
            events_applied: get(&self.events_applied),
            events_dropped: get(&self.events_dropped),
            zero_delta_events: get(&self.zero_delta_events),
            out_of_order_events: get(&self.out_of_order_events),
            counter_resets: get(&self.counter_resets),
            resyncs: get(&self.resyncs),
            sessions_pruned: get(&self.sessions_pruned),
            daily_rollovers: get(&self.daily_rollovers),
            monthly_rollovers: get(&self.monthly_rollovers),
            rollover_deferrals: get(&self.rollover_deferrals),
            reevaluations: get(&self.reevaluations),
            missing_plans: get(&self.missing_plans),
            policies_emitted: get(&self.policies_emitted),
            policies_unchanged: get(&self.policies_unchanged),
            enforcement_errors: get(&self.enforcement_errors),
        }
    }
}
