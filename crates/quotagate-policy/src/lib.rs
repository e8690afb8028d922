#![warn(missing_docs)]

//! QuotaGate policy subsystem: usage counters, period rollover, bandwidth override rules,
//! and the FUP policy resolver.

pub mod clock;
pub mod error;
pub mod plan;
pub mod resolver;
pub mod rollover;
pub mod rules;
pub mod types;
pub mod usage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PolicyError, Result};
pub use plan::{CdnMapping, FupTier, Plan, TimeOfDayRatio, TimeWindow};
pub use resolver::{PolicyResolver, RateSource, ResolveInput, ResolvedPolicy};
pub use rollover::{RolloverDeferral, RolloverOutcome, RolloverPolicy};
pub use rules::{ActiveRules, GlobalRule, OverrideRule, RuleRepository, RuleScope};
pub use types::{CdnId, DeviceId, PlanId, RateLimit, RuleId, SubscriberId, TrafficClass, UsageCounters};
pub use usage::{SessionCursor, SessionKey, SubscriberUsage};
