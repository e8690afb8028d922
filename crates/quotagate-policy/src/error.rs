//! Error types for the policy subsystem.

use thiserror::Error;

use crate::types::{PlanId, RuleId};

/// Errors raised while validating plans and rules.
///
/// Resolution itself never fails; these only surface when an administrator
/// hands the engine an inconsistent definition.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A plan definition breaks one of its structural invariants.
    #[error("invalid plan {plan}: {reason}")]
    InvalidPlan {
        /// The offending plan.
        plan: PlanId,
        /// What is wrong with it.
        reason: String,
    },

    /// A rule definition is unusable.
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule {
        /// The offending rule.
        rule: RuleId,
        /// What is wrong with it.
        reason: String,
    },

    /// A rule with the same id is already registered.
    #[error("rule {0} already exists")]
    DuplicateRule(RuleId),

    /// The referenced rule does not exist.
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    /// A wall-clock time or offset string could not be parsed.
    #[error("invalid time specification {value:?}: {reason}")]
    InvalidTime {
        /// The raw input.
        value: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
