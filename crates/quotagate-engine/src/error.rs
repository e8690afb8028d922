//! Error types for the engine.

use quotagate_policy::{PlanId, PolicyError, SubscriberId};
use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An accounting event failed validation.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// What was wrong.
        reason: String,
    },

    /// The event names a subscriber the store does not know.
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),

    /// The subscriber's plan is not in the catalog.
    #[error("subscriber {subscriber} references missing plan {plan}")]
    MissingPlan {
        /// Subscriber.
        subscriber: SubscriberId,
        /// Plan that was not found.
        plan: PlanId,
    },

    /// The subscriber store failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration or catalog.
    #[error("configuration error: {0}")]
    Config(String),

    /// The engine is not accepting work.
    #[error("engine is shut down")]
    ShutDown,

    /// Policy-layer error.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
