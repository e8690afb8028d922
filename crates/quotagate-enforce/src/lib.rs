#![warn(missing_docs)]

//! QuotaGate enforcement subsystem: turns resolved policies into NAS commands and
//! delivers them through per-device queues with circuit breaking and retries.

pub mod circuitbreaker;
pub mod command;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use command::{
    plan_command, CoaAttribute, DesiredState, EnforcementCommand, QueueKind, RateLimitCommand,
    TargetKey,
};
pub use device::{Device, DeviceStatus, DeviceVendor, NasClient, QueueParams, Reachability};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, SubmitOutcome};
pub use error::{EnforceError, Result};
pub use retry::{is_retryable, RetryPolicy};
