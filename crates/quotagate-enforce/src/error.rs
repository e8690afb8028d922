//! Error types for NAS command delivery.

use quotagate_policy::DeviceId;
use thiserror::Error;

/// Errors from NAS command delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnforceError {
    /// The device could not be reached.
    #[error("device {device} unreachable: {reason}")]
    Unreachable {
        /// Target device.
        device: DeviceId,
        /// Transport-level reason.
        reason: String,
    },

    /// A command attempt exceeded its deadline.
    #[error("command to device {device} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target device.
        device: DeviceId,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The device answered but refused the command.
    #[error("device {device} rejected command: {reason}")]
    Rejected {
        /// Target device.
        device: DeviceId,
        /// Device-supplied reason.
        reason: String,
    },

    /// The device cannot perform the requested operation.
    #[error("device {device} does not support {operation}")]
    Unsupported {
        /// Target device.
        device: DeviceId,
        /// Operation name.
        operation: &'static str,
    },

    /// No device with this id is registered.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// The dispatcher no longer accepts work.
    #[error("dispatcher is shut down")]
    ShutDown,
}

/// Result alias for enforcement operations.
pub type Result<T> = std::result::Result<T, EnforceError>;
