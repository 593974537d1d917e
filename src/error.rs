//! Custom error types for the synthesis controller.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the control loop and the
//! optimization engine.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`InvalidParameter`**: An experiment parameter was outside its declared
//!   bound. Recoverable: the caller corrects the input and retries. The
//!   controller never clamps silently; out-of-bound values are rejected at
//!   the boundary.
//! - **`InvalidTransition`**: An illegal lifecycle call (e.g. `start()` while
//!   already running). Recoverable: the caller checks `status()` first. State
//!   is left unchanged.
//! - **`DeviceUnavailable`**: An external device call failed or the device
//!   reports disconnected. The controller halts actuation and enters the
//!   error state rather than continuing to actuate blind.
//! - **`SafetyViolation`**: The measured temperature exceeded the setpoint
//!   plus the configured safety margin. Fatal to the current run; requires an
//!   explicit `acknowledge()` before the rig can be used again.
//! - **`InsufficientData`**: The optimizer has no history and cold-start
//!   sampling is disabled. Recoverable by supplying a manual parameter set.
//!
//! By using `#[from]`, `LabError` can be seamlessly created from underlying
//! error types, simplifying error handling with the `?` operator.

use thiserror::Error;

use crate::state::ExperimentStatus;

/// Convenience alias for results using the application error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Top-level error type for the synthesis controller.
#[derive(Error, Debug)]
pub enum LabError {
    /// Configuration file or environment parsing failure.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// An experiment parameter was outside its declared bound.
    #[error("Invalid parameter '{field}': {value} is outside [{min}, {max}]")]
    InvalidParameter {
        /// Name of the offending parameter field.
        field: &'static str,
        /// The rejected value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound (inclusive).
        max: f64,
    },

    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("Invalid transition: cannot {action} while {from}")]
    InvalidTransition {
        /// The state the rig was in when the operation was rejected.
        from: ExperimentStatus,
        /// The rejected operation, as a verb ("start", "configure", ...).
        action: &'static str,
    },

    /// An external device call failed or the device reports disconnected.
    #[error("Device unavailable: {device}")]
    DeviceUnavailable {
        /// Human-readable device name.
        device: String,
    },

    /// Measured temperature exceeded the setpoint plus the safety margin.
    #[error("Safety violation: measured {measured_c:.1}\u{b0}C exceeds limit {limit_c:.1}\u{b0}C")]
    SafetyViolation {
        /// The offending measured temperature.
        measured_c: f64,
        /// The limit that was exceeded (setpoint + safety margin).
        limit_c: f64,
    },

    /// The optimizer has no history and cold-start sampling is disabled.
    #[error("Insufficient data: history is empty and cold-start sampling is disabled")]
    InsufficientData,

    /// The supervisor task has shut down and can no longer answer requests.
    #[error("Supervisor is no longer running")]
    SupervisorGone,
}
