//! Failure kinds surfaced by the control core.
//!
//! None of these are fatal: each one degrades to "skip this cycle" or
//! "reject this request".

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// A sensor could not be read; the affected field becomes undefined.
    #[error("sensor read failed: {0}")]
    SensorRead(String),

    /// The relay command was not applied; the previous pump state stands.
    #[error("pump command failed: {0}")]
    ActuatorCommand(String),

    /// An inbound telemetry payload could not be understood and was dropped.
    #[error("malformed telemetry: {0}")]
    MalformedTelemetry(String),

    /// The requested action is not valid in the current mode.
    #[error("invalid action")]
    InvalidAction,

    /// The requested mode is neither `auto` nor `manual`.
    #[error("invalid mode value '{0}'")]
    InvalidModeValue(String),
}

impl ControlError {
    /// Whether the failure is the caller's fault (a rejected request) rather
    /// than a transient hardware or transport problem.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::InvalidAction | Self::InvalidModeValue(_))
    }
}
