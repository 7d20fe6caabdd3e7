//! Error taxonomy reported back to the control surfaces

use serde::Serialize;
use thiserror::Error;

/// Typed failure returned to whichever surface submitted a command.
///
/// Every variant is recoverable: the process keeps running and the surface
/// renders its own feedback. Only a camera-open failure at startup is fatal,
/// and that one never reaches a surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("busy: another operation of this kind is in flight")]
    Busy,

    #[error("stale write: expected version {expected}, current version is {current}")]
    StaleWrite { expected: u64, current: u64 },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O fault: {0}")]
    IoFault(String),

    #[error("external command `{command}` failed: {reason}")]
    ExternalCommandFault { command: String, reason: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("camera controller is not running")]
    Unavailable,
}

impl ControlError {
    /// Stable machine-readable name used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::HardwareFault(_) => "hardware_fault",
            ControlError::Busy => "busy",
            ControlError::StaleWrite { .. } => "stale_write",
            ControlError::Timeout(_) => "timeout",
            ControlError::IoFault(_) => "io_fault",
            ControlError::ExternalCommandFault { .. } => "external_command_fault",
            ControlError::InvalidValue(_) => "invalid_value",
            ControlError::NotFound(_) => "not_found",
            ControlError::Unavailable => "unavailable",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            current_version: match self {
                ControlError::StaleWrite { current, .. } => Some(*current),
                _ => None,
            },
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ControlError::NotFound(err.to_string()),
            _ => ControlError::IoFault(err.to_string()),
        }
    }
}

/// JSON shape of a failed command
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err: ControlError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), "not_found");

        let err: ControlError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert_eq!(err.kind(), "io_fault");
    }

    #[test]
    fn test_stale_body_carries_current_version() {
        let body = ControlError::StaleWrite { expected: 2, current: 5 }.to_body();
        assert_eq!(body.error, "stale_write");
        assert_eq!(body.current_version, Some(5));

        let json = serde_json::to_value(ControlError::Busy.to_body()).unwrap();
        assert!(json.get("current_version").is_none());
    }
}
