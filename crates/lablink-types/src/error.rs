use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::MoveMode;

/// Workspace-wide error type covering validation rejections, hardware faults
/// and routing failures.
///
/// Validation variants (`InvalidChannel`, `InvalidMode`, `OutOfRange`,
/// `InvalidArguments`, `InvalidPlan`) are raised synchronously to the caller
/// and never retried. `Backend` is the only transient variant.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabError {
    #[error("Invalid channel {channel}: device has {count} channel(s)")]
    InvalidChannel { channel: i64, count: usize },

    #[error("Invalid mode: channel {channel} is in {actual} mode, command assumed {supplied}")]
    InvalidMode {
        channel: usize,
        actual: MoveMode,
        supplied: MoveMode,
    },

    #[error("Out of range: {quantity} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        quantity: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Backend fault on {component}: {details}")]
    Backend { component: String, details: String },

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{device}' has no handler '{method}'")]
    UnknownMethod { device: String, method: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid measurement plan: {0}")]
    InvalidPlan(String),

    #[error("Device '{0}' is already registered")]
    DuplicateDevice(String),

    #[error("Device '{device}' is busy: {reason}")]
    Busy { device: String, reason: String },

    #[error("Device '{0}' cannot route a call to itself")]
    SelfCall(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("I/O Error: {0}")]
    Io(String),
}

impl LabError {
    /// Shorthand for a [`LabError::Backend`] fault.
    pub fn backend(component: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Backend {
            component: component.into(),
            details: details.into(),
        }
    }

    /// Shorthand for a [`LabError::OutOfRange`] rejection.
    pub fn out_of_range(quantity: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            quantity: quantity.into(),
            value,
            min,
            max,
        }
    }

    /// `true` for errors a retry might clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Resolve a caller-supplied channel index against a device's channel count.
///
/// Indices are accepted as signed integers because they arrive from untyped
/// call arguments; anything outside `[0, count)` is rejected, never coerced.
pub fn check_channel(channel: i64, count: usize) -> Result<usize, LabError> {
    usize::try_from(channel)
        .ok()
        .filter(|&idx| idx < count)
        .ok_or(LabError::InvalidChannel { channel, count })
}

/// Reject `value` unless it lies within `[min, max]`.
pub fn check_range(quantity: &str, value: f64, min: f64, max: f64) -> Result<f64, LabError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(LabError::out_of_range(quantity, value, min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_channel_rejects_negative_and_past_end() {
        assert_eq!(check_channel(0, 3), Ok(0));
        assert_eq!(check_channel(2, 3), Ok(2));
        assert_eq!(
            check_channel(3, 3),
            Err(LabError::InvalidChannel { channel: 3, count: 3 })
        );
        assert_eq!(
            check_channel(-1, 3),
            Err(LabError::InvalidChannel { channel: -1, count: 3 })
        );
        assert!(check_channel(0, 0).is_err());
    }

    #[test]
    fn check_range_rejects_nan() {
        assert!(check_range("frequency", f64::NAN, 0.0, 1.0).is_err());
        assert!(check_range("frequency", 1.5, 0.0, 1.0).is_err());
        assert_eq!(check_range("frequency", 1.0, 0.0, 1.0), Ok(1.0));
    }

    #[test]
    fn error_display() {
        let err = LabError::InvalidMode {
            channel: 1,
            actual: MoveMode::ClosedLoop,
            supplied: MoveMode::Scan,
        };
        let text = err.to_string();
        assert!(text.contains("closed-loop"));
        assert!(text.contains("scan"));

        let err = LabError::backend("smaract", "timeout");
        assert!(err.to_string().contains("Backend fault on smaract"));
        assert!(err.is_transient());
        assert!(!LabError::UnknownDevice("x".into()).is_transient());
    }

    #[test]
    fn error_roundtrip() {
        let err = LabError::out_of_range("offset", 2e7, -1e7, 1e7);
        let json = serde_json::to_string(&err).unwrap();
        let back: LabError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
