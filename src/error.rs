//! Error types for the PS02 client.
//!
//! One enum, [`SensorError`], covers every failure the crate can surface:
//!
//! - **Discovery**: [`SensorError::DeviceNotFound`] after a scan window
//!   elapses with no matching device.
//! - **Connection**: [`SensorError::ConnectionFailed`] when a transport
//!   cannot be opened, [`SensorError::LinkClosed`] when an open channel shuts
//!   down under us, [`SensorError::LinkLost`] when an active session dies.
//! - **Protocol**: [`SensorError::Timeout`] for bounded reads that saw no
//!   data, [`SensorError::MalformedFrame`] for undecodable lines (per-line,
//!   non-fatal; absorbed into counters while measuring).
//! - **Usage**: [`SensorError::InvalidGain`] and [`SensorError::InvalidState`]
//!   reject bad commands before anything is written to the device.
//!
//! Sequence gaps are deliberately *not* an error: they are advisory and
//! reported as [`crate::types::SensorEvent::SequenceGap`] on the event feed.

use std::time::Duration;

use thiserror::Error;

use crate::types::MeasurementState;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, SensorError>;

#[derive(Error, Debug)]
pub enum SensorError {
    /// No device matched the scan filter within the scan window.
    #[error("no matching device found within {0:?}")]
    DeviceNotFound(Duration),

    /// A transport could not be opened or validated.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The underlying channel disconnected while a read or write was pending.
    #[error("link closed by the other end")]
    LinkClosed,

    /// An active measurement session lost its link; the session is dead and
    /// the controller has transitioned to `Disconnected`.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// A bounded read saw no complete line within its timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// A line did not match the `<seq_hex>:<108 hex chars>` data format.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Gain outside the device's 0..=15 range. Nothing was written.
    #[error("invalid gain {0}, valid range is 0..=15")]
    InvalidGain(u8),

    /// A control operation was issued in a state that does not permit it.
    #[error("`{operation}` is not allowed while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: MeasurementState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_the_rejected_operation() {
        let err = SensorError::InvalidState {
            operation: "start",
            state: MeasurementState::Disconnected,
        };
        let msg = err.to_string();
        assert!(msg.contains("start"));
        assert!(msg.contains("Disconnected"));
    }

    #[test]
    fn invalid_gain_reports_the_offending_value() {
        assert_eq!(
            SensorError::InvalidGain(16).to_string(),
            "invalid gain 16, valid range is 0..=15"
        );
    }

    #[test]
    fn io_errors_convert_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: SensorError = io.into();
        assert!(matches!(err, SensorError::Io(_)));
    }
}
