//! Error types surfaced by the capture-device layer
//!
//! Only hardware acquisition and publish/unpublish failures are meant to reach
//! application code. Filter and reconciliation failures are logged where they
//! happen and never leave the manager.

use thiserror::Error;

use crate::devices::DeviceKind;
use crate::media::TrackKind;

/// Why the hardware refused to hand out a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionFailure {
    /// Permission was denied or revoked
    NotAllowed,
    /// The requested device does not exist (anymore)
    NotFound,
    /// The device is in use by another process
    Busy,
    /// Anything else reported by the backend
    Other,
}

impl std::fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AcquisitionFailure::NotAllowed => "not allowed",
            AcquisitionFailure::NotFound => "not found",
            AcquisitionFailure::Busy => "busy",
            AcquisitionFailure::Other => "failed",
        };
        f.write_str(text)
    }
}

/// Errors returned by [`crate::manager::DeviceManager`] operations and by the
/// collaborator traits in [`crate::backend`].
///
/// `Clone` so that enumeration failures can be replayed to every subscriber of
/// the shared device list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{kind} acquisition {reason}: {message}")]
    Acquisition {
        kind: TrackKind,
        reason: AcquisitionFailure,
        message: String,
    },

    #[error("failed to publish {kind} track: {message}")]
    Publish { kind: TrackKind, message: String },

    #[error("failed to unpublish {kind} track: {message}")]
    Unpublish { kind: TrackKind, message: String },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("failed to enumerate {kind} devices: {message}")]
    Enumeration { kind: DeviceKind, message: String },

    #[error("failed to notify remote peer: {0}")]
    Signaling(String),
}

impl DeviceError {
    /// Shorthand for an acquisition error
    pub fn acquisition(
        kind: TrackKind,
        reason: AcquisitionFailure,
        message: impl Into<String>,
    ) -> Self {
        DeviceError::Acquisition {
            kind,
            reason,
            message: message.into(),
        }
    }
}

/// Error returned by a filter whose `start` failed.
///
/// Never propagated past the filter pipeline: the failing stage is skipped and
/// its input stream is passed through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("filter '{filter}' failed to start: {message}")]
pub struct FilterError {
    pub filter: String,
    pub message: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_error_message() {
        let err = DeviceError::acquisition(TrackKind::Video, AcquisitionFailure::Busy, "in use");
        assert_eq!(err.to_string(), "video acquisition busy: in use");
    }

    #[test]
    fn test_unsupported_message() {
        let err = DeviceError::Unsupported("explicit device selection");
        assert_eq!(
            err.to_string(),
            "explicit device selection is not supported on this platform"
        );
    }
}
