//! Collaborator seams: hardware acquisition and the call session
//!
//! The device manager never talks to a capture API or a signalling layer
//! directly. Everything it needs from the outside world goes through the two
//! traits below, which keeps the state machine testable against the
//! simulated implementations in [`crate::sim`].

use async_trait::async_trait;

use crate::error::DeviceError;
use crate::media::{MediaConstraints, MediaStream, TrackKind};

/// Hardware acquisition backend
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Acquire a fresh root stream satisfying `constraints`.
    ///
    /// # Arguments
    /// * `kind` - Kind of track the caller manages
    /// * `constraints` - `device_id`, when set, must be matched exactly
    async fn acquire_stream(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError>;

    /// Device the given root stream was captured from
    fn device_id_from_stream(&self, stream: &MediaStream) -> Option<String> {
        stream
            .tracks()
            .first()
            .and_then(|track| track.settings().device_id)
    }

    /// Whether explicit device selection is possible on this platform
    fn supports_device_selection(&self) -> bool {
        true
    }

    /// Whether cameras can be chosen by facing direction
    fn supports_direction(&self) -> bool {
        false
    }
}

/// The call the captured media is published into
#[async_trait]
pub trait CallSession: Send + Sync {
    fn is_joined(&self) -> bool;

    async fn publish(&self, stream: &MediaStream, kind: TrackKind) -> Result<(), DeviceError>;

    async fn unpublish(&self, kind: TrackKind) -> Result<(), DeviceError>;

    /// Tell remote peers that the hardware muted or unmuted a published track
    async fn notify_track_mute_state(
        &self,
        _muted: bool,
        _kind: TrackKind,
    ) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Session for a manager that is not attached to any call
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

#[async_trait]
impl CallSession for Detached {
    fn is_joined(&self) -> bool {
        false
    }

    async fn publish(&self, _stream: &MediaStream, _kind: TrackKind) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn unpublish(&self, _kind: TrackKind) -> Result<(), DeviceError> {
        Ok(())
    }
}
