//! Observable device state
//!
//! Each field lives in its own `watch` channel so that UI layers and the
//! hot-plug reconciler can observe exactly the field they care about.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::media::{MediaConstraints, MediaStream};

/// Capture status of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Enabled,
    Disabled,
    /// Nothing was ever requested
    #[default]
    Unset,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Enabled => f.write_str("enabled"),
            DeviceStatus::Disabled => f.write_str("disabled"),
            DeviceStatus::Unset => f.write_str("unset"),
        }
    }
}

/// What `disable()` does to the hardware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackDisableMode {
    /// Stop the tracks and release the hardware (indicator light off)
    #[default]
    StopTracks,
    /// Only flip the tracks' enabled flag; re-enabling is instant
    DisableTracks,
}

/// Derives the selected device from a root stream
pub type DeviceIdResolver = Arc<dyn Fn(&MediaStream) -> Option<String> + Send + Sync>;

fn set_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// State store of one device manager
pub struct DeviceState {
    status: watch::Sender<DeviceStatus>,
    optimistic_status: watch::Sender<DeviceStatus>,
    media_stream: watch::Sender<Option<MediaStream>>,
    selected_device: watch::Sender<Option<String>>,
    default_constraints: watch::Sender<Option<MediaConstraints>>,
    prev_status: Mutex<DeviceStatus>,
    /// Device the owned stream was captured from
    stream_device: Mutex<Option<String>>,
    disable_mode: TrackDisableMode,
    resolve_device_id: DeviceIdResolver,
}

impl DeviceState {
    pub fn new(disable_mode: TrackDisableMode, resolve_device_id: DeviceIdResolver) -> Self {
        Self {
            status: watch::Sender::new(DeviceStatus::Unset),
            optimistic_status: watch::Sender::new(DeviceStatus::Unset),
            media_stream: watch::Sender::new(None),
            selected_device: watch::Sender::new(None),
            default_constraints: watch::Sender::new(None),
            prev_status: Mutex::new(DeviceStatus::Unset),
            stream_device: Mutex::new(None),
            disable_mode,
            resolve_device_id,
        }
    }

    /// Last confirmed status
    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: DeviceStatus) {
        set_if_changed(&self.status, status);
    }

    /// Status most recently requested by the application. Ahead of
    /// [`status`](Self::status) while an operation is in flight.
    pub fn optimistic_status(&self) -> DeviceStatus {
        *self.optimistic_status.borrow()
    }

    pub fn set_optimistic_status(&self, status: DeviceStatus) {
        set_if_changed(&self.optimistic_status, status);
    }

    /// Optimistic status observed when the last enable/disable was issued
    pub fn prev_status(&self) -> DeviceStatus {
        *self.prev_status.lock()
    }

    pub fn set_prev_status(&self, status: DeviceStatus) {
        *self.prev_status.lock() = status;
    }

    /// Stream currently owned by the manager (the last stage of the filter
    /// chain)
    pub fn media_stream(&self) -> Option<MediaStream> {
        self.media_stream.borrow().clone()
    }

    /// Replace the owned stream.
    ///
    /// # Arguments
    /// * `stream` - New stream, `None` to release
    /// * `root` - Unfiltered stream straight from the hardware. When present
    ///   the selected device is updated to the device it was captured from.
    pub fn set_media_stream(&self, stream: Option<MediaStream>, root: Option<&MediaStream>) {
        let released = stream.is_none();
        self.media_stream.send_replace(stream);
        if let Some(root) = root {
            let device_id = (self.resolve_device_id)(root);
            *self.stream_device.lock() = device_id.clone();
            self.set_device(device_id);
        } else if released {
            *self.stream_device.lock() = None;
        }
    }

    /// Device the owned stream was captured from, `None` without a stream
    pub fn stream_device(&self) -> Option<String> {
        self.stream_device.lock().clone()
    }

    pub fn selected_device(&self) -> Option<String> {
        self.selected_device.borrow().clone()
    }

    pub fn set_device(&self, device_id: Option<String>) {
        set_if_changed(&self.selected_device, device_id);
    }

    pub fn default_constraints(&self) -> Option<MediaConstraints> {
        self.default_constraints.borrow().clone()
    }

    pub fn set_default_constraints(&self, constraints: Option<MediaConstraints>) {
        set_if_changed(&self.default_constraints, constraints);
    }

    pub fn disable_mode(&self) -> TrackDisableMode {
        self.disable_mode
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_optimistic_status(&self) -> watch::Receiver<DeviceStatus> {
        self.optimistic_status.subscribe()
    }

    pub fn subscribe_media_stream(&self) -> watch::Receiver<Option<MediaStream>> {
        self.media_stream.subscribe()
    }

    pub fn subscribe_selected_device(&self) -> watch::Receiver<Option<String>> {
        self.selected_device.subscribe()
    }

    pub fn subscribe_default_constraints(&self) -> watch::Receiver<Option<MediaConstraints>> {
        self.default_constraints.subscribe()
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("status", &self.status())
            .field("optimistic_status", &self.optimistic_status())
            .field("selected_device", &self.selected_device())
            .field("stream_device", &self.stream_device())
            .field("media_stream", &self.media_stream())
            .field("disable_mode", &self.disable_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, TrackKind};

    fn state() -> DeviceState {
        DeviceState::new(
            TrackDisableMode::StopTracks,
            Arc::new(|stream: &MediaStream| {
                stream
                    .tracks()
                    .first()
                    .and_then(|t| t.settings().device_id)
            }),
        )
    }

    #[test]
    fn test_equal_writes_do_not_notify() {
        let state = state();
        let mut status = state.subscribe_status();

        state.set_status(DeviceStatus::Unset);
        assert!(!status.has_changed().unwrap());

        state.set_status(DeviceStatus::Enabled);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), DeviceStatus::Enabled);

        state.set_status(DeviceStatus::Enabled);
        assert!(!status.has_changed().unwrap());
    }

    #[test]
    fn test_root_stream_sets_selected_device() {
        let state = state();
        let root = MediaStream::new(vec![LocalTrack::for_device(TrackKind::Video, "cam-2")]);
        let filtered = MediaStream::new(vec![LocalTrack::for_device(TrackKind::Video, "virtual")]);

        state.set_media_stream(Some(filtered.clone()), Some(&root));
        assert_eq!(state.selected_device().as_deref(), Some("cam-2"));
        assert_eq!(state.stream_device().as_deref(), Some("cam-2"));
        assert!(state.media_stream().unwrap().same_as(&filtered));

        // releasing the stream keeps the selection
        state.set_media_stream(None, None);
        assert!(state.media_stream().is_none());
        assert_eq!(state.selected_device().as_deref(), Some("cam-2"));
        assert_eq!(state.stream_device(), None);
    }

    #[test]
    fn test_prev_status_is_plain_field() {
        let state = state();
        assert_eq!(state.prev_status(), DeviceStatus::Unset);
        state.set_prev_status(DeviceStatus::Enabled);
        assert_eq!(state.prev_status(), DeviceStatus::Enabled);
    }

    #[test]
    fn test_disable_mode_from_yaml() {
        let mode: TrackDisableMode = serde_yaml::from_str("disable-tracks").unwrap();
        assert_eq!(mode, TrackDisableMode::DisableTracks);
    }
}
