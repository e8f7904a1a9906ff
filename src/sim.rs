//! In-process simulated hardware and call
//!
//! Stands in for a capture API and a signalling layer. Used by the demo
//! binary and by tests to drive hot-plug events, acquisition failures and
//! publish failures deterministically.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::backend::{CallSession, MediaBackend};
use crate::devices::{DeviceEnumerator, DeviceInfo, DeviceKind};
use crate::error::{AcquisitionFailure, DeviceError, FilterError};
use crate::filters::{filter_fn, FilterOutput, MediaStreamFilter};
use crate::media::{
    LocalTrack, MediaConstraints, MediaStream, MediaTrack, TrackKind, TrackSettings,
};

const DEVICE_CHANGE_CAPACITY: usize = 32;

// ============================================================================
// Devices
// ============================================================================

/// Simulated device tree with a capture backend on top
pub struct SimulatedDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    changes: broadcast::Sender<()>,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    acquisitions: AtomicUsize,
    acquire_delay: Mutex<Duration>,
    fail_next_acquire: Mutex<Option<AcquisitionFailure>>,
    fail_enumeration: AtomicBool,
    last_constraints: Mutex<Option<MediaConstraints>>,
    device_selection: AtomicBool,
    direction: AtomicBool,
}

impl SimulatedDevices {
    pub fn new(devices: Vec<DeviceInfo>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(DEVICE_CHANGE_CAPACITY);
        Arc::new(Self {
            devices: Mutex::new(devices),
            changes,
            tracks: Mutex::new(Vec::new()),
            acquisitions: AtomicUsize::new(0),
            acquire_delay: Mutex::new(Duration::ZERO),
            fail_next_acquire: Mutex::new(None),
            fail_enumeration: AtomicBool::new(false),
            last_constraints: Mutex::new(None),
            device_selection: AtomicBool::new(true),
            direction: AtomicBool::new(false),
        })
    }

    /// Shorthand for a device entry whose label is its id
    pub fn device(device_id: &str, kind: DeviceKind, group_id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: device_id.to_string(),
            kind,
            group_id: group_id.to_string(),
            label: device_id.to_string(),
        }
    }

    pub fn set_device_selection_supported(&self, supported: bool) {
        self.device_selection.store(supported, Ordering::SeqCst);
    }

    pub fn set_direction_supported(&self, supported: bool) {
        self.direction.store(supported, Ordering::SeqCst);
    }

    /// Delay every acquisition, to widen race windows
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock() = delay;
    }

    /// Make the next acquisition fail
    pub fn fail_next_acquire(&self, reason: AcquisitionFailure) {
        *self.fail_next_acquire.lock() = Some(reason);
    }

    pub fn set_enumeration_failing(&self, failing: bool) {
        self.fail_enumeration.store(failing, Ordering::SeqCst);
    }

    /// Number of acquisition attempts so far
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        self.last_constraints.lock().clone()
    }

    /// Hardware tracks that are still running
    pub fn live_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.lock().clone()
    }

    /// Connect a device
    pub fn plug(&self, device: DeviceInfo) {
        info!("🔌 Simulated device plugged: {}", device.device_id);
        self.devices.lock().push(device);
        self.notify_change();
    }

    /// Disconnect a device; its running tracks end abruptly.
    /// Returns false if no such device exists.
    pub fn unplug(&self, device_id: &str) -> bool {
        let removed = {
            let mut devices = self.devices.lock();
            let before = devices.len();
            devices.retain(|d| d.device_id != device_id);
            devices.len() != before
        };
        if removed {
            info!("📴 Simulated device unplugged: {}", device_id);
            self.end_tracks(device_id);
            self.notify_change();
        }
        removed
    }

    /// Re-bind `device_id` to new hardware, as happens when a headset is
    /// re-plugged or a driver resets. Its running tracks end abruptly.
    pub fn replug(&self, device_id: &str, group_id: &str) -> bool {
        let replaced = self.set_group(device_id, group_id);
        if replaced {
            info!("🔁 Simulated device replugged: {} -> {}", device_id, group_id);
            self.end_tracks(device_id);
            self.notify_change();
        }
        replaced
    }

    /// Re-bind `device_id` to new hardware while its tracks keep running,
    /// as when a dock swaps the device behind a stable id.
    /// Returns false if no such device exists.
    pub fn rebind(&self, device_id: &str, group_id: &str) -> bool {
        let replaced = self.set_group(device_id, group_id);
        if replaced {
            info!("🔁 Simulated device rebound: {} -> {}", device_id, group_id);
            self.notify_change();
        }
        replaced
    }

    /// End every running track captured from `device_id`
    pub fn end_tracks(&self, device_id: &str) {
        for track in self.live_tracks() {
            if track.settings().device_id.as_deref() == Some(device_id) {
                track.end();
            }
        }
    }

    /// Simulate a hardware mute (e.g. privacy shutter) on `device_id`
    pub fn set_tracks_muted(&self, device_id: &str, muted: bool) {
        for track in self.live_tracks() {
            if track.settings().device_id.as_deref() == Some(device_id) {
                track.set_muted(muted);
            }
        }
    }

    fn set_group(&self, device_id: &str, group_id: &str) -> bool {
        let mut devices = self.devices.lock();
        let mut found = false;
        for device in devices.iter_mut().filter(|d| d.device_id == device_id) {
            device.group_id = group_id.to_string();
            found = true;
        }
        found
    }

    fn notify_change(&self) {
        // No receivers just means nobody enumerates right now
        let _ = self.changes.send(());
    }

    fn pick_device(&self, kind: TrackKind, device_id: Option<&str>) -> Option<DeviceInfo> {
        let kind = DeviceKind::from(kind);
        let devices = self.devices.lock();
        let mut candidates = devices.iter().filter(|d| d.kind == kind);
        match device_id {
            Some(id) => candidates.find(|d| d.device_id == id).cloned(),
            None => candidates.next().cloned(),
        }
    }
}

#[async_trait]
impl MediaBackend for SimulatedDevices {
    async fn acquire_stream(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, DeviceError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock() = Some(constraints.clone());

        let delay = *self.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.fail_next_acquire.lock().take();
        if let Some(reason) = failure {
            return Err(DeviceError::acquisition(kind, reason, "simulated failure"));
        }

        let device = self
            .pick_device(kind, constraints.device_id.as_deref())
            .ok_or_else(|| {
                DeviceError::acquisition(
                    kind,
                    AcquisitionFailure::NotFound,
                    format!("no {} device matches {:?}", kind, constraints.device_id),
                )
            })?;

        let track = LocalTrack::new(
            kind,
            TrackSettings {
                device_id: Some(device.device_id.clone()),
                width: constraints.width,
                height: constraints.height,
                frame_rate: constraints.frame_rate,
            },
        );
        debug!("Acquired {} track {} from {}", kind, track.id(), device.device_id);
        self.tracks.lock().push(Arc::clone(&track));

        Ok(MediaStream::new(vec![track]))
    }

    fn supports_device_selection(&self) -> bool {
        self.device_selection.load(Ordering::SeqCst)
    }

    fn supports_direction(&self) -> bool {
        self.direction.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceEnumerator for SimulatedDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(DeviceError::Enumeration {
                kind: DeviceKind::VideoInput,
                message: "simulated enumeration failure".to_string(),
            });
        }
        Ok(self.devices.lock().clone())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

// ============================================================================
// Call
// ============================================================================

/// Simulated call session that records what was published
#[derive(Default)]
pub struct SimulatedCall {
    joined: AtomicBool,
    published: Mutex<Option<MediaStream>>,
    publishes: AtomicUsize,
    unpublishes: AtomicUsize,
    fail_next_publish: AtomicBool,
    mute_notifications: Mutex<Vec<(bool, TrackKind)>>,
}

impl SimulatedCall {
    pub fn new(joined: bool) -> Arc<Self> {
        let call = Self::default();
        call.joined.store(joined, Ordering::SeqCst);
        Arc::new(call)
    }

    pub fn set_joined(&self, joined: bool) {
        self.joined.store(joined, Ordering::SeqCst);
    }

    pub fn fail_next_publish(&self) {
        self.fail_next_publish.store(true, Ordering::SeqCst);
    }

    pub fn published(&self) -> Option<MediaStream> {
        self.published.lock().clone()
    }

    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn unpublishes(&self) -> usize {
        self.unpublishes.load(Ordering::SeqCst)
    }

    pub fn mute_notifications(&self) -> Vec<(bool, TrackKind)> {
        self.mute_notifications.lock().clone()
    }
}

#[async_trait]
impl CallSession for SimulatedCall {
    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    async fn publish(&self, stream: &MediaStream, kind: TrackKind) -> Result<(), DeviceError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_publish.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Publish {
                kind,
                message: "simulated publish failure".to_string(),
            });
        }
        *self.published.lock() = Some(stream.clone());
        Ok(())
    }

    async fn unpublish(&self, _kind: TrackKind) -> Result<(), DeviceError> {
        self.unpublishes.fetch_add(1, Ordering::SeqCst);
        *self.published.lock() = None;
        Ok(())
    }

    async fn notify_track_mute_state(&self, muted: bool, kind: TrackKind) -> Result<(), DeviceError> {
        self.mute_notifications.lock().push((muted, kind));
        Ok(())
    }
}

// ============================================================================
// Demo filters
// ============================================================================

/// Filter producing a fresh track per input track, as a real effect would
pub fn mirror_filter(name: &str, stops: Arc<AtomicUsize>) -> Arc<dyn MediaStreamFilter> {
    Arc::new(filter_fn(name.to_string(), move |input: MediaStream| {
        let stops = Arc::clone(&stops);
        async move {
            let tracks: Vec<Arc<dyn MediaTrack>> = input
                .tracks()
                .iter()
                .map(|t| LocalTrack::new(t.kind(), t.settings()) as Arc<dyn MediaTrack>)
                .collect();
            Ok(FilterOutput::with_stop(MediaStream::new(tracks), move || {
                stops.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }))
}

/// Filter that never manages to start
pub fn broken_filter(name: &str) -> Arc<dyn MediaStreamFilter> {
    let filter_name = name.to_string();
    Arc::new(filter_fn(name.to_string(), move |_input: MediaStream| {
        let err = FilterError::new(filter_name.clone(), "simulated start failure");
        async move { Err(err) }
    }))
}
