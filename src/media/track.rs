//! Media tracks and their lifecycle events

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of a track's event channel. Tracks emit a handful of events over
/// their lifetime, so lagging receivers are not expected.
const TRACK_EVENT_CAPACITY: usize = 16;

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of signal carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Whether a track still produces media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

/// Lifecycle events a track can emit
///
/// `Ended` is only emitted when the track terminates abruptly (device
/// unplugged, permission revoked). Calling [`MediaTrack::stop`] ends the
/// track silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    Ended,
    /// The hardware stopped delivering frames/samples (e.g. privacy shutter)
    Muted,
    Unmuted,
}

/// Settings the hardware actually applied to a track
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSettings {
    /// Only reliable on root (unfiltered) tracks
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

/// A single audio or video signal
///
/// All methods take `&self`: implementations use interior mutability so that
/// tracks can be shared as `Arc<dyn MediaTrack>` between the state store,
/// filter stages and watcher tasks.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn ready_state(&self) -> ReadyState;

    /// Software enabled flag. A disabled track keeps the hardware reserved.
    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// End the track and release whatever it holds. Does not emit `Ended`.
    fn stop(&self);

    fn settings(&self) -> TrackSettings;

    /// Subscribe to lifecycle events emitted after this call
    fn subscribe(&self) -> broadcast::Receiver<TrackEvent>;

    fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }
}

/// Concrete track backed by in-process state
///
/// Used by the simulated backend, by tests, and by filters that produce new
/// tracks from their input.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    settings: Mutex<TrackSettings>,
    enabled: AtomicBool,
    ended: AtomicBool,
    stop_count: AtomicUsize,
    events: broadcast::Sender<TrackEvent>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, settings: TrackSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(TRACK_EVENT_CAPACITY);
        let id = format!("{}-{}", kind, NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed));
        Arc::new(Self {
            id,
            kind,
            settings: Mutex::new(settings),
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            stop_count: AtomicUsize::new(0),
            events,
        })
    }

    /// Track for the given device with no other settings
    pub fn for_device(kind: TrackKind, device_id: impl Into<String>) -> Arc<Self> {
        Self::new(
            kind,
            TrackSettings {
                device_id: Some(device_id.into()),
                ..TrackSettings::default()
            },
        )
    }

    /// Terminate the track abruptly, as the hardware does when a device
    /// disappears. Emits `Ended` once.
    pub fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            trace!(track = %self.id, "Track ended abruptly");
            let _ = self.events.send(TrackEvent::Ended);
        }
    }

    /// Emit a hardware mute/unmute signal
    pub fn set_muted(&self, muted: bool) {
        let event = if muted {
            TrackEvent::Muted
        } else {
            TrackEvent::Unmuted
        };
        let _ = self.events.send(event);
    }

    /// How many times `stop()` was called
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut TrackSettings)) {
        update(&mut self.settings.lock());
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ready_state(&self) -> ReadyState {
        if self.ended.load(Ordering::SeqCst) {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.ended.store(true, Ordering::SeqCst);
    }

    fn settings(&self) -> TrackSettings {
        self.settings.lock().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }
}
