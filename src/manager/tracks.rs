//! Reactions to track lifecycle events
//!
//! A track that ends without being stopped by us means the hardware went
//! away. The manager then disables itself so that its status matches reality,
//! and remembers for a short while that it did so on its own. If the same
//! device id reappears in that window (headset re-plugged, driver reset) the
//! reconciler re-enables the device instead of just re-applying settings.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{DeviceManager, DeviceStatus, DisableOptions, ManagerInner};
use crate::media::{MediaStream, TrackEvent};

/// "Disabled because a track ended" marker with an expiry
#[derive(Debug)]
pub(crate) struct TrackEndGuard {
    active: AtomicBool,
    generation: AtomicU64,
    window: Duration,
}

impl TrackEndGuard {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            window,
        }
    }

    /// Raise the marker and schedule its expiry. Re-arming restarts the
    /// window; an older expiry timer does not clear a newer marker.
    pub(crate) fn arm(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(true, Ordering::SeqCst);

        let guard = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(guard.window).await;
            if guard.generation.load(Ordering::SeqCst) == generation {
                guard.active.store(false, Ordering::SeqCst);
            }
        });
    }

    pub(crate) fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Start one watcher task per track of `stream`, replacing the watchers of
/// the previous stream
pub(super) fn install_watchers(inner: &Arc<ManagerInner>, stream: &MediaStream) {
    let mut watchers = inner.track_watchers.lock();
    for watcher in watchers.drain(..) {
        watcher.abort();
    }

    for track in stream.tracks() {
        // Subscribe before spawning so an immediate `Ended` is not missed
        let events = track.subscribe();
        let handle = tokio::spawn(watch_track(Arc::downgrade(inner), events));
        watchers.push(handle);
    }
}

async fn watch_track(manager: Weak<ManagerInner>, mut events: broadcast::Receiver<TrackEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = manager.upgrade() else { break };

        match event {
            TrackEvent::Ended => {
                // Runs detached: disabling aborts this watcher
                tokio::spawn(handle_track_ended(inner));
                break;
            }
            TrackEvent::Muted | TrackEvent::Unmuted => {
                notify_mute_state(&inner, event == TrackEvent::Muted).await;
            }
        }
    }
}

async fn handle_track_ended(inner: Arc<ManagerInner>) {
    inner.coordinator.settled(inner.status_tag).await;
    if inner.state.status() != DeviceStatus::Enabled {
        return;
    }

    info!("🔌 {} track ended unexpectedly, disabling device", inner.kind);
    inner.track_end_guard.arm();

    let manager = DeviceManager { inner };
    if let Err(e) = manager.disable(DisableOptions::default()).await {
        warn!("Failed to disable {} device after track ended: {}", manager.kind(), e);
    }
}

async fn notify_mute_state(inner: &ManagerInner, muted: bool) {
    if !inner.settings.notify_mute_state || !inner.call.is_joined() {
        return;
    }

    debug!("{} track {}", inner.kind, if muted { "muted" } else { "unmuted" });
    if let Err(e) = inner.call.notify_track_mute_state(muted, inner.kind).await {
        warn!("Error while notifying track mute state: {}", e);
    }
}
