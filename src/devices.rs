//! Shared device enumeration
//!
//! Every manager in the process watches the same device list. [`DeviceList`]
//! runs a single pump task that enumerates devices once and re-enumerates
//! whenever the platform reports a device change (debounced). The latest
//! snapshot is replayed to late subscribers. The pump only runs while at least
//! one [`DeviceStream`] is alive and is restarted by the next subscription.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::DeviceError;
use crate::media::TrackKind;

/// Quiet period after the last change notification before re-enumerating
pub const DEVICE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Id under which platforms expose the system default device
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Kind of a physical media device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::AudioInput => f.write_str("audioinput"),
            DeviceKind::VideoInput => f.write_str("videoinput"),
            DeviceKind::AudioOutput => f.write_str("audiooutput"),
        }
    }
}

impl From<TrackKind> for DeviceKind {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => DeviceKind::AudioInput,
            TrackKind::Video => DeviceKind::VideoInput,
        }
    }
}

/// One entry of the platform's device list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    /// Physical device the entry belongs to. Changes when a device id is
    /// re-bound to different hardware.
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub label: String,
}

/// Platform device enumeration
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    /// Notification fired whenever the set of devices may have changed
    fn subscribe_changes(&self) -> broadcast::Receiver<()>;
}

/// Result of one enumeration pass
pub type DeviceSnapshot = Result<Arc<[DeviceInfo]>, DeviceError>;

/// Devices of `kind` from a snapshot
pub fn of_kind(devices: &[DeviceInfo], kind: DeviceKind) -> Vec<DeviceInfo> {
    devices.iter().filter(|d| d.kind == kind).cloned().collect()
}

/// Whether the transition `previous -> current` added a device that took over
/// the `default` entry of `kind`
pub fn default_device_added(previous: &[DeviceInfo], current: &[DeviceInfo], kind: DeviceKind) -> bool {
    let previous = of_kind(previous, kind);
    let current = of_kind(current, kind);
    let default_group = |devices: &[DeviceInfo]| {
        devices
            .iter()
            .find(|d| d.device_id == DEFAULT_DEVICE_ID)
            .map(|d| d.group_id.clone())
    };

    match (default_group(&previous), default_group(&current)) {
        (Some(before), Some(after)) => current.len() > previous.len() && before != after,
        _ => false,
    }
}

// ============================================================================
// Pump
// ============================================================================

struct Pump {
    latest: watch::Receiver<Option<DeviceSnapshot>>,
    task: JoinHandle<()>,
}

impl Pump {
    fn start(enumerator: Arc<dyn DeviceEnumerator>, debounce: Duration) -> Self {
        let (tx, latest) = watch::channel(None);
        let task = tokio::spawn(run_pump(enumerator, tx, debounce));
        Self { latest, task }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        debug!("Device list has no subscribers, stopping enumeration");
        self.task.abort();
    }
}

async fn run_pump(
    enumerator: Arc<dyn DeviceEnumerator>,
    tx: watch::Sender<Option<DeviceSnapshot>>,
    debounce: Duration,
) {
    // Subscribe before the first enumeration so no change slips through
    let mut changes = enumerator.subscribe_changes();

    loop {
        let snapshot = enumerator.enumerate().await.map(Arc::<[DeviceInfo]>::from);
        match &snapshot {
            Ok(devices) => debug!("Enumerated {} devices", devices.len()),
            Err(e) => warn!("Device enumeration failed: {}", e),
        }
        tx.send_replace(Some(snapshot));

        match changes.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }

        // Swallow the burst of notifications a single plug event produces
        loop {
            match tokio::time::timeout(debounce, changes.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            }
        }
    }

    debug!("Device change source closed");
}

// ============================================================================
// Public handles
// ============================================================================

struct ListInner {
    enumerator: Arc<dyn DeviceEnumerator>,
    pump: Mutex<Weak<Pump>>,
    debounce: Duration,
}

/// Process-wide handle over the platform's device list. Cheap to clone.
#[derive(Clone)]
pub struct DeviceList {
    inner: Arc<ListInner>,
}

impl DeviceList {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        Self::with_debounce(enumerator, DEVICE_CHANGE_DEBOUNCE)
    }

    pub fn with_debounce(enumerator: Arc<dyn DeviceEnumerator>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(ListInner {
                enumerator,
                pump: Mutex::new(Weak::new()),
                debounce,
            }),
        }
    }

    /// Subscribe to device snapshots, starting enumeration if nobody else is
    /// listening. Must be called from within a tokio runtime.
    pub fn subscribe(&self) -> DeviceStream {
        let mut slot = self.inner.pump.lock();
        let pump = match slot.upgrade() {
            Some(pump) => pump,
            None => {
                debug!("Starting device enumeration");
                let pump = Arc::new(Pump::start(
                    Arc::clone(&self.inner.enumerator),
                    self.inner.debounce,
                ));
                *slot = Arc::downgrade(&pump);
                pump
            }
        };

        let rx = pump.latest.clone();
        DeviceStream { rx, _pump: pump }
    }

    /// Whether an enumeration pump is currently running
    pub fn is_active(&self) -> bool {
        self.inner.pump.lock().strong_count() > 0
    }

    /// Notify whenever a newly connected device becomes the `default` one
    pub fn watch_for_added_default_device(&self, kind: DeviceKind) -> DefaultDeviceWatch {
        DefaultDeviceWatch {
            devices: self.subscribe(),
            kind,
            previous: None,
        }
    }
}

/// Subscription to device snapshots. Dropping it releases the pump.
pub struct DeviceStream {
    rx: watch::Receiver<Option<DeviceSnapshot>>,
    _pump: Arc<Pump>,
}

impl DeviceStream {
    /// Wait for the next snapshot. The first call returns the latest known
    /// snapshot if there is one.
    ///
    /// Cancel safe. Returns `None` once the pump is gone.
    pub async fn next(&mut self) -> Option<DeviceSnapshot> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Snapshots restricted to devices of `kind`
    pub fn for_kind(
        self,
        kind: DeviceKind,
    ) -> impl Stream<Item = Result<Vec<DeviceInfo>, DeviceError>> + Send + 'static {
        let DeviceStream { rx, _pump: pump } = self;
        WatchStream::new(rx).filter_map(move |snapshot| {
            // keeps the pump alive as long as the stream
            let _ = &pump;
            snapshot.map(|s| s.map(|devices| of_kind(&devices, kind)))
        })
    }
}

/// See [`DeviceList::watch_for_added_default_device`]
pub struct DefaultDeviceWatch {
    devices: DeviceStream,
    kind: DeviceKind,
    previous: Option<Arc<[DeviceInfo]>>,
}

impl DefaultDeviceWatch {
    /// Resolves when the next default-device takeover is observed
    pub async fn next(&mut self) -> Option<()> {
        while let Some(snapshot) = self.devices.next().await {
            let Ok(current) = snapshot else { continue };
            let added = self
                .previous
                .replace(Arc::clone(&current))
                .map(|previous| default_device_added(&previous, &current, self.kind))
                .unwrap_or(false);
            if added {
                return Some(());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEnumerator {
        devices: Mutex<Result<Vec<DeviceInfo>, DeviceError>>,
        calls: AtomicUsize,
        changes: broadcast::Sender<()>,
    }

    impl FakeEnumerator {
        fn new(devices: Vec<DeviceInfo>) -> Arc<Self> {
            Arc::new(Self {
                devices: Mutex::new(Ok(devices)),
                calls: AtomicUsize::new(0),
                changes: broadcast::channel(16).0,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceEnumerator for FakeEnumerator {
        async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.devices.lock().clone()
        }

        fn subscribe_changes(&self) -> broadcast::Receiver<()> {
            self.changes.subscribe()
        }
    }

    fn device(id: &str, kind: DeviceKind, group: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            kind,
            group_id: group.to_string(),
            label: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let enumerator = FakeEnumerator::new(vec![device("cam-1", DeviceKind::VideoInput, "g1")]);
        let list = DeviceList::new(enumerator.clone());

        let mut first = list.subscribe();
        let snapshot = first.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);

        let mut second = list.subscribe();
        let replayed = second.next().await.unwrap().unwrap();
        assert_eq!(replayed[0].device_id, "cam-1");
        assert_eq!(enumerator.calls(), 1);
    }

    #[tokio::test]
    async fn test_pump_stops_with_last_subscriber() {
        let enumerator = FakeEnumerator::new(vec![]);
        let list = DeviceList::new(enumerator.clone());

        let mut stream = list.subscribe();
        stream.next().await.unwrap().unwrap();
        assert!(list.is_active());

        drop(stream);
        assert!(!list.is_active());

        let mut stream = list.subscribe();
        stream.next().await.unwrap().unwrap();
        assert_eq!(enumerator.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_bursts_are_debounced() {
        let enumerator = FakeEnumerator::new(vec![]);
        let list = DeviceList::new(enumerator.clone());

        let mut stream = list.subscribe();
        stream.next().await.unwrap().unwrap();

        *enumerator.devices.lock() = Ok(vec![device("mic-1", DeviceKind::AudioInput, "g1")]);
        for _ in 0..3 {
            enumerator.changes.send(()).unwrap();
        }

        let snapshot = stream.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(enumerator.calls(), 2);
    }

    #[tokio::test]
    async fn test_enumeration_error_reaches_subscribers() {
        let enumerator = FakeEnumerator::new(vec![]);
        *enumerator.devices.lock() = Err(DeviceError::Enumeration {
            kind: DeviceKind::VideoInput,
            message: "denied".to_string(),
        });
        let list = DeviceList::new(enumerator);

        let mut stream = list.subscribe();
        assert!(matches!(
            stream.next().await,
            Some(Err(DeviceError::Enumeration { .. }))
        ));
    }

    #[tokio::test]
    async fn test_for_kind_filters_devices() {
        let enumerator = FakeEnumerator::new(vec![
            device("cam-1", DeviceKind::VideoInput, "g1"),
            device("mic-1", DeviceKind::AudioInput, "g2"),
        ]);
        let list = DeviceList::new(enumerator);

        let mut cameras = Box::pin(list.subscribe().for_kind(DeviceKind::VideoInput));
        let devices = cameras.next().await.unwrap().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::VideoInput);
    }

    #[test]
    fn test_default_device_added() {
        let kind = DeviceKind::AudioInput;
        let before = vec![
            device("default", kind, "builtin"),
            device("mic-1", kind, "builtin"),
        ];
        let after = vec![
            device("default", kind, "headset"),
            device("mic-1", kind, "builtin"),
            device("mic-2", kind, "headset"),
        ];

        assert!(default_device_added(&before, &after, kind));
        // removals never count
        assert!(!default_device_added(&after, &before, kind));
        // other kinds are ignored
        assert!(!default_device_added(&before, &after, DeviceKind::AudioOutput));

        let same_default = vec![
            device("default", kind, "builtin"),
            device("mic-1", kind, "builtin"),
            device("mic-2", kind, "headset"),
        ];
        assert!(!default_device_added(&before, &same_default, kind));
    }
}
