//! Hot-plug reconciliation
//!
//! Compares consecutive device snapshots against the selected device:
//! - the selected device disappeared: disable and fall back to the default
//!   device;
//! - the selected id now points at different hardware (new group): restart
//!   the stream on it, or re-enable if the device had disabled itself because
//!   its track ended moments ago.
//!
//! Passes run one at a time, in the order their triggering events arrived.

use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeviceManager, DeviceStatus, DisableOptions, ManagerInner};
use crate::devices::{DeviceInfo, DeviceKind, DeviceStream};
use crate::error::DeviceError;
use crate::media::TrackKind;

/// What happened to the selected device between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceChange {
    Disconnected,
    Replaced,
    Unchanged,
}

pub(crate) fn classify(
    previous: &[DeviceInfo],
    current: &[DeviceInfo],
    kind: DeviceKind,
    device_id: &str,
) -> DeviceChange {
    let find = |devices: &[DeviceInfo]| {
        devices
            .iter()
            .find(|d| d.kind == kind && d.device_id == device_id)
            .map(|d| d.group_id.clone())
    };

    match (find(previous), find(current)) {
        (Some(_), None) => DeviceChange::Disconnected,
        (Some(before), Some(after)) if before != after => DeviceChange::Replaced,
        _ => DeviceChange::Unchanged,
    }
}

pub(super) fn spawn(
    manager: Weak<ManagerInner>,
    kind: TrackKind,
    mut devices: DeviceStream,
    mut selected: watch::Receiver<Option<String>>,
) -> JoinHandle<()> {
    let kind = DeviceKind::from(kind);

    tokio::spawn(async move {
        let mut previous: Option<Arc<[DeviceInfo]>> = None;
        let mut current: Option<Arc<[DeviceInfo]>> = None;

        loop {
            tokio::select! {
                snapshot = devices.next() => match snapshot {
                    Some(Ok(snapshot)) => previous = current.replace(snapshot),
                    // Enumeration failures are logged by the device list
                    Some(Err(_)) => continue,
                    None => break,
                },
                changed = selected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let (Some(before), Some(after)) = (&previous, &current) else {
                continue;
            };
            let Some(device_id) = selected.borrow_and_update().clone() else {
                continue;
            };
            let Some(inner) = manager.upgrade() else {
                break;
            };

            if let Err(e) = reconcile(inner, before, after, kind, &device_id).await {
                warn!(
                    "Unexpected error while handling disconnected or replaced device: {}",
                    e
                );
            }
        }

        debug!("Device reconciler stopped");
    })
}

async fn reconcile(
    inner: Arc<ManagerInner>,
    previous: &[DeviceInfo],
    current: &[DeviceInfo],
    kind: DeviceKind,
    device_id: &str,
) -> Result<(), DeviceError> {
    inner.coordinator.settled(inner.status_tag).await;

    let manager = DeviceManager { inner };
    match classify(previous, current, kind, device_id) {
        DeviceChange::Disconnected => {
            info!("📴 {} device '{}' disconnected", kind, device_id);
            manager.disable(DisableOptions::default()).await?;
            manager.select(None).await?;
        }
        DeviceChange::Replaced => {
            let inner = &manager.inner;
            if inner.track_end_guard.is_active() && inner.state.status() == DeviceStatus::Disabled {
                info!("🔁 {} device '{}' came back, re-enabling", kind, device_id);
                manager.enable().await?;
                inner.track_end_guard.clear();
            } else {
                info!("🔁 {} device '{}' was replaced, restarting stream", kind, device_id);
                manager.apply_settings_to_stream().await?;
            }
        }
        DeviceChange::Unchanged => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, kind: DeviceKind, group: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.to_string(),
            kind,
            group_id: group.to_string(),
            label: String::new(),
        }
    }

    #[test]
    fn test_classify_device_changes() {
        let kind = DeviceKind::VideoInput;
        let before = vec![device("cam-1", kind, "g1"), device("cam-2", kind, "g2")];

        let unplugged = vec![device("cam-2", kind, "g2")];
        assert_eq!(classify(&before, &unplugged, kind, "cam-1"), DeviceChange::Disconnected);

        let replugged = vec![device("cam-1", kind, "g9"), device("cam-2", kind, "g2")];
        assert_eq!(classify(&before, &replugged, kind, "cam-1"), DeviceChange::Replaced);

        assert_eq!(classify(&before, &before, kind, "cam-1"), DeviceChange::Unchanged);
        // appearing out of nowhere is not a change to react to
        assert_eq!(classify(&unplugged, &before, kind, "cam-1"), DeviceChange::Unchanged);
    }

    #[test]
    fn test_classify_ignores_other_kinds() {
        let before = vec![device("shared", DeviceKind::AudioOutput, "g1")];
        let after: Vec<DeviceInfo> = Vec::new();
        assert_eq!(
            classify(&before, &after, DeviceKind::AudioInput, "shared"),
            DeviceChange::Unchanged
        );
    }
}
