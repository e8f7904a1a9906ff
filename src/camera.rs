//! Camera specialisation of the device manager
//!
//! Adds a target resolution and, on platforms that support it, choosing the
//! camera by facing direction instead of by device id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{CallSession, MediaBackend};
use crate::devices::DeviceList;
use crate::error::DeviceError;
use crate::manager::{ConstraintsHook, DeviceManager, DeviceStatus, ManagerSettings};
use crate::media::{FacingMode, MediaConstraints, MediaTrack, TrackKind};

/// Which side of the device the camera is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraDirection {
    Front,
    Back,
}

impl CameraDirection {
    fn facing_mode(self) -> FacingMode {
        match self {
            CameraDirection::Front => FacingMode::User,
            CameraDirection::Back => FacingMode::Environment,
        }
    }
}

/// Capture resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Camera settings pushed by the call backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VideoSettings {
    pub target_resolution: Resolution,
    pub camera_facing: CameraDirection,
    /// Turn the camera on when the user has not chosen anything yet
    pub camera_default_on: bool,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct CameraSettings {
    direction: Option<CameraDirection>,
    target: Resolution,
}

/// Device manager for a camera
#[derive(Clone)]
pub struct CameraManager {
    manager: DeviceManager,
    settings: Arc<Mutex<CameraSettings>>,
}

impl CameraManager {
    /// Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        call: Arc<dyn CallSession>,
        devices: DeviceList,
        settings: ManagerSettings,
    ) -> Self {
        let camera_settings = Arc::new(Mutex::new(CameraSettings::default()));

        let hook_settings = Arc::clone(&camera_settings);
        let direction_supported = backend.supports_direction();
        let hook: ConstraintsHook = Arc::new(move |constraints: &mut MediaConstraints| {
            let settings = hook_settings.lock();
            constraints.width = Some(settings.target.width);
            constraints.height = Some(settings.target.height);
            // An exact device id and a facing mode cannot be combined; the id wins
            if constraints.device_id.is_none() && direction_supported {
                if let Some(direction) = settings.direction {
                    constraints.facing_mode = Some(direction.facing_mode());
                }
            }
        });

        let manager = DeviceManager::with_constraints_hook(
            TrackKind::Video,
            backend,
            call,
            devices,
            settings,
            Some(hook),
        );

        Self {
            manager,
            settings: camera_settings,
        }
    }

    /// The underlying generic manager
    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn direction(&self) -> Option<CameraDirection> {
        self.settings.lock().direction
    }

    pub fn target_resolution(&self) -> Resolution {
        self.settings.lock().target
    }

    /// Switch to the front or back camera.
    ///
    /// Deselects any explicitly selected device. Logs and does nothing on
    /// platforms without direction support.
    pub async fn select_direction(&self, direction: CameraDirection) -> Result<(), DeviceError> {
        if !self.manager.backend().supports_direction() {
            warn!("Setting direction is not supported on this device");
            return Ok(());
        }

        debug!("Selecting {:?} camera", direction);
        self.settings.lock().direction = Some(direction);
        self.manager.state().set_device(None);
        self.manager.apply_settings_to_stream().await
    }

    /// Switch between front and back camera
    pub async fn flip(&self) -> Result<(), DeviceError> {
        let direction = match self.direction() {
            Some(CameraDirection::Front) => CameraDirection::Back,
            _ => CameraDirection::Front,
        };
        self.select_direction(direction).await
    }

    /// Change the capture resolution, restarting the camera if the running
    /// stream does not match it
    pub async fn select_target_resolution(&self, width: u32, height: u32) -> Result<(), DeviceError> {
        self.settings.lock().target = Resolution { width, height };

        if self.manager.state().optimistic_status() == DeviceStatus::Enabled {
            self.manager.status_change_settled().await;
        }

        if !self.manager.enabled() {
            return Ok(());
        }
        let Some(stream) = self.manager.state().media_stream() else {
            return Ok(());
        };
        let Some(track) = stream.tracks_of(TrackKind::Video).next().cloned() else {
            return Ok(());
        };

        let actual = track.settings();
        if actual.width != Some(width) || actual.height != Some(height) {
            self.manager.apply_settings_to_stream().await?;
            debug!(
                "{}x{} target resolution applied to media stream",
                width, height
            );
        }
        Ok(())
    }

    /// Apply camera settings pushed by the call backend
    ///
    /// # Arguments
    /// * `settings` - Settings from the backend
    /// * `publish` - Publish the stream (enabling the camera if the settings
    ///   say so) once the settings are applied
    pub async fn apply(&self, settings: &VideoSettings, publish: bool) -> Result<(), DeviceError> {
        self.manager.status_change_settled().await;

        // Devices rotate portrait resolutions on their own
        let Resolution { width, height } = settings.target_resolution;
        let (width, height) = if width < height {
            (height, width)
        } else {
            (width, height)
        };
        self.select_target_resolution(width, height).await?;

        if self.manager.state().selected_device().is_none() {
            let mut camera = self.settings.lock();
            if camera.direction.is_none() {
                camera.direction = Some(settings.camera_facing);
            }
        }

        if !publish {
            return Ok(());
        }

        let state = self.manager.state();
        if self.manager.enabled() && state.media_stream().is_some() {
            self.manager.publish_current_stream().await
        } else if state.status() == DeviceStatus::Unset
            && settings.camera_default_on
            && settings.enabled
        {
            self.manager.enable().await
        } else {
            Ok(())
        }
    }
}

impl std::ops::Deref for CameraManager {
    type Target = DeviceManager;

    fn deref(&self) -> &DeviceManager {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Detached;
    use crate::devices::DeviceKind;
    use crate::sim::SimulatedDevices;

    fn camera(direction_supported: bool) -> (Arc<SimulatedDevices>, CameraManager) {
        let sim = SimulatedDevices::new(vec![
            SimulatedDevices::device("cam-front", DeviceKind::VideoInput, "g1"),
            SimulatedDevices::device("cam-back", DeviceKind::VideoInput, "g2"),
        ]);
        sim.set_direction_supported(direction_supported);
        let camera = CameraManager::new(
            sim.clone(),
            Arc::new(Detached),
            DeviceList::new(sim.clone()),
            ManagerSettings::default(),
        );
        (sim, camera)
    }

    #[tokio::test]
    async fn test_target_resolution_in_constraints() {
        let (sim, camera) = camera(false);
        camera.enable().await.unwrap();

        let constraints = sim.last_constraints().unwrap();
        assert_eq!(constraints.width, Some(1280));
        assert_eq!(constraints.height, Some(720));
        assert_eq!(constraints.facing_mode, None);
    }

    #[tokio::test]
    async fn test_select_direction_reacquires_by_facing_mode() {
        let (sim, camera) = camera(true);
        camera.enable().await.unwrap();
        assert_eq!(camera.state().selected_device().as_deref(), Some("cam-front"));

        camera.select_direction(CameraDirection::Back).await.unwrap();

        let constraints = sim.last_constraints().unwrap();
        assert_eq!(constraints.device_id, None);
        assert_eq!(constraints.facing_mode, Some(FacingMode::Environment));
        assert_eq!(sim.acquisitions(), 2);
        assert_eq!(camera.direction(), Some(CameraDirection::Back));
        assert!(camera.enabled());
    }

    #[tokio::test]
    async fn test_flip_alternates_direction() {
        let (_sim, camera) = camera(true);
        camera.flip().await.unwrap();
        assert_eq!(camera.direction(), Some(CameraDirection::Front));
        camera.flip().await.unwrap();
        assert_eq!(camera.direction(), Some(CameraDirection::Back));
    }

    #[tokio::test]
    async fn test_direction_unsupported_is_ignored() {
        let (sim, camera) = camera(false);
        camera.enable().await.unwrap();

        camera.select_direction(CameraDirection::Back).await.unwrap();

        assert_eq!(camera.direction(), None);
        assert_eq!(sim.acquisitions(), 1);
        assert_eq!(camera.state().selected_device().as_deref(), Some("cam-front"));
    }

    #[tokio::test]
    async fn test_target_resolution_restarts_only_on_mismatch() {
        let (sim, camera) = camera(false);
        camera.enable().await.unwrap();

        camera.select_target_resolution(1280, 720).await.unwrap();
        assert_eq!(sim.acquisitions(), 1);

        camera.select_target_resolution(640, 480).await.unwrap();
        assert_eq!(sim.acquisitions(), 2);
        let stream = camera.state().media_stream().unwrap();
        assert_eq!(stream.tracks()[0].settings().width, Some(640));
        assert_eq!(camera.target_resolution(), Resolution { width: 640, height: 480 });
    }

    #[tokio::test]
    async fn test_target_resolution_while_disabled_applies_later() {
        let (sim, camera) = camera(false);
        camera.select_target_resolution(320, 240).await.unwrap();
        assert_eq!(sim.acquisitions(), 0);

        camera.enable().await.unwrap();
        assert_eq!(sim.last_constraints().unwrap().width, Some(320));
    }

    #[tokio::test]
    async fn test_apply_enables_camera_by_default() {
        let (sim, camera) = camera(false);
        let settings = VideoSettings {
            target_resolution: Resolution { width: 480, height: 640 },
            camera_facing: CameraDirection::Front,
            camera_default_on: true,
            enabled: true,
        };

        camera.apply(&settings, true).await.unwrap();

        assert!(camera.enabled());
        // portrait targets are normalised to landscape
        assert_eq!(camera.target_resolution(), Resolution { width: 640, height: 480 });
        assert_eq!(camera.direction(), Some(CameraDirection::Front));
        assert_eq!(sim.acquisitions(), 1);

        // an explicit user choice is not overridden
        camera.disable(Default::default()).await.unwrap();
        camera.apply(&settings, true).await.unwrap();
        assert!(!camera.enabled());
    }
}
