//! Configuration management for Capture GW
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::devices::{DeviceInfo, DeviceKind};
use crate::manager::{ManagerSettings, TrackDisableMode, DEFAULT_TRACK_END_GUARD};
use crate::media::MediaConstraints;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub camera: DeviceConfig,
    #[serde(default)]
    pub microphone: DeviceConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Per-device manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub disable_mode: TrackDisableMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_constraints: Option<MediaConstraints>,
    /// Window in which a device coming back after its track ended is
    /// re-enabled automatically
    #[serde(default = "default_track_end_guard_ms")]
    pub track_end_guard_ms: u64,
    #[serde(default = "default_true")]
    pub notify_mute_state: bool,
    /// Enable the device on startup
    #[serde(default)]
    pub start_enabled: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disable_mode: TrackDisableMode::default(),
            default_constraints: None,
            track_end_guard_ms: default_track_end_guard_ms(),
            notify_mute_state: true,
            start_enabled: false,
        }
    }
}

impl DeviceConfig {
    pub fn to_settings(&self) -> ManagerSettings {
        ManagerSettings {
            disable_mode: self.disable_mode,
            track_end_guard: Duration::from_millis(self.track_end_guard_ms),
            notify_mute_state: self.notify_mute_state,
            default_constraints: self.default_constraints.clone(),
        }
    }
}

/// Simulated hardware used by the demo binary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceInfo>,
    /// Whether the simulated call is joined (publishes streams)
    #[serde(default = "default_true")]
    pub joined: bool,
    #[serde(default)]
    pub acquire_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            joined: true,
            acquire_delay_ms: 0,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml(&contents).with_context(|| format!("Failed to parse YAML config: {}", path))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_track_end_guard_ms() -> u64 { DEFAULT_TRACK_END_GUARD.as_millis() as u64 }

fn default_devices() -> Vec<DeviceInfo> {
    let device = |id: &str, kind, group: &str, label: &str| DeviceInfo {
        device_id: id.to_string(),
        kind,
        group_id: group.to_string(),
        label: label.to_string(),
    };
    vec![
        device("cam-front", DeviceKind::VideoInput, "builtin-cam", "Front Camera"),
        device("cam-usb", DeviceKind::VideoInput, "usb-cam", "USB Camera"),
        device("default", DeviceKind::AudioInput, "builtin-mic", "Default Microphone"),
        device("mic-builtin", DeviceKind::AudioInput, "builtin-mic", "Built-in Microphone"),
        device("speakers", DeviceKind::AudioOutput, "builtin-out", "Speakers"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();

        assert_eq!(config.camera.disable_mode, TrackDisableMode::StopTracks);
        assert_eq!(config.camera.track_end_guard_ms, 2000);
        assert!(config.microphone.notify_mute_state);
        assert!(config.simulation.joined);
        assert!(!config.simulation.devices.is_empty());
    }

    #[test]
    fn test_parse_device_sections() {
        let yaml = r#"
camera:
  disable_mode: disable-tracks
  track_end_guard_ms: 500
  start_enabled: true
  default_constraints:
    width: 640
    height: 480
microphone:
  notify_mute_state: false
  default_constraints:
    echo_cancellation: true
simulation:
  joined: false
  acquire_delay_ms: 250
  devices:
    - device_id: cam-1
      kind: videoinput
      group_id: g1
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();

        let camera = config.camera.to_settings();
        assert_eq!(camera.disable_mode, TrackDisableMode::DisableTracks);
        assert_eq!(camera.track_end_guard, Duration::from_millis(500));
        assert_eq!(camera.default_constraints.unwrap().width, Some(640));
        assert!(config.camera.start_enabled);

        let microphone = config.microphone.to_settings();
        assert!(!microphone.notify_mute_state);
        assert_eq!(
            microphone.default_constraints.unwrap().echo_cancellation,
            Some(true)
        );

        assert!(!config.simulation.joined);
        assert_eq!(config.simulation.devices.len(), 1);
        assert_eq!(config.simulation.devices[0].label, "");
    }

    #[test]
    fn test_invalid_disable_mode_is_rejected() {
        let yaml = "camera:\n  disable_mode: pause\n";
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_has_context() {
        let err = AppConfig::load("/nonexistent/capture-gw.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
