//! Capture GW - local capture-device lifecycle for real-time calls
//!
//! Manages cameras and microphones on behalf of a call client: acquiring
//! and releasing hardware, switching devices, running filter pipelines and
//! reacting to devices being unplugged or replaced.

pub mod backend;
pub mod camera;
pub mod concurrency;
pub mod config;
pub mod devices;
pub mod error;
pub mod filters;
pub mod manager;
pub mod media;
pub mod sim;

pub use backend::{CallSession, Detached, MediaBackend};
pub use camera::{CameraDirection, CameraManager, Resolution, VideoSettings};
pub use devices::{DeviceEnumerator, DeviceInfo, DeviceKind, DeviceList};
pub use error::{AcquisitionFailure, DeviceError, FilterError};
pub use filters::{filter_fn, FilterOutput, MediaStreamFilter};
pub use manager::{
    DeviceManager, DeviceStatus, DisableOptions, FilterHandle, ManagerSettings, TrackDisableMode,
};
pub use media::{MediaConstraints, MediaStream, MediaTrack, TrackKind};
