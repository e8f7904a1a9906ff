//! Device manager - lifecycle of one local capture device
//!
//! A [`DeviceManager`] owns the stream of a single camera or microphone:
//! - enable/disable/toggle with optimistic status and cancel-and-supersede
//! - device selection with rollback
//! - the filter pipeline, mutated only while no status change is running
//! - reactions to tracks ending and to devices being unplugged or replaced
//!
//! Every public operation performs its synchronous part (optimistic state,
//! scheduling) when called and returns a `'static` future for the outcome.
//! Dropping that future does not cancel the operation.

mod reconciler;
pub mod state;
mod tracks;


use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::backend::{CallSession, MediaBackend};
use crate::concurrency::{ConcurrencyTag, Coordinator};
use crate::devices::{DeviceInfo, DeviceKind, DeviceList};
use crate::error::DeviceError;
use crate::filters::{self, FilterEntry, MediaStreamFilter};
use crate::media::{MediaConstraints, MediaStream, TrackKind};

pub use state::{DeviceState, DeviceStatus, TrackDisableMode};
use tracks::TrackEndGuard;

/// How long after a track ended on its own a replaced device counts as the
/// same device coming back
pub const DEFAULT_TRACK_END_GUARD: Duration = Duration::from_secs(2);

/// Outcome of a scheduled manager operation
pub type DeviceFuture = Pin<Box<dyn Future<Output = Result<(), DeviceError>> + Send + 'static>>;

/// Adjusts acquisition constraints right before the hardware is asked for a
/// stream
pub(crate) type ConstraintsHook = Arc<dyn Fn(&mut MediaConstraints) + Send + Sync>;

fn ready(result: Result<(), DeviceError>) -> DeviceFuture {
    Box::pin(std::future::ready(result))
}

/// Per-manager tunables
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub disable_mode: TrackDisableMode,
    /// See [`DEFAULT_TRACK_END_GUARD`]
    pub track_end_guard: Duration,
    /// Forward hardware mute/unmute of published tracks to the call
    pub notify_mute_state: bool,
    pub default_constraints: Option<MediaConstraints>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            disable_mode: TrackDisableMode::StopTracks,
            track_end_guard: DEFAULT_TRACK_END_GUARD,
            notify_mute_state: true,
            default_constraints: None,
        }
    }
}

/// Options for [`DeviceManager::disable`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisableOptions {
    /// Stop the tracks even when the manager only soft-disables, and run
    /// even when the device is already disabled
    pub force_stop: bool,
}

impl DisableOptions {
    pub fn force_stop() -> Self {
        Self { force_stop: true }
    }
}

/// Returned by [`DeviceManager::register_filter`]
pub struct FilterRegistration {
    /// Resolves once the filter is part of the pipeline and, if the device
    /// is enabled, the stream has been rebuilt through it
    pub registered: DeviceFuture,
    pub handle: FilterHandle,
}

/// Removes a registered filter
pub struct FilterHandle {
    manager: Weak<ManagerInner>,
    entry: Arc<FilterEntry>,
}

impl FilterHandle {
    /// Stop the filter, remove it from the pipeline and rebuild the stream
    /// without it. Resolves immediately when the manager is gone.
    pub fn unregister(&self) -> DeviceFuture {
        let Some(inner) = self.manager.upgrade() else {
            return ready(Ok(()));
        };

        let entry = Arc::clone(&self.entry);
        let this = Arc::clone(&inner);
        let scheduled = inner
            .coordinator
            .without_concurrency(inner.filter_tag, move || async move {
                this.coordinator.settled(this.status_tag).await;
                entry.run_stop();
                this.filters.lock().retain(|e| e.id() != entry.id());
                info!("🧹 Filter '{}' unregistered from {} manager", entry.name(), this.kind);
                this.apply_settings_to_stream().await
            });
        Box::pin(scheduled)
    }
}

// ============================================================================
// Manager
// ============================================================================

pub(crate) struct ManagerInner {
    kind: TrackKind,
    state: DeviceState,
    backend: Arc<dyn MediaBackend>,
    call: Arc<dyn CallSession>,
    devices: DeviceList,
    coordinator: Coordinator,
    status_tag: ConcurrencyTag,
    filter_tag: ConcurrencyTag,
    filters: Mutex<Vec<Arc<FilterEntry>>>,
    settings: ManagerSettings,
    track_end_guard: Arc<TrackEndGuard>,
    track_watchers: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    constraints_hook: Option<ConstraintsHook>,
}

/// Lifecycle manager of one local capture device. Cheap to clone.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    /// Create a manager and start watching for hot-plug events.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `kind` - Kind of track this manager captures
    /// * `backend` - Hardware acquisition
    /// * `call` - Call the stream is published into
    /// * `devices` - Shared device list of the process
    /// * `settings` - Per-manager tunables
    pub fn new(
        kind: TrackKind,
        backend: Arc<dyn MediaBackend>,
        call: Arc<dyn CallSession>,
        devices: DeviceList,
        settings: ManagerSettings,
    ) -> Self {
        Self::with_constraints_hook(kind, backend, call, devices, settings, None)
    }

    pub(crate) fn with_constraints_hook(
        kind: TrackKind,
        backend: Arc<dyn MediaBackend>,
        call: Arc<dyn CallSession>,
        devices: DeviceList,
        settings: ManagerSettings,
        constraints_hook: Option<ConstraintsHook>,
    ) -> Self {
        let resolver_backend = Arc::clone(&backend);
        let state = DeviceState::new(
            settings.disable_mode,
            Arc::new(move |stream: &MediaStream| resolver_backend.device_id_from_stream(stream)),
        );
        state.set_default_constraints(settings.default_constraints.clone());

        let inner = Arc::new(ManagerInner {
            kind,
            state,
            backend,
            call,
            devices,
            coordinator: Coordinator::new(),
            status_tag: ConcurrencyTag::new("status-change"),
            filter_tag: ConcurrencyTag::new("filter-registration"),
            filters: Mutex::new(Vec::new()),
            track_end_guard: Arc::new(TrackEndGuard::new(settings.track_end_guard)),
            settings,
            track_watchers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            constraints_hook,
        });

        if inner.backend.supports_device_selection() {
            let handle = reconciler::spawn(
                Arc::downgrade(&inner),
                inner.kind,
                inner.devices.subscribe(),
                inner.state.subscribe_selected_device(),
            );
            inner.subscriptions.lock().push(handle);
        }

        debug!("{} manager created", kind);
        Self { inner }
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn state(&self) -> &DeviceState {
        &self.inner.state
    }

    /// Whether the last confirmed status is `Enabled`
    pub fn enabled(&self) -> bool {
        self.inner.state.status() == DeviceStatus::Enabled
    }

    /// Start capturing
    pub fn enable(&self) -> DeviceFuture {
        self.inner.enable()
    }

    /// Stop capturing, either stopping or soft-disabling the tracks depending
    /// on [`TrackDisableMode`]
    pub fn disable(&self, options: DisableOptions) -> DeviceFuture {
        self.inner.disable(options)
    }

    pub fn toggle(&self) -> DeviceFuture {
        if self.inner.state.optimistic_status() == DeviceStatus::Enabled {
            self.disable(DisableOptions::default())
        } else {
            self.enable()
        }
    }

    /// Re-enable the device if it was enabled before the last enable/disable
    /// request and is not enabled now
    pub fn resume(&self) -> DeviceFuture {
        let state = &self.inner.state;
        if state.prev_status() == DeviceStatus::Enabled && state.status() != DeviceStatus::Enabled {
            self.enable()
        } else {
            ready(Ok(()))
        }
    }

    /// Switch to another device, or back to the system default with `None`.
    ///
    /// The previous selection is restored if the stream cannot be rebuilt.
    pub fn select(&self, device_id: Option<String>) -> DeviceFuture {
        self.inner.select(device_id)
    }

    /// Append a filter to the pipeline
    pub fn register_filter(&self, filter: Arc<dyn MediaStreamFilter>) -> FilterRegistration {
        let inner = &self.inner;
        let entry = Arc::new(FilterEntry::new(filter));

        let this = Arc::clone(inner);
        let scheduled_entry = Arc::clone(&entry);
        let registered = inner
            .coordinator
            .without_concurrency(inner.filter_tag, move || async move {
                this.coordinator.settled(this.status_tag).await;
                info!(
                    "🎛️ Filter '{}' registered on {} manager",
                    scheduled_entry.name(),
                    this.kind
                );
                this.filters.lock().push(scheduled_entry);
                this.apply_settings_to_stream().await
            });

        FilterRegistration {
            registered: Box::pin(registered),
            handle: FilterHandle {
                manager: Arc::downgrade(inner),
                entry,
            },
        }
    }

    /// Constraints merged into every acquisition. Applied on the next
    /// acquisition, not to the live stream.
    pub fn set_default_constraints(&self, constraints: Option<MediaConstraints>) {
        self.inner.state.set_default_constraints(constraints);
    }

    /// Devices of this manager's kind, updated whenever devices change
    pub fn list_devices(
        &self,
    ) -> impl Stream<Item = Result<Vec<DeviceInfo>, DeviceError>> + Send + 'static {
        self.inner
            .devices
            .subscribe()
            .for_kind(DeviceKind::from(self.inner.kind))
    }

    /// Resolves once no status change is queued or running
    pub fn status_change_settled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.coordinator.settled(self.inner.status_tag)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.state.subscribe_status()
    }

    /// Stop reacting to hot-plug events and track lifecycle events
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Rebuild the stream if enabled, e.g. after constraints changed
    pub(crate) fn apply_settings_to_stream(&self) -> DeviceFuture {
        self.inner.apply_settings_to_stream()
    }

    /// Publish the current stream, if any, into the call
    pub(crate) async fn publish_current_stream(&self) -> Result<(), DeviceError> {
        match self.inner.state.media_stream() {
            Some(stream) if self.inner.call.is_joined() => {
                self.inner.call.publish(&stream, self.inner.kind).await
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn MediaBackend> {
        &self.inner.backend
    }
}

impl ManagerInner {
    fn enable(self: &Arc<Self>) -> DeviceFuture {
        let state = &self.state;
        state.set_prev_status(state.optimistic_status());
        if state.optimistic_status() == DeviceStatus::Enabled {
            return ready(Ok(()));
        }
        state.set_optimistic_status(DeviceStatus::Enabled);

        let this = Arc::clone(self);
        let scheduled = self
            .coordinator
            .with_cancellation(self.status_tag, move |signal| async move {
                let result = this.unmute_stream().await;
                if result.is_ok() {
                    this.state.set_status(DeviceStatus::Enabled);
                    info!("▶️ {} device enabled", this.kind);
                }
                if !signal.is_aborted() {
                    this.state.set_optimistic_status(this.state.status());
                }
                result
            });

        Box::pin(async move { scheduled.await.unwrap_or(Ok(())) })
    }

    fn disable(self: &Arc<Self>, options: DisableOptions) -> DeviceFuture {
        let state = &self.state;
        state.set_prev_status(state.optimistic_status());
        if !options.force_stop && state.optimistic_status() == DeviceStatus::Disabled {
            return ready(Ok(()));
        }
        state.set_optimistic_status(DeviceStatus::Disabled);

        let stop_tracks =
            options.force_stop || state.disable_mode() == TrackDisableMode::StopTracks;
        let this = Arc::clone(self);
        let scheduled = self
            .coordinator
            .with_cancellation(self.status_tag, move |signal| async move {
                let result = this.mute_stream(stop_tracks).await;
                if result.is_ok() {
                    this.state.set_status(DeviceStatus::Disabled);
                    info!("⏸️ {} device disabled", this.kind);
                }
                if !signal.is_aborted() {
                    this.state.set_optimistic_status(this.state.status());
                }
                result
            });

        Box::pin(async move { scheduled.await.unwrap_or(Ok(())) })
    }

    fn select(self: &Arc<Self>, device_id: Option<String>) -> DeviceFuture {
        if !self.backend.supports_device_selection() {
            return ready(Err(DeviceError::Unsupported("explicit device selection")));
        }

        let previous = self.state.selected_device();
        if previous == device_id {
            return ready(Ok(()));
        }

        debug!("Selecting {} device {:?}", self.kind, device_id);
        self.state.set_device(device_id);
        let applied = self.apply_settings_to_stream();

        let this = Arc::clone(self);
        Box::pin(async move {
            if let Err(e) = applied.await {
                this.state.set_device(previous);
                return Err(e);
            }
            Ok(())
        })
    }

    /// Restart the stream with the current settings if the device is enabled
    fn apply_settings_to_stream(self: &Arc<Self>) -> DeviceFuture {
        let this = Arc::clone(self);
        let scheduled = self
            .coordinator
            .with_cancellation(self.status_tag, move |signal| async move {
                if this.state.status() != DeviceStatus::Enabled {
                    return Ok(());
                }

                let result: Result<(), DeviceError> = async {
                    this.mute_stream(true).await?;
                    this.state.set_status(DeviceStatus::Disabled);
                    if signal.is_aborted() {
                        return Ok(());
                    }
                    this.unmute_stream().await?;
                    this.state.set_status(DeviceStatus::Enabled);
                    Ok(())
                }
                .await;

                if !signal.is_aborted() {
                    this.state.set_optimistic_status(this.state.status());
                }
                result
            });

        Box::pin(async move { scheduled.await.unwrap_or(Ok(())) })
    }

    fn constraints(&self) -> MediaConstraints {
        let mut constraints = self
            .state
            .default_constraints()
            .unwrap_or_default()
            .for_device(self.state.selected_device());
        if let Some(hook) = &self.constraints_hook {
            hook(&mut constraints);
        }
        constraints
    }

    /// Make sure a live, enabled stream is owned and published
    async fn unmute_stream(self: &Arc<Self>) -> Result<(), DeviceError> {
        debug!("Starting {} stream", self.kind);
        let current = self.state.media_stream();

        let reusable = current.as_ref().filter(|stream| {
            stream.all_live() && self.state.selected_device() == self.state.stream_device()
        });

        let (stream, root) = match reusable {
            Some(stream) => {
                stream.enable_tracks();
                (stream.clone(), None)
            }
            None => {
                if let Some(stale) = &current {
                    self.release_stale_stream(stale);
                }
                let constraints = self.constraints();
                let root = self.backend.acquire_stream(self.kind, &constraints).await?;
                let entries = self.filters.lock().clone();
                let stream = filters::apply_filters(root.clone(), &entries).await;
                (stream, Some(root))
            }
        };

        if self.call.is_joined() {
            if let Err(e) = self.call.publish(&stream, self.kind).await {
                if root.is_some() {
                    // never leave a freshly acquired device running
                    stream.stop_tracks();
                    self.run_filter_stops();
                }
                return Err(e);
            }
        }

        if let Some(root) = root {
            self.state.set_media_stream(Some(stream.clone()), Some(&root));
            tracks::install_watchers(self, &stream);
        }

        Ok(())
    }

    /// Drop a stream that cannot be re-enabled: its hardware ended while it
    /// was soft-disabled, or it was captured from a device that is no longer
    /// selected. The filters it ran through are stopped before they restart.
    fn release_stale_stream(&self, stale: &MediaStream) {
        debug!("Releasing stale {} stream", self.kind);
        stale.stop_tracks();
        self.state.set_media_stream(None, None);
        self.stop_track_watchers();
        self.run_filter_stops();
    }

    /// Unpublish and stop or soft-disable the owned stream
    async fn mute_stream(&self, stop_tracks: bool) -> Result<(), DeviceError> {
        let Some(stream) = self.state.media_stream() else {
            return Ok(());
        };

        debug!(
            "{} {} stream",
            if stop_tracks { "Stopping" } else { "Disabling" },
            self.kind
        );
        if self.call.is_joined() {
            self.call.unpublish(self.kind).await?;
        }

        if stop_tracks {
            stream.stop_tracks();
        } else {
            stream.disable_tracks();
        }

        if stream.all_ended() {
            self.state.set_media_stream(None, None);
            self.stop_track_watchers();
            self.run_filter_stops();
        }
        Ok(())
    }

    fn run_filter_stops(&self) {
        let entries = self.filters.lock().clone();
        for entry in entries {
            entry.run_stop();
        }
    }

    fn stop_track_watchers(&self) {
        for watcher in self.track_watchers.lock().drain(..) {
            watcher.abort();
        }
    }

    fn dispose(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.abort();
        }
        self.stop_track_watchers();
        debug!("{} manager disposed", self.kind);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.dispose();
    }
}
