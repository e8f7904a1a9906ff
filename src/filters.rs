//! Stream filter pipeline
//!
//! Filters transform the hardware stream before it is published (background
//! blur, noise cancellation, ...). They are applied in registration order,
//! each one receiving the output of the previous stage. A stage that fails to
//! start is skipped and its input flows through unchanged.

pub mod chain;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::FilterError;
use crate::media::MediaStream;

/// Cleanup for whatever a filter allocated when it started
pub type StopFn = Arc<dyn Fn() + Send + Sync>;

/// What a filter produced from its input
pub struct FilterOutput {
    pub output: MediaStream,
    pub stop: Option<StopFn>,
}

impl FilterOutput {
    pub fn new(output: MediaStream) -> Self {
        Self { output, stop: None }
    }

    pub fn with_stop(output: MediaStream, stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            output,
            stop: Some(Arc::new(stop)),
        }
    }
}

impl fmt::Debug for FilterOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterOutput")
            .field("output", &self.output)
            .field("stop", &self.stop.is_some())
            .finish()
    }
}

/// A stream transform
#[async_trait]
pub trait MediaStreamFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Derive a new stream from `input`. The returned tracks are chained to
    /// `input`, see [`chain::chain_with`].
    async fn start(&self, input: MediaStream) -> Result<FilterOutput, FilterError>;
}

/// Filter backed by a closure, see [`filter_fn`]
pub struct FnFilter<F> {
    name: String,
    start: F,
}

/// Adapt an async closure into a [`MediaStreamFilter`]
pub fn filter_fn<F, Fut>(name: impl Into<String>, start: F) -> FnFilter<F>
where
    F: Fn(MediaStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FilterOutput, FilterError>> + Send + 'static,
{
    FnFilter {
        name: name.into(),
        start,
    }
}

#[async_trait]
impl<F, Fut> MediaStreamFilter for FnFilter<F>
where
    F: Fn(MediaStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FilterOutput, FilterError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, input: MediaStream) -> Result<FilterOutput, FilterError> {
        (self.start)(input).await
    }
}

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// A registered filter and the cleanup of its current run
pub(crate) struct FilterEntry {
    id: u64,
    filter: Arc<dyn MediaStreamFilter>,
    stop: Mutex<Option<StopFn>>,
}

impl FilterEntry {
    pub(crate) fn new(filter: Arc<dyn MediaStreamFilter>) -> Self {
        Self {
            id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
            filter,
            stop: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        self.filter.name()
    }

    /// Run the stored cleanup, if any. Each start is cleaned up at most once.
    pub(crate) fn run_stop(&self) {
        let stop = self.stop.lock().take();
        if let Some(stop) = stop {
            debug!("Stopping filter '{}'", self.name());
            stop();
        }
    }
}

/// Run `root` through every filter in order
///
/// # Arguments
/// * `root` - Stream straight from the hardware
/// * `entries` - Registered filters, in registration order
pub(crate) async fn apply_filters(root: MediaStream, entries: &[Arc<FilterEntry>]) -> MediaStream {
    let mut parent = root;

    for entry in entries {
        let stage = entry.filter.start(parent.clone()).await;
        match stage {
            Ok(FilterOutput { output, stop }) => {
                *entry.stop.lock() = stop;
                parent = chain::chain_with(&parent, output);
            }
            Err(e) => {
                warn!("Filter failed to start and will be ignored: {}", e);
            }
        }
    }

    parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaTrack, TrackKind};
    use std::sync::atomic::AtomicUsize;

    fn mirror(name: &'static str, stops: Arc<AtomicUsize>) -> Arc<FilterEntry> {
        let filter = filter_fn(name, move |input: MediaStream| {
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
        });
        Arc::new(FilterEntry::new(Arc::new(filter)))
    }

    fn broken() -> Arc<FilterEntry> {
        let filter = filter_fn("broken", |_input: MediaStream| async {
            Err(FilterError::new("broken", "no GPU"))
        });
        Arc::new(FilterEntry::new(Arc::new(filter)))
    }

    #[tokio::test]
    async fn test_no_filters_returns_root() {
        let root = MediaStream::new(vec![LocalTrack::for_device(TrackKind::Video, "cam")]);
        let out = apply_filters(root.clone(), &[]).await;
        assert!(out.same_as(&root));
    }

    #[tokio::test]
    async fn test_failing_stage_passes_parent_through() {
        let stops = Arc::new(AtomicUsize::new(0));
        let root_track = LocalTrack::for_device(TrackKind::Video, "cam");
        let root = MediaStream::new(vec![root_track.clone()]);

        let entries = vec![broken(), mirror("mirror", stops.clone())];
        let out = apply_filters(root.clone(), &entries).await;

        assert!(!out.same_as(&root));
        assert_eq!(out.tracks().len(), 1);

        // the mirror output is chained to the root stream
        out.stop_tracks();
        assert_eq!(root_track.stop_count(), 1);

        entries[1].run_stop();
        entries[1].run_stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let entries: Vec<Arc<FilterEntry>> = ["first", "second"]
            .into_iter()
            .map(|name| {
                let order = Arc::clone(&order);
                let filter = filter_fn(name, move |input: MediaStream| {
                    order.lock().push(name);
                    async move { Ok(FilterOutput::new(input)) }
                });
                Arc::new(FilterEntry::new(Arc::new(filter)))
            })
            .collect();

        let root = MediaStream::new(vec![LocalTrack::for_device(TrackKind::Audio, "mic")]);
        let out = apply_filters(root.clone(), &entries).await;

        assert_eq!(*order.lock(), ["first", "second"]);
        // identity filters do not wrap the stream
        assert!(out.same_as(&root));
    }
}
