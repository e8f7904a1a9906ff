//! Cleanup propagation between a filter's output and its input
//!
//! A filter's output tracks are new tracks, so stopping them does not release
//! the camera or microphone underneath. [`ChainedTrack`] ties a derived track
//! to the same-kind tracks of its parent stream:
//!
//! - stopping the derived track stops the parent tracks as well;
//! - when a parent track ends abruptly (device unplugged, permission revoked)
//!   the derived track is stopped and `Ended` is re-emitted from it.

use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::trace;

use crate::media::{MediaStream, MediaTrack, ReadyState, TrackEvent, TrackKind, TrackSettings};

const CHAINED_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Derived,
    Parent(usize),
}

/// Derived track bound to its parent tracks
pub struct ChainedTrack {
    derived: Arc<dyn MediaTrack>,
    parents: Vec<Arc<dyn MediaTrack>>,
    events: broadcast::Sender<TrackEvent>,
    forwarder: JoinHandle<()>,
}

impl ChainedTrack {
    /// Must be called from within a tokio runtime.
    pub fn new(derived: Arc<dyn MediaTrack>, parents: Vec<Arc<dyn MediaTrack>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHAINED_EVENT_CAPACITY);

        // Subscribe synchronously so nothing emitted after construction is lost
        let mut sources = StreamMap::new();
        sources.insert(Source::Derived, BroadcastStream::new(derived.subscribe()));
        for (index, parent) in parents.iter().enumerate() {
            sources.insert(Source::Parent(index), BroadcastStream::new(parent.subscribe()));
        }

        let forwarder = tokio::spawn(forward_events(
            sources,
            Arc::clone(&derived),
            events.clone(),
        ));

        Arc::new(Self {
            derived,
            parents,
            events,
            forwarder,
        })
    }
}

async fn forward_events(
    mut sources: StreamMap<Source, BroadcastStream<TrackEvent>>,
    derived: Arc<dyn MediaTrack>,
    events: broadcast::Sender<TrackEvent>,
) {
    let mut ended = false;

    while let Some((source, event)) = sources.next().await {
        // Lagged receivers only lose events they can no longer act on
        let Ok(event) = event else { continue };

        match (source, event) {
            (Source::Parent(_), TrackEvent::Ended) => {
                trace!(track = derived.id(), "Parent track ended, stopping derived track");
                derived.stop();
                if !ended {
                    ended = true;
                    let _ = events.send(TrackEvent::Ended);
                }
            }
            (Source::Parent(_), _) => {}
            (Source::Derived, TrackEvent::Ended) => {
                if !ended {
                    ended = true;
                    let _ = events.send(TrackEvent::Ended);
                }
            }
            (Source::Derived, event) => {
                let _ = events.send(event);
            }
        }
    }
}

impl Drop for ChainedTrack {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl fmt::Debug for ChainedTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedTrack")
            .field("derived", &self.derived.id())
            .field(
                "parents",
                &self.parents.iter().map(|p| p.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MediaTrack for ChainedTrack {
    fn id(&self) -> &str {
        self.derived.id()
    }

    fn kind(&self) -> TrackKind {
        self.derived.kind()
    }

    fn ready_state(&self) -> ReadyState {
        self.derived.ready_state()
    }

    fn enabled(&self) -> bool {
        self.derived.enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.derived.set_enabled(enabled);
    }

    fn stop(&self) {
        self.derived.stop();
        for parent in &self.parents {
            parent.stop();
        }
    }

    fn settings(&self) -> TrackSettings {
        self.derived.settings()
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }
}

/// Chain every track of `derived` to the same-kind tracks of `parent`
///
/// Tracks that `derived` simply passed through are left untouched.
pub fn chain_with(parent: &MediaStream, derived: MediaStream) -> MediaStream {
    if derived.same_as(parent) {
        return derived;
    }

    let tracks = derived
        .tracks()
        .iter()
        .map(|track| {
            let parents: Vec<Arc<dyn MediaTrack>> = parent
                .tracks_of(track.kind())
                .filter(|p| p.id() != track.id())
                .cloned()
                .collect();
            let passed_through = parent.tracks().iter().any(|p| p.id() == track.id());

            if parents.is_empty() || passed_through {
                Arc::clone(track)
            } else {
                ChainedTrack::new(Arc::clone(track), parents) as Arc<dyn MediaTrack>
            }
        })
        .collect();

    MediaStream::new(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_propagates_to_parent() {
        let camera = LocalTrack::for_device(TrackKind::Video, "cam");
        let mic = LocalTrack::for_device(TrackKind::Audio, "mic");
        let blurred = LocalTrack::new(TrackKind::Video, TrackSettings::default());

        let parent = MediaStream::new(vec![camera.clone(), mic.clone()]);
        let chained = chain_with(&parent, MediaStream::new(vec![blurred.clone()]));

        chained.stop_tracks();

        assert_eq!(blurred.stop_count(), 1);
        assert_eq!(camera.stop_count(), 1);
        // only parent tracks of the same kind are stopped
        assert_eq!(mic.stop_count(), 0);
        assert!(mic.is_live());
    }

    #[tokio::test]
    async fn test_parent_end_propagates_to_derived() {
        let camera = LocalTrack::for_device(TrackKind::Video, "cam");
        let blurred = LocalTrack::new(TrackKind::Video, TrackSettings::default());

        let parent = MediaStream::new(vec![camera.clone()]);
        let chained = chain_with(&parent, MediaStream::new(vec![blurred.clone()]));
        let mut events = chained.tracks()[0].subscribe();

        camera.end();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TrackEvent::Ended);
        assert!(!blurred.is_live());
        assert!(chained.all_ended());
    }

    #[tokio::test]
    async fn test_derived_events_are_forwarded() {
        let camera = LocalTrack::for_device(TrackKind::Video, "cam");
        let blurred = LocalTrack::new(TrackKind::Video, TrackSettings::default());

        let parent = MediaStream::new(vec![camera]);
        let chained = chain_with(&parent, MediaStream::new(vec![blurred.clone()]));
        let mut events = chained.tracks()[0].subscribe();

        blurred.set_muted(true);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TrackEvent::Muted);
    }

    #[tokio::test]
    async fn test_passed_through_tracks_are_not_wrapped() {
        let camera = LocalTrack::for_device(TrackKind::Video, "cam");
        let mic = LocalTrack::for_device(TrackKind::Audio, "mic");
        let denoised = LocalTrack::new(TrackKind::Audio, TrackSettings::default());
        let parent = MediaStream::new(vec![camera.clone(), mic]);

        let out = chain_with(&parent, MediaStream::new(vec![camera.clone(), denoised]));
        out.tracks()[0].stop();

        assert_eq!(camera.stop_count(), 1);
        assert!(format!("{:?}", out.tracks()[1]).starts_with("ChainedTrack"));
    }
}
