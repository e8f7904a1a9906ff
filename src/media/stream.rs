//! Stream handles

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::track::{MediaTrack, TrackKind};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Cheap-to-clone handle over an ordered, immutable set of tracks
///
/// Two handles are the same stream when their ids match; cloning a handle
/// does not create a new stream.
#[derive(Clone)]
pub struct MediaStream {
    id: u64,
    tracks: Arc<[Arc<dyn MediaTrack>]>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            tracks: tracks.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn same_as(&self, other: &MediaStream) -> bool {
        self.id == other.id
    }

    /// True when every track is live (vacuously true for an empty stream)
    pub fn all_live(&self) -> bool {
        self.tracks.iter().all(|t| t.is_live())
    }

    /// True when every track has ended (vacuously true for an empty stream)
    pub fn all_ended(&self) -> bool {
        self.tracks.iter().all(|t| !t.is_live())
    }

    pub fn enable_tracks(&self) {
        for track in self.tracks.iter().filter(|t| !t.enabled()) {
            track.set_enabled(true);
        }
    }

    pub fn disable_tracks(&self) {
        for track in self.tracks.iter().filter(|t| t.enabled()) {
            track.set_enabled(false);
        }
    }

    /// Stop every live track
    pub fn stop_tracks(&self) {
        for track in self.tracks.iter().filter(|t| t.is_live()) {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
