//! Media model - tracks, streams and acquisition constraints
//!
//! A [`MediaStream`] is an immutable bundle of [`MediaTrack`]s. Streams are
//! never mutated in place: the device manager swaps whole streams in its state
//! store, and filters derive new streams from their input.

mod constraints;
mod stream;
mod track;

pub use constraints::{FacingMode, MediaConstraints};
pub use stream::MediaStream;
pub use track::{LocalTrack, MediaTrack, ReadyState, TrackEvent, TrackKind, TrackSettings};
