//! Buffered media data.
//!
//! - [AudioSegment] / [VideoSegment]: append-only runs of media, shared by reference.
//! - [MediaSegment]: either of the above.
//! - [StreamBuffer]: the tracks buffered by one stream.
//!
//! All durations are ticks at the graph rate.
pub mod audio;
pub mod error;
pub mod segment;
pub mod stream;
pub mod video;

pub use audio::{AudioChunk, AudioSegment};
pub use error::{Error, Result};
pub use segment::{MediaKind, MediaSegment};
pub use stream::{StreamBuffer, Track};
pub use video::{Image, VideoChunk, VideoFrame, VideoSegment};

/// Identifies a track within one stream.
pub type TrackId = u32;
