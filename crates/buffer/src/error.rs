use crate::{MediaKind, TrackId};
use util::time::StreamTime;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("cannot combine {found:?} data with a {expected:?} segment")]
    KindMismatch { expected: MediaKind, found: MediaKind },
    #[error("track {0} already exists")]
    DuplicateTrack(TrackId),
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),
    #[error("track {0} has ended")]
    TrackEnded(TrackId),
    #[error("known tracks time cannot move back from {known} to {time}")]
    TimeRegression { known: StreamTime, time: StreamTime },
}

pub type Result<T> = std::result::Result<T, Error>;
