use buffer::TrackId;
use util::TimeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),
    #[error("track {0} already exists")]
    TrackExists(TrackId),
    #[error("every track must be ended before the stream can finish")]
    TracksNotEnded,
    #[error("stream has finished")]
    Finished,
    #[error("a stream may only finish at the end of the computed interval")]
    FinishNotAllowed,
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("graph has shut down")]
    GraphShutDown,
    #[error("failed to start the graph thread")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Buffer(#[from] buffer::Error),
    #[error("failed to construct resampler")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed")]
    Resample(#[from] rubato::ResampleError),
    #[error("transform failed: {0}")]
    Transform(String),
}

pub type Result<T> = std::result::Result<T, Error>;
