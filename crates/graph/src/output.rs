//! Where the graph's audio and video end up.
use std::sync::Arc;

use buffer::VideoFrame;
use parking_lot::Mutex;
use util::time::GraphTime;

use crate::{Error, Result};

/// Receives the mixed audio of every iteration.
///
/// `position` and `written_frames` are only used to pace a realtime graph. They never affect
/// blocking.
pub trait AudioSink: Send + 'static {
    /// `frames` is interleaved with `channels` channels and starts at `graph_time`.
    fn write(&mut self, frames: &[f32], channels: usize, graph_time: GraphTime);

    /// Frames accepted so far.
    fn written_frames(&self) -> u64;

    /// Frames actually played so far.
    fn position(&self) -> u64 {
        self.written_frames()
    }
}

/// Discards audio.
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
}

impl AudioSink for NullSink {
    fn write(&mut self, frames: &[f32], channels: usize, _graph_time: GraphTime) {
        self.written += (frames.len() / channels.max(1)) as u64;
    }

    fn written_frames(&self) -> u64 {
        self.written
    }
}

/// Collects audio in memory. Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct OfflineSink {
    inner: Arc<Mutex<OfflineData>>,
}

#[derive(Debug, Default)]
struct OfflineData {
    samples: Vec<f32>,
    channels: usize,
}

impl OfflineSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, interleaved.
    pub fn samples(&self) -> Vec<f32> {
        self.inner.lock().samples.clone()
    }

    pub fn channels(&self) -> usize {
        self.inner.lock().channels
    }

    pub fn frames(&self) -> usize {
        let data = self.inner.lock();
        data.samples.len() / data.channels.max(1)
    }
}

impl AudioSink for OfflineSink {
    fn write(&mut self, frames: &[f32], channels: usize, _graph_time: GraphTime) {
        let mut data = self.inner.lock();
        data.channels = channels;
        data.samples.extend_from_slice(frames);
    }

    fn written_frames(&self) -> u64 {
        self.frames() as u64
    }
}

/// The interleaved buffer an iteration's audio is mixed into.
///
/// Capacity for one iteration is reserved up front. Growing past it is an allocation failure.
pub(crate) struct AudioMixer {
    buffer: Vec<f32>,
    channels: usize,
}

impl AudioMixer {
    pub(crate) fn new(channels: usize, max_frames: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(channels * max_frames)
            .map_err(|error| Error::Allocation(error.to_string()))?;
        Ok(Self { buffer, channels })
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels
    }

    /// A zeroed buffer of `frames` frames.
    pub(crate) fn begin(&mut self, frames: usize) -> Result<&mut [f32]> {
        let len = frames * self.channels;
        self.buffer.clear();
        if len > self.buffer.capacity() {
            self.buffer
                .try_reserve_exact(len)
                .map_err(|error| Error::Allocation(error.to_string()))?;
        }
        self.buffer.resize(len, 0.0);
        Ok(&mut self.buffer)
    }
}

/// Holds the most recent video frame of a stream. Clones share the same container.
#[derive(Clone, Debug, Default)]
pub struct VideoFrameContainer {
    inner: Arc<Mutex<ContainerState>>,
}

#[derive(Debug, Default)]
struct ContainerState {
    frame: Option<VideoFrame>,
    time: GraphTime,
    updates: u64,
}

impl VideoFrameContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_frame(&self) -> Option<VideoFrame> {
        self.inner.lock().frame.clone()
    }

    /// The graph time at which the current frame became current.
    pub fn frame_time(&self) -> GraphTime {
        self.inner.lock().time
    }

    /// How many distinct frames have been set.
    pub fn update_count(&self) -> u64 {
        self.inner.lock().updates
    }

    pub(crate) fn set_current_frame(&self, frame: VideoFrame, time: GraphTime) {
        let mut state = self.inner.lock();
        state.frame = Some(frame);
        state.time = time;
        state.updates += 1;
    }
}

impl PartialEq for VideoFrameContainer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
