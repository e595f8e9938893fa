//! Video segments.
//!
//! A [VideoSegment] is a list of [VideoChunk]s, each holding one [VideoFrame] for a duration.
use std::sync::Arc;

use util::time::StreamTime;

/// A decoded picture. The graph never looks inside it.
#[derive(Debug)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A reference to an [Image] plus how it should be shown.
///
/// Two frames are equal when they reference the same image allocation with the same size and
/// black flag.
#[derive(Clone, Debug, Default)]
pub struct VideoFrame {
    image: Option<Arc<Image>>,
    size: (u32, u32),
    force_black: bool,
}

#[derive(Clone, Debug)]
pub struct VideoChunk {
    pub frame: VideoFrame,
    pub duration: StreamTime,
}

#[derive(Clone, Debug, Default)]
pub struct VideoSegment {
    chunks: Vec<VideoChunk>,
    duration: StreamTime,
}

impl Image {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            data,
        })
    }
}

impl VideoFrame {
    pub fn new(image: Arc<Image>) -> Self {
        let size = (image.width, image.height);
        Self {
            image: Some(image),
            size,
            force_black: false,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.image.is_none()
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn is_force_black(&self) -> bool {
        self.force_black
    }

    /// The same frame, drawn black.
    pub fn to_black(&self) -> Self {
        Self {
            force_black: true,
            ..self.clone()
        }
    }
}

impl PartialEq for VideoFrame {
    fn eq(&self, other: &Self) -> bool {
        let same_image = match (&self.image, &other.image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_image && self.size == other.size && self.force_black == other.force_black
    }
}

impl VideoSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration(&self) -> StreamTime {
        self.duration
    }

    pub fn is_empty(&self) -> bool {
        self.duration == 0
    }

    pub fn chunks(&self) -> &[VideoChunk] {
        &self.chunks
    }

    pub fn append_frame(&mut self, frame: VideoFrame, duration: StreamTime) {
        self.push(VideoChunk { frame, duration });
    }

    pub fn append_null(&mut self, duration: StreamTime) {
        self.append_frame(VideoFrame::null(), duration);
    }

    pub fn append_slice(&mut self, source: &VideoSegment, start: StreamTime, end: StreamTime) {
        let start = start.max(0);
        let end = end.min(source.duration);
        let mut offset = 0;
        for chunk in &source.chunks {
            let chunk_end = offset + chunk.duration;
            if chunk_end > start && offset < end {
                let duration = end.min(chunk_end) - start.max(offset);
                self.append_frame(chunk.frame.clone(), duration);
            }
            if chunk_end >= end {
                break;
            }
            offset = chunk_end;
        }
    }

    pub fn append_from(&mut self, other: &mut VideoSegment) {
        for chunk in other.chunks.drain(..) {
            self.push(chunk);
        }
        other.duration = 0;
    }

    pub fn remove_leading(&mut self, duration: StreamTime) {
        let mut remaining = duration.min(self.duration).max(0);
        self.duration -= remaining;
        let mut drop = 0;
        for chunk in &mut self.chunks {
            if remaining == 0 {
                break;
            }
            if chunk.duration <= remaining {
                remaining -= chunk.duration;
                drop += 1;
            } else {
                chunk.duration -= remaining;
                remaining = 0;
            }
        }
        self.chunks.drain(..drop);
    }

    /// Replace everything before `time` with null frames, releasing the images.
    pub fn forget_up_to(&mut self, time: StreamTime) {
        let time = time.min(self.duration);
        if time <= 0 {
            return;
        }
        self.remove_leading(time);
        let mut chunks = Vec::with_capacity(self.chunks.len() + 1);
        chunks.push(VideoChunk {
            frame: VideoFrame::null(),
            duration: time,
        });
        if self.chunks.first().is_some_and(|chunk| chunk.frame.is_null()) {
            chunks[0].duration += self.chunks.remove(0).duration;
        }
        chunks.append(&mut self.chunks);
        self.chunks = chunks;
        self.duration += time;
    }

    /// Keep the timing but draw every frame black.
    pub fn replace_with_black(&mut self) {
        for chunk in &mut self.chunks {
            chunk.frame = chunk.frame.to_black();
        }
    }

    pub fn replace_with_null(&mut self) {
        let duration = self.duration;
        self.chunks.clear();
        self.duration = 0;
        self.append_null(duration);
    }

    /// The chunk covering `time`, with the time it starts at.
    pub fn frame_at(&self, time: StreamTime) -> Option<(StreamTime, &VideoFrame)> {
        let mut offset = 0;
        for chunk in &self.chunks {
            if time >= offset && time < offset + chunk.duration {
                return Some((offset, &chunk.frame));
            }
            offset += chunk.duration;
        }
        None
    }

    fn push(&mut self, chunk: VideoChunk) {
        if chunk.duration <= 0 {
            return;
        }
        self.duration += chunk.duration;
        if let Some(last) = self.chunks.last_mut() {
            if last.frame == chunk.frame {
                last.duration += chunk.duration;
                return;
            }
        }
        self.chunks.push(chunk);
    }
}
