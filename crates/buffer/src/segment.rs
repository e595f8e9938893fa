use util::time::StreamTime;

use crate::{AudioSegment, Error, Result, VideoSegment};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Media data of either kind. Operations that combine two segments require matching kinds.
#[derive(Clone, Debug)]
pub enum MediaSegment {
    Audio(AudioSegment),
    Video(VideoSegment),
}

impl MediaSegment {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    /// An empty segment of the same kind.
    pub fn empty_like(&self) -> Self {
        Self::empty(self.kind())
    }

    pub fn empty(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio(AudioSegment::new()),
            MediaKind::Video => Self::Video(VideoSegment::new()),
        }
    }

    pub fn duration(&self) -> StreamTime {
        match self {
            Self::Audio(audio) => audio.duration(),
            Self::Video(video) => video.duration(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duration() == 0
    }

    pub fn as_audio(&self) -> Option<&AudioSegment> {
        match self {
            Self::Audio(audio) => Some(audio),
            Self::Video(_) => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoSegment> {
        match self {
            Self::Video(video) => Some(video),
            Self::Audio(_) => None,
        }
    }

    pub fn append_null(&mut self, duration: StreamTime) {
        match self {
            Self::Audio(audio) => audio.append_null(duration),
            Self::Video(video) => video.append_null(duration),
        }
    }

    pub fn append_slice(
        &mut self,
        source: &MediaSegment,
        start: StreamTime,
        end: StreamTime,
    ) -> Result<()> {
        match (self, source) {
            (Self::Audio(dst), Self::Audio(src)) => dst.append_slice(src, start, end),
            (Self::Video(dst), Self::Video(src)) => dst.append_slice(src, start, end),
            (dst, src) => return Err(mismatch(dst, src)),
        }
        Ok(())
    }

    pub fn append_from(&mut self, other: &mut MediaSegment) -> Result<()> {
        match (self, other) {
            (Self::Audio(dst), Self::Audio(src)) => dst.append_from(src),
            (Self::Video(dst), Self::Video(src)) => dst.append_from(src),
            (dst, src) => return Err(mismatch(dst, src)),
        }
        Ok(())
    }

    pub fn remove_leading(&mut self, duration: StreamTime) {
        match self {
            Self::Audio(audio) => audio.remove_leading(duration),
            Self::Video(video) => video.remove_leading(duration),
        }
    }

    pub fn forget_up_to(&mut self, time: StreamTime) {
        match self {
            Self::Audio(audio) => audio.forget_up_to(time),
            Self::Video(video) => video.forget_up_to(time),
        }
    }

    /// Make the data unobservable while keeping its timing: audio becomes silence, video black.
    pub fn replace_with_disabled(&mut self) {
        match self {
            Self::Audio(audio) => audio.replace_with_null(),
            Self::Video(video) => video.replace_with_black(),
        }
    }

    /// Take the contents, leaving an empty segment of the same kind behind.
    pub fn take(&mut self) -> Self {
        let empty = self.empty_like();
        std::mem::replace(self, empty)
    }
}

fn mismatch(dst: &MediaSegment, src: &MediaSegment) -> Error {
    Error::KindMismatch {
        expected: dst.kind(),
        found: src.kind(),
    }
}

impl From<AudioSegment> for MediaSegment {
    fn from(audio: AudioSegment) -> Self {
        Self::Audio(audio)
    }
}

impl From<VideoSegment> for MediaSegment {
    fn from(video: VideoSegment) -> Self {
        Self::Video(video)
    }
}
