//! The tracks buffered by one stream.
//!
//! Every track's segment starts at stream time 0; a track that starts later is padded with null
//! data. Data before the forgotten time has been released and reads back as null.
use util::time::{STREAM_TIME_MAX, StreamTime};

use crate::{Error, MediaKind, MediaSegment, Result, TrackId};

#[derive(Clone, Debug)]
pub struct Track {
    id: TrackId,
    start: StreamTime,
    segment: MediaSegment,
    ended: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StreamBuffer {
    tracks: Vec<Track>,
    known_tracks_time: StreamTime,
    forgotten_time: StreamTime,
}

impl Track {
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn start(&self) -> StreamTime {
        self.start
    }

    pub fn kind(&self) -> MediaKind {
        self.segment.kind()
    }

    pub fn segment(&self) -> &MediaSegment {
        &self.segment
    }

    pub fn segment_mut(&mut self) -> &mut MediaSegment {
        &mut self.segment
    }

    /// Stream time at which the buffered data for this track runs out.
    pub fn end(&self) -> StreamTime {
        self.segment.duration()
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn set_ended(&mut self) {
        self.ended = true;
    }

    /// Move `data` onto the end of the track.
    pub fn append(&mut self, data: &mut MediaSegment) -> Result<()> {
        if self.ended {
            return Err(Error::TrackEnded(self.id));
        }
        self.segment.append_from(data)
    }
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track whose data `segment` begins at stream time `start`.
    pub fn add_track(
        &mut self,
        id: TrackId,
        start: StreamTime,
        mut segment: MediaSegment,
    ) -> Result<&mut Track> {
        if self.find_track(id).is_some() {
            return Err(Error::DuplicateTrack(id));
        }
        let mut padded = segment.empty_like();
        padded.append_null(start);
        padded.append_from(&mut segment)?;
        self.tracks.push(Track {
            id,
            start,
            segment: padded,
            ended: false,
        });
        let index = self.tracks.len() - 1;
        Ok(&mut self.tracks[index])
    }

    pub fn find_track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn find_track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|track| track.id == id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.iter()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> + '_ {
        self.tracks.iter_mut()
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn max_track_id(&self) -> Option<TrackId> {
        self.tracks.iter().map(Track::id).max()
    }

    pub fn known_tracks_time(&self) -> StreamTime {
        self.known_tracks_time
    }

    pub fn forgotten_time(&self) -> StreamTime {
        self.forgotten_time
    }

    /// Promise that no track will be added that starts before `time`.
    pub fn advance_known_tracks_time(&mut self, time: StreamTime) -> Result<()> {
        if time < self.known_tracks_time {
            return Err(Error::TimeRegression {
                known: self.known_tracks_time,
                time,
            });
        }
        self.known_tracks_time = time;
        Ok(())
    }

    /// The earliest time at which some buffered data might be missing.
    pub fn end(&self) -> StreamTime {
        self.tracks
            .iter()
            .filter(|track| !track.ended)
            .map(Track::end)
            .fold(self.known_tracks_time, StreamTime::min)
    }

    /// The end of the last track once every track has ended and no more can be added, otherwise
    /// [STREAM_TIME_MAX].
    pub fn all_tracks_end(&self) -> StreamTime {
        if self.known_tracks_time < STREAM_TIME_MAX {
            return STREAM_TIME_MAX;
        }
        let mut end = 0;
        for track in &self.tracks {
            if !track.ended {
                return STREAM_TIME_MAX;
            }
            end = end.max(track.end());
        }
        end
    }

    /// Release data before `time`. Ended tracks that lie wholly before `time` are removed.
    pub fn forget_up_to(&mut self, time: StreamTime) {
        if time <= self.forgotten_time {
            return;
        }
        self.forgotten_time = time;
        self.tracks.retain_mut(|track| {
            if track.ended && track.end() <= time {
                return false;
            }
            track.segment.forget_up_to(time);
            true
        });
    }
}
