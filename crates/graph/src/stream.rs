//! Streams as the graph thread sees them.
//!
//! A stream's buffer is addressed in stream time. `buffer_start_time` is the graph time at which
//! stream time 0 would have been, had the stream never been blocked before the current time.
//! Conversions between the two domains walk the stream's blocked intervals.
use std::sync::Arc;

use buffer::{StreamBuffer, TrackId, VideoFrame};
use util::{
    collections::{map, Key, Set},
    time::{GraphTime, StreamTime, GRAPH_TIME_MAX, STREAM_TIME_MAX},
    TimeVarying,
};

use crate::{
    listener::{Consumption, MediaStreamListener},
    output::VideoFrameContainer,
    port::PortId,
    source::SourceInput,
    state::{StateEvent, StreamState},
    transform::Transform,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) Key);

impl StreamId {
    pub(crate) fn index(self) -> usize {
        self.0.index()
    }
}

/// The two times that bound what the graph has decided.
///
/// Everything before `current_time` has been played. Blocking has been decided up to
/// `state_computed_time`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Clock {
    pub(crate) current_time: GraphTime,
    pub(crate) state_computed_time: GraphTime,
}

#[derive(Clone, Debug)]
pub(crate) struct AudioOutput {
    pub(crate) key: u64,
    pub(crate) volume: f32,
}

pub(crate) enum Kind {
    Source(Arc<SourceInput>),
    Processed(Processed),
}

pub(crate) struct Processed {
    pub(crate) transform: Option<Box<dyn Transform>>,
    pub(crate) inputs: Vec<PortId>,
    pub(crate) autofinish: bool,
    pub(crate) in_muted_cycle: bool,
}

pub(crate) struct Stream {
    pub(crate) kind: Kind,
    pub(crate) buffer: StreamBuffer,
    pub(crate) state: StreamState,
    pub(crate) blocked: TimeVarying<bool>,
    pub(crate) explicit_blockers: TimeVarying<i32>,
    pub(crate) user_blocked: bool,
    pub(crate) update_indices: TimeVarying<i64>,
    pub(crate) buffer_start_time: GraphTime,
    pub(crate) finished: bool,
    pub(crate) notified_finished: bool,
    pub(crate) notified_blocked: bool,
    pub(crate) has_current_data: bool,
    pub(crate) notified_has_current_data: bool,
    pub(crate) failed: bool,
    pub(crate) consumed: bool,
    pub(crate) last_consumption: Consumption,
    pub(crate) listeners: Vec<Arc<dyn MediaStreamListener>>,
    pub(crate) audio_outputs: Vec<AudioOutput>,
    pub(crate) video_outputs: Vec<VideoFrameContainer>,
    pub(crate) last_played_video_frame: Option<VideoFrame>,
    pub(crate) disabled_tracks: Set<TrackId>,
    pub(crate) consumers: Vec<PortId>,
}

impl Processed {
    pub(crate) fn new(transform: Box<dyn Transform>) -> Self {
        Self {
            transform: Some(transform),
            inputs: vec![],
            autofinish: false,
            in_muted_cycle: false,
        }
    }
}

impl Stream {
    pub(crate) fn new(kind: Kind, created_at: GraphTime) -> Self {
        Self {
            kind,
            buffer: StreamBuffer::new(),
            state: StreamState::Blocked,
            blocked: TimeVarying::new(true),
            explicit_blockers: TimeVarying::new(0),
            user_blocked: false,
            update_indices: TimeVarying::new(0),
            buffer_start_time: created_at,
            finished: false,
            notified_finished: false,
            notified_blocked: true,
            has_current_data: false,
            notified_has_current_data: false,
            failed: false,
            consumed: false,
            last_consumption: Consumption::NotConsumed,
            listeners: vec![],
            audio_outputs: vec![],
            video_outputs: vec![],
            last_played_video_frame: None,
            disabled_tracks: map::set(),
            consumers: vec![],
        }
    }

    pub(crate) fn source(&self) -> Option<&Arc<SourceInput>> {
        match &self.kind {
            Kind::Source(input) => Some(input),
            Kind::Processed(_) => None,
        }
    }

    pub(crate) fn as_processed(&self) -> Option<&Processed> {
        match &self.kind {
            Kind::Processed(processed) => Some(processed),
            Kind::Source(_) => None,
        }
    }

    pub(crate) fn as_processed_mut(&mut self) -> Option<&mut Processed> {
        match &mut self.kind {
            Kind::Processed(processed) => Some(processed),
            Kind::Source(_) => None,
        }
    }

    pub(crate) fn inputs(&self) -> &[PortId] {
        self.as_processed()
            .map_or(&[], |processed| processed.inputs.as_slice())
    }

    pub(crate) fn apply(&mut self, event: StateEvent) {
        self.state = self.state.on(event);
    }

    /// Summed volume of every audio output.
    pub(crate) fn audio_volume(&self) -> f32 {
        self.audio_outputs.iter().map(|output| output.volume).sum()
    }

    /// Stream time at graph time `time`. Times past the state-computed time are clamped to it.
    pub(crate) fn graph_time_to_stream_time(&self, clock: Clock, time: GraphTime) -> StreamTime {
        if time <= clock.current_time {
            return (time - self.buffer_start_time).max(0);
        }
        let target = time.min(clock.state_computed_time);
        let mut t = clock.current_time;
        let mut s = t - self.buffer_start_time;
        while t < target {
            let (blocked, end) = self.blocked.get_with_end(t);
            let end = end.min(target);
            if !blocked {
                s += end - t;
            }
            t = end;
        }
        s.max(0)
    }

    /// Like [Stream::graph_time_to_stream_time], but assumes the stream is unblocked after the
    /// state-computed time.
    pub(crate) fn graph_time_to_stream_time_optimistic(
        &self,
        clock: Clock,
        time: GraphTime,
    ) -> StreamTime {
        let computed = time.min(clock.state_computed_time);
        self.graph_time_to_stream_time(clock, computed) + (time - computed)
    }

    /// The graph time at which stream time `time` is reached, assuming the stream is unblocked
    /// after the state-computed time. With `include_trailing_blocked` the result is pushed past
    /// any blocked interval that starts exactly there.
    pub(crate) fn stream_time_to_graph_time(
        &self,
        clock: Clock,
        time: StreamTime,
        include_trailing_blocked: bool,
    ) -> GraphTime {
        if time >= STREAM_TIME_MAX {
            return GRAPH_TIME_MAX;
        }
        let elapsed = clock.current_time - self.buffer_start_time;
        if time < elapsed || (time == elapsed && !include_trailing_blocked) {
            return time + self.buffer_start_time;
        }
        let mut remaining = time - elapsed;
        let mut t = clock.current_time;
        while t < GRAPH_TIME_MAX {
            if !include_trailing_blocked && remaining == 0 {
                return t;
            }
            let (blocked, end) = if t < clock.state_computed_time {
                let (blocked, end) = self.blocked.get_with_end(t);
                (blocked, end.min(clock.state_computed_time))
            } else {
                (false, GRAPH_TIME_MAX)
            };
            if blocked {
                t = end;
            } else {
                if remaining == 0 {
                    break;
                }
                let consume = (end - t).min(remaining);
                remaining -= consume;
                t += consume;
            }
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{ProcessContext, Transform};

    struct Idle;

    impl Transform for Idle {
        fn process_input(
            &mut self,
            _cx: &mut ProcessContext<'_>,
            _from: GraphTime,
            _to: GraphTime,
        ) -> crate::Result<()> {
            Ok(())
        }
    }

    /// A stream created at 0, blocked during [100, 200) and [300, 350), unblocked elsewhere.
    fn stream() -> Stream {
        let mut stream = Stream::new(Kind::Processed(Processed::new(Box::new(Idle))), 0);
        stream.blocked.set_from(0, false).unwrap();
        stream.blocked.set_from(100, true).unwrap();
        stream.blocked.set_from(200, false).unwrap();
        stream.blocked.set_from(300, true).unwrap();
        stream.blocked.set_from(350, false).unwrap();
        stream
    }

    const CLOCK: Clock = Clock {
        current_time: 0,
        state_computed_time: 400,
    };

    #[test]
    fn graph_to_stream_skips_blocked_time() {
        let stream = stream();
        assert_eq!(stream.graph_time_to_stream_time(CLOCK, 50), 50);
        assert_eq!(stream.graph_time_to_stream_time(CLOCK, 150), 100);
        assert_eq!(stream.graph_time_to_stream_time(CLOCK, 250), 150);
        assert_eq!(stream.graph_time_to_stream_time(CLOCK, 400), 250);
        assert_eq!(stream.graph_time_to_stream_time(CLOCK, 500), 250);
        assert_eq!(stream.graph_time_to_stream_time_optimistic(CLOCK, 500), 350);
    }

    #[test]
    fn stream_to_graph_inverts_and_handles_trailing_blocks() {
        let stream = stream();
        assert_eq!(stream.stream_time_to_graph_time(CLOCK, 50, false), 50);
        assert_eq!(stream.stream_time_to_graph_time(CLOCK, 100, false), 100);
        assert_eq!(stream.stream_time_to_graph_time(CLOCK, 100, true), 200);
        assert_eq!(stream.stream_time_to_graph_time(CLOCK, 150, false), 250);
        assert_eq!(stream.stream_time_to_graph_time(CLOCK, 260, false), 410);
        assert_eq!(
            stream.stream_time_to_graph_time(CLOCK, STREAM_TIME_MAX, false),
            GRAPH_TIME_MAX
        );
        for t in [0, 37, 99, 150, 200, 249] {
            let g = stream.stream_time_to_graph_time(CLOCK, t, false);
            assert_eq!(stream.graph_time_to_stream_time(CLOCK, g), t);
        }
    }

    #[test]
    fn times_before_the_current_time_use_the_buffer_start() {
        let mut stream = stream();
        stream.buffer_start_time = 40;
        let clock = Clock {
            current_time: 100,
            state_computed_time: 400,
        };
        assert_eq!(stream.graph_time_to_stream_time(clock, 90), 50);
        assert_eq!(stream.graph_time_to_stream_time(clock, 20), 0);
        assert_eq!(stream.stream_time_to_graph_time(clock, 30, false), 70);
    }
}
