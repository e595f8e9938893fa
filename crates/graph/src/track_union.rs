//! A processed stream containing every track of every input.
//!
//! Each input track is mapped to one output track. While the input is unblocked its data is
//! copied across, while it is blocked null data is written instead, so the output track always
//! keeps pace with this stream's own stream time.
use buffer::{MediaSegment, Track, TrackId};
use tracing::trace;
use util::{
    collections::{map, Set},
    time::{GraphTime, STREAM_TIME_MAX},
};

use crate::{
    listener::TrackEvents,
    port::PortId,
    transform::{InputView, ProcessContext, Transform},
    Result, StreamId,
};

struct TrackMapEntry {
    port: PortId,
    source: StreamId,
    input_track: TrackId,
    output_track: TrackId,
    segment: MediaSegment,
}

#[derive(Default)]
pub struct TrackUnion {
    map: Vec<TrackMapEntry>,
    used_ids: Set<TrackId>,
}

impl TrackUnion {
    pub fn new() -> Self {
        Self {
            map: vec![],
            used_ids: map::set(),
        }
    }

    /// The input's own id if no output track ever used it, otherwise one more than the highest
    /// id used so far.
    fn allocate_id(&mut self, input_id: TrackId) -> TrackId {
        let id = if self.used_ids.contains(&input_id) {
            self.used_ids
                .iter()
                .max()
                .map_or(0, |max| max.saturating_add(1))
        } else {
            input_id
        };
        self.used_ids.insert(id);
        id
    }

    fn add_track(
        &mut self,
        cx: &mut ProcessContext<'_>,
        input: &InputView<'_>,
        track: &Track,
        from: GraphTime,
    ) -> Result<usize> {
        let id = self.allocate_id(track.id());
        let start = cx.graph_time_to_stream_time(from);
        let empty = track.segment().empty_like();
        cx.notify_queued_track_changes(id, start, TrackEvents::CREATED, &empty);
        cx.buffer_mut().add_track(id, start, empty.clone())?;
        trace!(stream = ?cx.id(), input = track.id(), output = id, start, "union track added");
        self.map.push(TrackMapEntry {
            port: input.port_id(),
            source: input.source_id(),
            input_track: track.id(),
            output_track: id,
            segment: empty,
        });
        Ok(self.map.len() - 1)
    }

    fn end_track(&self, cx: &mut ProcessContext<'_>, index: usize) {
        let id = self.map[index].output_track;
        let Some(track) = cx.buffer().find_track(id) else {
            return;
        };
        if track.is_ended() {
            return;
        }
        let end = track.end();
        let empty = track.segment().empty_like();
        cx.notify_queued_track_changes(id, end, TrackEvents::ENDED, &empty);
        if let Some(track) = cx.buffer_mut().find_track_mut(id) {
            track.set_ended();
        }
    }

    /// Copy `[from, to)` of `track` into its output track. Returns true once the input track has
    /// ended and all of its data has been copied.
    fn copy_track_data(
        &mut self,
        cx: &mut ProcessContext<'_>,
        input: &InputView<'_>,
        track: &Track,
        index: usize,
        from: GraphTime,
        to: GraphTime,
    ) -> Result<bool> {
        let entry = &mut self.map[index];
        let mut finished = false;
        let mut t = from;
        while t < to {
            let interval = input.next_input_interval(t);
            let end = interval.end.min(to);
            let input_end = input.graph_time_to_stream_time(end);
            let mut end_point = STREAM_TIME_MAX;
            if track.is_ended() && track.end() <= input_end {
                end_point = track.end();
                finished = true;
            }
            if interval.start >= end {
                break;
            }
            let ticks = end - interval.start;
            t = end;
            let Some(output) = cx.buffer().find_track(entry.output_track) else {
                break;
            };
            let output_start = output.end();
            if interval.input_is_blocked {
                entry.segment.append_null(ticks);
            } else {
                let input_start = input_end - ticks;
                if input_start < 0 {
                    entry.segment.append_null(-input_start);
                }
                entry.segment.append_slice(
                    track.segment(),
                    input_start.max(0).min(end_point),
                    input_end.min(end_point),
                )?;
            }
            if cx.is_track_disabled(entry.output_track) {
                entry.segment.replace_with_disabled();
            }
            cx.notify_queued_track_changes(
                entry.output_track,
                output_start,
                TrackEvents::NONE,
                &entry.segment,
            );
            if let Some(output) = cx.buffer_mut().find_track_mut(entry.output_track) {
                output.append(&mut entry.segment)?;
            }
        }
        Ok(finished)
    }
}

impl Transform for TrackUnion {
    fn process_input(
        &mut self,
        cx: &mut ProcessContext<'_>,
        from: GraphTime,
        to: GraphTime,
    ) -> Result<()> {
        if cx.is_finished() {
            return Ok(());
        }
        let inputs = cx.inputs().to_vec();
        let mut finished = vec![true; self.map.len()];
        let mut matched = vec![false; self.map.len()];
        let mut all_finished = !inputs.is_empty();
        let mut all_have_data = !inputs.is_empty();
        let mut added = false;

        for input in &inputs {
            all_finished &= input.is_finished();
            all_have_data &= input.has_current_data();
            for track in input.buffer().tracks() {
                let existing = self
                    .map
                    .iter()
                    .position(|entry| entry.port == input.port_id() && entry.input_track == track.id());
                let index = match existing {
                    Some(index) => index,
                    None => {
                        added = true;
                        finished.push(false);
                        matched.push(false);
                        self.add_track(cx, input, track, from)?
                    }
                };
                matched[index] = true;
                let live = cx
                    .buffer()
                    .find_track(self.map[index].output_track)
                    .is_some_and(|output| !output.is_ended());
                finished[index] = !live || self.copy_track_data(cx, input, track, index, from, to)?;
            }
        }

        for index in (0..self.map.len()).rev() {
            if finished[index] {
                self.end_track(cx, index);
            } else {
                all_finished = false;
            }
            if !matched[index] {
                self.map.remove(index);
            }
        }

        if all_finished && cx.autofinish() && cx.allow_finish() {
            cx.finish()?;
        } else {
            let known = cx
                .buffer()
                .known_tracks_time()
                .max(cx.graph_time_to_stream_time(to));
            cx.buffer_mut().advance_known_tracks_time(known)?;
        }
        if all_have_data {
            cx.set_has_current_data();
        }
        if added {
            cx.notify_finished_track_creation();
        }
        Ok(())
    }

    fn forward_track_enabled(
        &mut self,
        track: TrackId,
        _enabled: bool,
    ) -> Option<(StreamId, TrackId)> {
        self.map
            .iter()
            .find(|entry| entry.output_track == track)
            .map(|entry| (entry.source, entry.input_track))
    }
}
