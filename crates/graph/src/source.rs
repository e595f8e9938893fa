//! Producer-side ingestion for source streams.
//!
//! Producers append into a per-source [PendingInput] guarded by its own mutex. The graph thread
//! moves pending data into the stream's buffer once per iteration. The source mutex is always
//! taken before the graph's monitor, never after.
use std::{ops::BitOr, sync::Arc};

use buffer::{AudioSegment, MediaSegment, TrackId};
use parking_lot::Mutex;
use tracing::{debug, warn};
use util::{
    collections::{map, Set},
    time::{rate_convert_round, rate_convert_round_down, GraphTime, StreamTime, TrackRate},
    TimeError,
};

use crate::{
    driver::Waker,
    engine::Engine,
    listener::{same_listener, DirectListener, Notification, TrackEvents},
    message::{Command, Message},
    resample::TrackResampler,
    Error, Result, StreamId,
};

/// Options for [SourceInput::add_track].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AddTrackFlags(u8);

impl AddTrackFlags {
    pub const NONE: Self = Self(0);
    /// Hold the track back until [SourceInput::finish_add_tracks].
    pub const QUEUED: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AddTrackFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The producer-facing half of a source stream.
pub struct SourceInput {
    id: StreamId,
    graph_rate: TrackRate,
    waker: Arc<Waker>,
    pub(crate) state: Mutex<PendingInput>,
}

pub(crate) struct PendingInput {
    pub(crate) update_tracks: Vec<TrackData>,
    pub(crate) pending_tracks: Vec<TrackData>,
    pub(crate) update_known_tracks_time: StreamTime,
    pub(crate) pull_enabled: bool,
    pub(crate) update_finished: bool,
    pub(crate) destroyed: bool,
    pub(crate) direct_listeners: Vec<Arc<dyn DirectListener>>,
    pub(crate) disabled_tracks: Set<TrackId>,
    used_ids: Set<TrackId>,
}

pub(crate) struct TrackData {
    pub(crate) id: TrackId,
    input_rate: TrackRate,
    pub(crate) start: StreamTime,
    /// Stream time at which the data in `data` begins.
    pub(crate) end_of_flushed_data: StreamTime,
    pub(crate) events: TrackEvents,
    pub(crate) data: MediaSegment,
    resampler: Option<TrackResampler>,
    /// Null input frames seen before the first audible segment, and the graph ticks they
    /// became.
    silence_in: i64,
    silence_out: i64,
    pub(crate) have_enough: bool,
    pub(crate) dispatch_when_not_enough: Vec<Box<dyn FnOnce() + Send>>,
}

impl TrackData {
    fn resample(&mut self, segment: MediaSegment, graph_rate: TrackRate) -> Result<MediaSegment> {
        let audio = match segment {
            MediaSegment::Audio(audio) if self.input_rate != graph_rate => audio,
            other => return Ok(other),
        };
        if self.resampler.is_none() {
            let channels = audio.channel_count();
            if channels == 0 {
                self.silence_in += audio.duration();
                return Ok(self.release_silence(graph_rate, rate_convert_round_down).into());
            }
            let mut resampler = TrackResampler::new(self.input_rate, graph_rate, channels)?;
            resampler.skip_leading(self.silence_in, self.silence_out);
            self.resampler = Some(resampler);
        }
        let Some(resampler) = &mut self.resampler else {
            return Ok(audio.into());
        };
        Ok(resampler.process(&audio)?.into())
    }

    /// Null data for the converted silence not yet handed out.
    fn release_silence(
        &mut self,
        graph_rate: TrackRate,
        convert: fn(TrackRate, TrackRate, i64) -> i64,
    ) -> AudioSegment {
        let expected = convert(graph_rate, self.input_rate, self.silence_in);
        let mut silence = AudioSegment::new();
        silence.append_null((expected - self.silence_out).max(0));
        self.silence_out = self.silence_out.max(expected);
        silence
    }

    fn end_of_appended_data(&self) -> StreamTime {
        self.end_of_flushed_data + self.data.duration()
    }
}

impl PendingInput {
    fn new() -> Self {
        Self {
            update_tracks: vec![],
            pending_tracks: vec![],
            update_known_tracks_time: 0,
            pull_enabled: false,
            update_finished: false,
            destroyed: false,
            direct_listeners: vec![],
            disabled_tracks: map::set(),
            used_ids: map::set(),
        }
    }

    fn find_track_mut(&mut self, id: TrackId) -> Option<&mut TrackData> {
        self.update_tracks
            .iter_mut()
            .chain(self.pending_tracks.iter_mut())
            .find(|data| data.id == id)
    }

    fn find_track(&self, id: TrackId) -> Option<&TrackData> {
        self.update_tracks
            .iter()
            .chain(self.pending_tracks.iter())
            .find(|data| data.id == id)
    }

    fn is_closed(&self) -> bool {
        self.update_finished || self.destroyed
    }
}

impl SourceInput {
    pub(crate) fn new(id: StreamId, graph_rate: TrackRate, waker: Arc<Waker>) -> Self {
        Self {
            id,
            graph_rate,
            waker,
            state: Mutex::new(PendingInput::new()),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn graph_rate(&self) -> TrackRate {
        self.graph_rate
    }

    /// Add a track whose data is at the graph rate, starting at stream time `start`.
    pub fn add_track(
        &self,
        id: TrackId,
        start: StreamTime,
        segment: impl Into<MediaSegment>,
        flags: AddTrackFlags,
    ) -> Result<()> {
        self.add_track_at_rate(id, self.graph_rate, start, segment.into(), flags)
    }

    /// Add an audio track whose data is sampled at `rate`. `start` is in graph ticks.
    pub fn add_audio_track(
        &self,
        id: TrackId,
        rate: TrackRate,
        start: StreamTime,
        segment: AudioSegment,
        flags: AddTrackFlags,
    ) -> Result<()> {
        self.add_track_at_rate(id, rate, start, segment.into(), flags)
    }

    fn add_track_at_rate(
        &self,
        id: TrackId,
        rate: TrackRate,
        start: StreamTime,
        segment: MediaSegment,
        flags: AddTrackFlags,
    ) -> Result<()> {
        if rate == 0 {
            return Err(Error::InvalidConfig("track rate must be positive".into()));
        }
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(Error::Finished);
        }
        if state.used_ids.contains(&id) {
            return Err(Error::TrackExists(id));
        }
        let mut data = TrackData {
            id,
            input_rate: rate,
            start,
            end_of_flushed_data: start,
            events: TrackEvents::CREATED,
            data: segment.empty_like(),
            resampler: None,
            silence_in: 0,
            silence_out: 0,
            have_enough: false,
            dispatch_when_not_enough: vec![],
        };
        let mut segment = data.resample(segment, self.graph_rate)?;
        if state.disabled_tracks.contains(&id) {
            segment.replace_with_disabled();
        }
        data.data.append_from(&mut segment)?;
        state.used_ids.insert(id);
        debug!(stream = ?self.id, track = id, rate, start, "add track");
        if flags.contains(AddTrackFlags::QUEUED) {
            state.pending_tracks.push(data);
            return Ok(());
        }
        state.update_tracks.push(data);
        drop(state);
        self.waker.ensure_next_iteration();
        Ok(())
    }

    /// Release every track added with [AddTrackFlags::QUEUED] so they are created together.
    pub fn finish_add_tracks(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_tracks);
        state.update_tracks.extend(pending);
        drop(state);
        self.waker.ensure_next_iteration();
    }

    /// Append `segment` to track `id`. Returns false, dropping the data, if the track is unknown
    /// or ended, the stream has finished, or the graph is no longer running.
    pub fn append_to_track(&self, id: TrackId, segment: impl Into<MediaSegment>) -> bool {
        let mut segment = segment.into();
        let mut state = self.state.lock();
        if state.is_closed() || !self.waker.is_running() {
            return false;
        }
        let disabled = state.disabled_tracks.contains(&id);
        let listeners = state.direct_listeners.clone();
        let Some(data) = state.find_track_mut(id) else {
            return false;
        };
        if data.events.contains(TrackEvents::ENDED) {
            return false;
        }
        if disabled {
            segment.replace_with_disabled();
        }
        segment = match data.resample(segment, self.graph_rate) {
            Ok(segment) => segment,
            Err(error) => {
                warn!(stream = ?self.id, track = id, %error, "dropping unresampleable data");
                return false;
            }
        };
        let offset = data.end_of_appended_data();
        let events = data.events;
        let notified = (!listeners.is_empty()).then(|| segment.clone());
        if let Err(error) = data.data.append_from(&mut segment) {
            debug!(stream = ?self.id, track = id, %error, "append rejected");
            return false;
        }
        drop(state);
        if let Some(notified) = notified {
            for listener in &listeners {
                listener.notify_realtime_data(id, offset, events, &notified);
            }
        }
        self.waker.ensure_next_iteration();
        true
    }

    /// Whether track `id` has buffered far enough ahead of the current time. Unknown tracks
    /// never have enough.
    pub fn have_enough_buffered(&self, id: TrackId) -> bool {
        self.state
            .lock()
            .find_track(id)
            .is_some_and(|data| data.have_enough)
    }

    /// Stream time at the end of everything appended to track `id` so far.
    pub fn end_of_appended_data(&self, id: TrackId) -> Result<StreamTime> {
        self.state
            .lock()
            .find_track(id)
            .map(TrackData::end_of_appended_data)
            .ok_or(Error::UnknownTrack(id))
    }

    /// Run `callback` on the graph thread as soon as track `id` no longer has enough buffered.
    /// Runs it immediately if that is already the case, or if the track is unknown.
    pub fn dispatch_when_not_enough_buffered(
        &self,
        id: TrackId,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let mut state = self.state.lock();
        if let Some(data) = state.find_track_mut(id) {
            if data.have_enough {
                data.dispatch_when_not_enough.push(Box::new(callback));
                return;
            }
        }
        drop(state);
        callback();
    }

    /// Mark track `id` as ended. Pending resampler output is flushed first.
    pub fn end_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        let data = state.find_track_mut(id).ok_or(Error::UnknownTrack(id))?;
        end_track_data(data, self.graph_rate)?;
        drop(state);
        self.waker.ensure_next_iteration();
        Ok(())
    }

    /// Promise that no track will be added that starts before `time`.
    pub fn advance_known_tracks_time(&self, time: StreamTime) -> Result<()> {
        let mut state = self.state.lock();
        if time < state.update_known_tracks_time {
            return Err(TimeError::OutOfOrder {
                time,
                last: state.update_known_tracks_time,
            }
            .into());
        }
        state.update_known_tracks_time = time;
        drop(state);
        self.waker.ensure_next_iteration();
        Ok(())
    }

    /// Finish the stream once every track has ended. Finishing twice is a no-op.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.update_finished {
            return Ok(());
        }
        let unended = state
            .update_tracks
            .iter()
            .chain(state.pending_tracks.iter())
            .any(|data| !data.events.contains(TrackEvents::ENDED));
        if unended {
            return Err(Error::TracksNotEnded);
        }
        state.update_finished = true;
        drop(state);
        debug!(stream = ?self.id, "finish requested");
        self.waker.ensure_next_iteration();
        Ok(())
    }

    /// End every track, drop queued tracks that were never released, and finish.
    pub fn end_all_tracks_and_finish(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pending_tracks.clear();
        for data in &mut state.update_tracks {
            end_track_data(data, self.graph_rate)?;
        }
        state.update_finished = true;
        drop(state);
        self.waker.ensure_next_iteration();
        Ok(())
    }

    /// Whether listeners are asked to pull data. A pull already in flight when pulling is
    /// disabled may still arrive.
    pub fn set_pull_enabled(&self, enabled: bool) {
        self.state.lock().pull_enabled = enabled;
        if enabled {
            self.waker.ensure_next_iteration();
        }
    }

    pub fn add_direct_listener(&self, listener: Arc<dyn DirectListener>) {
        let mut state = self.state.lock();
        let first = state.direct_listeners.is_empty();
        state.direct_listeners.push(listener);
        drop(state);
        if first {
            self.direct_listeners_changed(true);
        }
    }

    pub fn remove_direct_listener(&self, listener: &Arc<dyn DirectListener>) {
        let mut state = self.state.lock();
        let before = state.direct_listeners.len();
        state
            .direct_listeners
            .retain(|existing| !same_listener(existing, listener));
        let now_empty = before > 0 && state.direct_listeners.is_empty();
        drop(state);
        if now_empty {
            self.direct_listeners_changed(false);
        }
    }

    fn direct_listeners_changed(&self, present: bool) {
        let message = Message::DirectListenersChanged {
            stream: self.id,
            present,
        };
        if !self.waker.send(Command::Batch(vec![message])) {
            debug!(stream = ?self.id, "graph gone, direct listener change dropped");
        }
    }
}

fn end_track_data(data: &mut TrackData, graph_rate: TrackRate) -> Result<()> {
    if data.events.contains(TrackEvents::ENDED) {
        return Ok(());
    }
    let mut tail = if let Some(resampler) = &mut data.resampler {
        MediaSegment::from(resampler.flush()?)
    } else if data.input_rate != graph_rate && data.data.as_audio().is_some() {
        data.release_silence(graph_rate, rate_convert_round).into()
    } else {
        data.data.empty_like()
    };
    data.data.append_from(&mut tail)?;
    data.events |= TrackEvents::ENDED;
    Ok(())
}

impl Engine {
    /// Move data appended since the last iteration into the stream's buffer, asking pulling
    /// listeners for data up to `desired_end` first.
    pub(crate) fn extract_pending_input(&mut self, id: StreamId, desired_end: GraphTime) {
        let clock = self.clock();
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        let Some(input) = stream.source().cloned() else {
            return;
        };
        let mut state = input.state.lock();
        if state.pull_enabled
            && !state.update_finished
            && !stream.finished
            && !stream.listeners.is_empty()
        {
            let time = stream.graph_time_to_stream_time_optimistic(clock, desired_end);
            if time > stream.buffer.end() {
                drop(state);
                for listener in &stream.listeners {
                    listener.notify_pull(time);
                }
                state = input.state.lock();
            }
        }

        let mut created = false;
        let mut index = 0;
        while index < state.update_tracks.len() {
            let data = &mut state.update_tracks[index];
            let mut segment = data.data.take();
            let offset = data.end_of_flushed_data;
            data.end_of_flushed_data += segment.duration();
            if !stream.listeners.is_empty() {
                let notification = Notification::QueuedTrackChanges {
                    track: data.id,
                    offset,
                    events: data.events,
                    data: segment.clone(),
                };
                self.outbox.notify(&stream.listeners, notification);
            }
            if data.events.contains(TrackEvents::CREATED) {
                if let Err(error) = stream.buffer.add_track(data.id, data.start, segment) {
                    debug!(stream = ?id, track = data.id, %error, "track not created");
                }
                data.events.remove(TrackEvents::CREATED);
                created = true;
            } else if let Some(track) = stream.buffer.find_track_mut(data.id) {
                if let Err(error) = track.append(&mut segment) {
                    debug!(stream = ?id, track = data.id, %error, "data dropped");
                }
            }
            if data.events.contains(TrackEvents::ENDED) {
                if let Some(track) = stream.buffer.find_track_mut(data.id) {
                    track.set_ended();
                }
                state.update_tracks.remove(index);
            } else {
                index += 1;
            }
        }
        if created {
            self.outbox
                .notify(&stream.listeners, Notification::FinishedTrackCreation);
        }
        if !stream.finished {
            let known = state.update_known_tracks_time;
            if let Err(error) = stream.buffer.advance_known_tracks_time(known) {
                warn!(stream = ?id, %error, "known tracks time not advanced");
            }
        }
        let finish = state.update_finished;
        drop(state);
        if stream.buffer.end() > 0 {
            stream.has_current_data = true;
        }
        if finish {
            self.finish_stream(id);
        }
    }

    /// Refresh the have-enough flag of every track, queueing callbacks for tracks that ran low.
    pub(crate) fn update_buffer_sufficiency(&mut self, id: StreamId) {
        let clock = self.clock();
        let enough = self.options.enough_buffered_ticks();
        let Some(stream) = self.streams.get(id.0) else {
            return;
        };
        let Some(input) = stream.source() else {
            return;
        };
        let desired_end = stream.graph_time_to_stream_time(clock, clock.current_time) + enough;
        let mut state = input.state.lock();
        for data in &mut state.update_tracks {
            let events = data.events;
            if events.contains(TrackEvents::CREATED) || events.contains(TrackEvents::ENDED) {
                continue;
            }
            data.have_enough = data.end_of_flushed_data >= desired_end;
            if !data.have_enough {
                for callback in data.dispatch_when_not_enough.drain(..) {
                    self.outbox.defer(callback);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use approx::assert_abs_diff_eq;
    use buffer::AudioSegment;
    use util::time::STREAM_TIME_MAX;

    use super::AddTrackFlags;
    use crate::{
        testing::{constant, graph, step},
        Error,
    };

    #[test]
    fn track_ids_are_never_reused() {
        let (graph, _driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, constant(16, 0.0), AddTrackFlags::NONE)
            .unwrap();
        assert!(matches!(
            input.add_track(1, 0, constant(16, 0.0), AddTrackFlags::NONE),
            Err(Error::TrackExists(1))
        ));
        assert!(matches!(input.end_track(2), Err(Error::UnknownTrack(2))));
    }

    #[test]
    fn finishing_requires_ended_tracks() {
        let (graph, _driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, constant(16, 0.0), AddTrackFlags::NONE)
            .unwrap();
        assert!(matches!(input.finish(), Err(Error::TracksNotEnded)));
        input.end_track(1).unwrap();
        input.finish().unwrap();
        input.finish().unwrap();
        assert!(!input.append_to_track(1, constant(16, 0.0)));
        assert!(matches!(
            input.add_track(2, 0, constant(16, 0.0), AddTrackFlags::NONE),
            Err(Error::Finished)
        ));
    }

    #[test]
    fn known_tracks_time_only_advances() {
        let (graph, _driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input.advance_known_tracks_time(100).unwrap();
        assert!(input.advance_known_tracks_time(50).is_err());
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
    }

    #[test]
    fn queued_tracks_wait_for_release() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, constant(4800, 0.0), AddTrackFlags::QUEUED)
            .unwrap();
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
        step(&graph, &mut driver, 1280);
        let stream = driver.engine.streams.get(source.id().0).unwrap();
        assert!(stream.buffer.find_track(1).is_none());

        input.finish_add_tracks();
        step(&graph, &mut driver, 2560);
        let stream = driver.engine.streams.get(source.id().0).unwrap();
        assert!(stream.buffer.find_track(1).is_some());
    }

    #[test]
    fn resampled_tracks_end_at_the_converted_duration() {
        let (graph, _driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_audio_track(1, 44_100, 0, constant(600, 0.25), AddTrackFlags::NONE)
            .unwrap();
        assert!(input.append_to_track(1, constant(400, 0.25)));
        assert!(input.end_of_appended_data(1).unwrap() <= 1088);
        input.end_track(1).unwrap();
        assert_eq!(input.end_of_appended_data(1).unwrap(), 1088);
        assert!(!input.append_to_track(1, constant(1, 0.25)));
    }

    #[test]
    fn resampled_stereo_after_leading_silence_keeps_both_channels() {
        let (graph, _driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_audio_track(1, 44_100, 0, AudioSegment::new(), AddTrackFlags::NONE)
            .unwrap();
        let mut silence = AudioSegment::new();
        silence.append_null(441);
        assert!(input.append_to_track(1, silence));
        let stereo = AudioSegment::from_planar(vec![vec![0.5; 4410], vec![-0.5; 4410]]);
        assert!(input.append_to_track(1, stereo));
        input.end_track(1).unwrap();
        assert_eq!(input.end_of_appended_data(1).unwrap(), 5280);

        let state = input.state.lock();
        let track = state.find_track(1).unwrap();
        let planar = track.data.as_audio().unwrap().to_planar(2);
        assert_eq!(planar[0].len(), 5280);
        assert_abs_diff_eq!(planar[0][100], 0.0);
        assert_abs_diff_eq!(planar[1][100], 0.0);
        assert_abs_diff_eq!(planar[0][2500], 0.5, epsilon = 0.01);
        assert_abs_diff_eq!(planar[1][2500], -0.5, epsilon = 0.01);
    }

    #[test]
    fn not_enough_buffered_callbacks_run() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        input.dispatch_when_not_enough_buffered(9, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        input
            .add_track(1, 0, constant(9600, 0.0), AddTrackFlags::NONE)
            .unwrap();
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
        step(&graph, &mut driver, 1280);
        step(&graph, &mut driver, 2560);
        assert!(input.have_enough_buffered(1));

        let counter = calls.clone();
        input.dispatch_when_not_enough_buffered(1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for end in [3840, 5120, 6400] {
            step(&graph, &mut driver, end);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
