//! The graph thread's view of the graph.
//!
//! The engine owns every stream and port. It is only ever touched by the thread running the
//! [crate::driver::Driver], one iteration at a time:
//!
//! 1. advance the current time to the previous state-computed time,
//! 2. apply the control batches received since the last iteration,
//! 3. reorder streams and recompute consumption,
//! 4. pull source data and decide blocking up to the end of the iteration,
//! 5. run transforms block by block, then mix audio and pick video frames,
//! 6. publish the main-thread snapshot and deliver notifications.
use std::{mem, sync::Arc};

use buffer::{AudioSegment, MediaKind, TrackId};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};
use util::{
    cast_usize,
    collections::{Arena, KeyAllocator},
    time::{round_up_to_block, GraphTime, STREAM_TIME_MAX},
};

use crate::{
    graph::{Options, Snapshot, StreamSnapshot},
    listener::{Blocking, MediaStreamListener, Notification, Outbox, StreamEvent},
    message::Message,
    output::{AudioMixer, AudioSink},
    port::{Port, PortId},
    state::StateEvent,
    stream::{AudioOutput, Clock, Stream},
    transform::{InputView, ProcessContext},
    Result, StreamId,
};

pub(crate) struct Engine {
    pub(crate) options: Options,
    pub(crate) streams: Arena<Stream>,
    pub(crate) ports: Arena<Port>,
    pub(crate) order: Vec<StreamId>,
    pub(crate) order_dirty: bool,
    pub(crate) current_time: GraphTime,
    pub(crate) state_computed_time: GraphTime,
    pub(crate) update_index: i64,
    pub(crate) outbox: Outbox,
    mixer: AudioMixer,
    pub(crate) sink: Box<dyn AudioSink>,
    snapshot: triple_buffer::Input<Snapshot>,
    stream_keys: Arc<Mutex<KeyAllocator>>,
    port_keys: Arc<Mutex<KeyAllocator>>,
}

impl Engine {
    pub(crate) fn new(
        options: Options,
        sink: Box<dyn AudioSink>,
        snapshot: triple_buffer::Input<Snapshot>,
        stream_keys: Arc<Mutex<KeyAllocator>>,
        port_keys: Arc<Mutex<KeyAllocator>>,
    ) -> Result<Self> {
        let max_frames = cast_usize!(options.max_iteration_ticks());
        let mixer = AudioMixer::new(options.output_channels, max_frames)?;
        Ok(Self {
            options,
            streams: Arena::new(),
            ports: Arena::new(),
            order: vec![],
            order_dirty: false,
            current_time: 0,
            state_computed_time: 0,
            update_index: 0,
            outbox: Outbox::default(),
            mixer,
            sink,
            snapshot,
            stream_keys,
            port_keys,
        })
    }

    pub(crate) fn clock(&self) -> Clock {
        Clock {
            current_time: self.current_time,
            state_computed_time: self.state_computed_time,
        }
    }

    /// Run one iteration, deciding and processing graph time up to `end`.
    pub(crate) fn one_iteration(
        &mut self,
        end: GraphTime,
        batches: Vec<Vec<Message>>,
    ) -> Result<()> {
        let previous = self.state_computed_time;
        self.update_current_time_for_streams(self.current_time, previous);
        self.current_time = previous;

        for batch in batches {
            self.apply_batch(batch);
        }
        if self.order_dirty {
            self.update_stream_order();
        }
        self.update_consumption();

        let end = round_up_to_block(end, self.options.block_ticks()).max(previous);
        self.update_graph(end);
        self.process(previous, end);
        self.play_audio(previous, end)?;
        self.play_video();
        self.notify_has_current_data();
        self.publish();
        self.outbox.dispatch();
        Ok(())
    }

    fn apply_batch(&mut self, batch: Vec<Message>) {
        self.update_index += 1;
        let clock = self.clock();
        for message in batch {
            trace!(?message, index = self.update_index, "apply");
            let stream = message.stream();
            self.apply(message);
            let Some(stream) = stream.and_then(|id| self.streams.get_mut(id.0)) else {
                continue;
            };
            let time =
                stream.graph_time_to_stream_time_optimistic(clock, clock.state_computed_time);
            if let Err(error) = stream.update_indices.set_from(time, self.update_index) {
                warn!(%error, "update index out of order");
            }
        }
    }

    pub(crate) fn apply(&mut self, message: Message) {
        match message {
            Message::CreateStream { id, kind } => {
                debug!(stream = ?id, "create stream");
                self.streams.insert(id.0, Stream::new(kind, self.current_time));
                self.order_dirty = true;
            }
            Message::DestroyStream(id) => self.destroy_stream(id),
            Message::SetAutofinish { stream, autofinish } => {
                let processed = self.stream_mut(stream).and_then(Stream::as_processed_mut);
                if let Some(processed) = processed {
                    processed.autofinish = autofinish;
                }
            }
            Message::Finish(id) => self.force_finish(id),
            Message::CreatePort {
                id,
                source,
                dest,
                flags,
                input_number,
                output_number,
            } => {
                let connectable = self.streams.contains(source.0)
                    && self
                        .streams
                        .get(dest.0)
                        .is_some_and(|dest| dest.as_processed().is_some());
                if !connectable {
                    debug!(port = ?id, ?source, ?dest, "port endpoints gone, not connected");
                    self.port_keys.lock().free(id.0);
                    return;
                }
                self.ports.insert(
                    id.0,
                    Port {
                        source,
                        dest,
                        flags,
                        input_number,
                        output_number,
                    },
                );
                if let Some(source) = self.streams.get_mut(source.0) {
                    source.consumers.push(id);
                }
                if let Some(processed) = self
                    .streams
                    .get_mut(dest.0)
                    .and_then(Stream::as_processed_mut)
                {
                    processed.inputs.push(id);
                }
                debug!(port = ?id, ?source, ?dest, "connected");
                self.order_dirty = true;
            }
            Message::DestroyPort(id) => self.disconnect_port(id),
            Message::AddAudioOutput { stream, key } => {
                if let Some(stream) = self.stream_mut(stream) {
                    stream.audio_outputs.push(AudioOutput { key, volume: 1.0 });
                }
            }
            Message::SetAudioOutputVolume {
                stream,
                key,
                volume,
            } => {
                if let Some(stream) = self.stream_mut(stream) {
                    for output in &mut stream.audio_outputs {
                        if output.key == key {
                            output.volume = volume;
                        }
                    }
                }
            }
            Message::RemoveAudioOutput { stream, key } => {
                if let Some(stream) = self.stream_mut(stream) {
                    stream.audio_outputs.retain(|output| output.key != key);
                }
            }
            Message::AddVideoOutput { stream, container } => {
                if let Some(stream) = self.stream_mut(stream) {
                    stream.video_outputs.push(container);
                }
            }
            Message::RemoveVideoOutput { stream, container } => {
                if let Some(stream) = self.stream_mut(stream) {
                    stream.video_outputs.retain(|output| *output != container);
                }
            }
            Message::ChangeExplicitBlockerCount { stream, delta } => {
                self.change_explicit_blocker_count(stream, delta);
            }
            Message::SetUserBlocked { stream, blocked } => {
                let Some(target) = self.stream_mut(stream) else {
                    return;
                };
                if target.user_blocked != blocked {
                    target.user_blocked = blocked;
                    self.change_explicit_blocker_count(stream, if blocked { 1 } else { -1 });
                }
            }
            Message::AddListener { stream, listener } => self.add_listener(stream, listener),
            Message::RemoveListener { stream, listener } => {
                let Some(target) = self.streams.get_mut(stream.0) else {
                    debug!(?stream, "listener removed from unknown stream");
                    return;
                };
                let before = target.listeners.len();
                target
                    .listeners
                    .retain(|existing| !crate::listener::same_listener(existing, &listener));
                if target.listeners.len() < before {
                    self.outbox
                        .notify_one(listener, Notification::Event(StreamEvent::Removed));
                }
            }
            Message::SetTrackEnabled {
                stream,
                track,
                enabled,
            } => self.set_track_enabled(stream, track, enabled),
            Message::DirectListenersChanged { stream, present } => {
                let Some(target) = self.streams.get(stream.0) else {
                    return;
                };
                let event = if present {
                    StreamEvent::HasDirectListeners
                } else {
                    StreamEvent::HasNoDirectListeners
                };
                self.outbox
                    .notify(&target.listeners, Notification::Event(event));
            }
            Message::RunAfter(callback) => self.outbox.defer(callback),
        }
    }

    fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        let stream = self.streams.get_mut(id.0);
        if stream.is_none() {
            debug!(stream = ?id, "message for unknown stream ignored");
        }
        stream
    }

    fn change_explicit_blocker_count(&mut self, id: StreamId, delta: i32) {
        let time = self.state_computed_time;
        let Some(stream) = self.stream_mut(id) else {
            return;
        };
        let count = stream.explicit_blockers.get(time) + delta;
        if let Err(error) = stream.explicit_blockers.set_from(time, count) {
            warn!(stream = ?id, %error, "explicit blocker change out of order");
        }
    }

    /// New listeners learn the current blocking state right away, and whether the stream has
    /// already finished or has data.
    fn add_listener(&mut self, id: StreamId, listener: Arc<dyn MediaStreamListener>) {
        let Some(stream) = self.streams.get_mut(id.0) else {
            debug!(stream = ?id, "listener added to unknown stream");
            return;
        };
        let blocking = if stream.notified_blocked {
            Blocking::Blocked
        } else {
            Blocking::Unblocked
        };
        self.outbox
            .notify_one(listener.clone(), Notification::BlockingChanged(blocking));
        if stream.notified_finished {
            self.outbox.notify_one(
                listener.clone(),
                Notification::Event(StreamEvent::Finished),
            );
        }
        if stream.notified_has_current_data {
            self.outbox
                .notify_one(listener.clone(), Notification::HasCurrentData);
        }
        stream.listeners.push(listener);
    }

    pub(crate) fn set_track_enabled(&mut self, id: StreamId, track: TrackId, enabled: bool) {
        let Some(stream) = self.stream_mut(id) else {
            return;
        };
        let changed = if enabled {
            stream.disabled_tracks.remove(&track)
        } else {
            stream.disabled_tracks.insert(track)
        };
        if !changed {
            return;
        }
        if let Some(input) = stream.source() {
            let mut state = input.state.lock();
            if enabled {
                state.disabled_tracks.remove(&track);
            } else {
                state.disabled_tracks.insert(track);
            }
        }
        let forward = stream
            .as_processed_mut()
            .and_then(|processed| processed.transform.as_mut())
            .and_then(|transform| transform.forward_track_enabled(track, enabled));
        if let Some((source, input_track)) = forward {
            self.set_track_enabled(source, input_track, enabled);
        }
    }

    pub(crate) fn finish_stream(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        if stream.finished {
            return;
        }
        stream.finished = true;
        if let Err(error) = stream.buffer.advance_known_tracks_time(STREAM_TIME_MAX) {
            warn!(stream = ?id, %error, "known tracks time not advanced");
        }
        debug!(stream = ?id, end = stream.buffer.all_tracks_end(), "finished");
        self.order_dirty = true;
    }

    /// Finish a stream from the outside. Its tracks end where their data does.
    fn force_finish(&mut self, id: StreamId) {
        let Some(stream) = self.stream_mut(id) else {
            return;
        };
        if let Some(input) = stream.source() {
            input.state.lock().update_finished = true;
        }
        for track in stream.buffer.tracks_mut() {
            track.set_ended();
        }
        self.finish_stream(id);
    }

    pub(crate) fn destroy_stream(&mut self, id: StreamId) {
        let Some(mut stream) = self.streams.remove(id.0) else {
            debug!(stream = ?id, "already destroyed");
            return;
        };
        for port in stream.inputs().iter().chain(&stream.consumers) {
            self.disconnect_port(*port);
        }
        if let Some(input) = stream.source() {
            input.state.lock().destroyed = true;
        }
        stream.apply(StateEvent::Destroy);
        self.outbox
            .notify(&stream.listeners, Notification::Event(StreamEvent::Removed));
        self.stream_keys.lock().free(id.0);
        self.order_dirty = true;
        debug!(stream = ?id, "destroyed");
    }

    /// Remove a port. Either endpoint may already be gone.
    pub(crate) fn disconnect_port(&mut self, id: PortId) {
        let Some(port) = self.ports.remove(id.0) else {
            trace!(port = ?id, "already disconnected");
            return;
        };
        if let Some(processed) = self
            .streams
            .get_mut(port.dest.0)
            .and_then(Stream::as_processed_mut)
        {
            processed.inputs.retain(|input| *input != id);
        }
        if let Some(source) = self.streams.get_mut(port.source.0) {
            source.consumers.retain(|consumer| *consumer != id);
        }
        self.port_keys.lock().free(id.0);
        self.order_dirty = true;
        debug!(port = ?id, "disconnected");
    }

    /// Move every stream from `previous` to `next`, accounting for the time it spent blocked and
    /// telling listeners what happened along the way.
    pub(crate) fn update_current_time_for_streams(
        &mut self,
        previous: GraphTime,
        next: GraphTime,
    ) {
        for stream in self.streams.values_mut() {
            let mut blocked_time = 0;
            let mut t = previous;
            while t < next {
                let (blocked, end) = stream.blocked.get_with_end(t);
                let end = end.min(next);
                if blocked {
                    blocked_time += end - t;
                }
                if blocked != stream.notified_blocked {
                    stream.notified_blocked = blocked;
                    let (event, blocking) = if blocked {
                        (StateEvent::Block, Blocking::Blocked)
                    } else {
                        (StateEvent::Unblock, Blocking::Unblocked)
                    };
                    stream.apply(event);
                    self.outbox
                        .notify(&stream.listeners, Notification::BlockingChanged(blocking));
                }
                t = end;
            }

            stream.buffer_start_time += blocked_time;
            let stream_time = (next - stream.buffer_start_time).max(0);
            stream.update_indices.advance_current_time(stream_time);
            stream.explicit_blockers.advance_current_time(next);
            stream.blocked.advance_current_time(next);
            stream.buffer.forget_up_to(stream_time);

            if blocked_time < next - previous {
                self.outbox
                    .notify(&stream.listeners, Notification::Output(next));
            }

            let all_played = stream
                .buffer_start_time
                .saturating_add(stream.buffer.all_tracks_end());
            if stream.finished && !stream.notified_finished && all_played <= next {
                if !stream.notified_blocked {
                    stream.notified_blocked = true;
                    stream.apply(StateEvent::Block);
                    self.outbox.notify(
                        &stream.listeners,
                        Notification::BlockingChanged(Blocking::Blocked),
                    );
                }
                stream.notified_finished = true;
                stream.last_played_video_frame = None;
                stream.apply(StateEvent::Finish);
                self.order_dirty = true;
                self.outbox.notify(
                    &stream.listeners,
                    Notification::Event(StreamEvent::Finished),
                );
            }
        }
    }

    /// Pull source data and decide blocking up to `end`.
    fn update_graph(&mut self, end: GraphTime) {
        for index in 0..self.order.len() {
            let id = self.order[index];
            let is_source = self
                .streams
                .get(id.0)
                .is_some_and(|stream| stream.source().is_some());
            if is_source {
                self.extract_pending_input(id, end);
                self.update_buffer_sufficiency(id);
            }
        }
        self.recompute_blocking(end);
    }

    /// Run transforms over `[from, to)`, one block at a time.
    fn process(&mut self, from: GraphTime, to: GraphTime) {
        let block = self.options.block_ticks();
        let mut t = from;
        while t < to {
            let next = (t + block).min(to);
            let allow_finish = next >= self.state_computed_time;
            for index in 0..self.order.len() {
                let id = self.order[index];
                self.process_stream(id, t, next, allow_finish);
            }
            t = next;
        }
    }

    fn process_stream(
        &mut self,
        id: StreamId,
        from: GraphTime,
        to: GraphTime,
        allow_finish: bool,
    ) {
        let clock = self.clock();
        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        if stream.finished {
            return;
        }
        let Some(processed) = stream.as_processed_mut() else {
            return;
        };
        if processed.in_muted_cycle {
            pad_with_null(stream, clock, to);
            return;
        }
        let Some(mut transform) = processed.transform.take() else {
            return;
        };
        let mut buffer = mem::take(&mut stream.buffer);

        let mut outcome = None;
        if let Some(stream) = self.streams.get(id.0) {
            let inputs = stream
                .inputs()
                .iter()
                .filter_map(|port_id| {
                    let port = self.ports.get(port_id.0)?;
                    let source = self.streams.get(port.source.0)?;
                    Some(InputView {
                        port_id: *port_id,
                        port,
                        source,
                        dest: stream,
                        clock,
                    })
                })
                .collect();
            let mut cx = ProcessContext {
                id,
                stream,
                buffer: &mut buffer,
                inputs,
                clock,
                allow_finish,
                finish: false,
                has_current_data: false,
                outbox: &mut self.outbox,
            };
            let result = transform.process_input(&mut cx, from, to);
            outcome = Some((result, cx.finish, cx.has_current_data));
        }

        let Some(stream) = self.streams.get_mut(id.0) else {
            return;
        };
        stream.buffer = buffer;
        if let Some(processed) = stream.as_processed_mut() {
            processed.transform = Some(transform);
        }
        let Some((result, finish, has_current_data)) = outcome else {
            return;
        };
        if let Err(error) = result {
            error!(stream = ?id, from, to, %error, "transform failed");
            stream.failed = true;
            pad_with_null(stream, clock, to);
        }
        if has_current_data {
            stream.has_current_data = true;
        }
        if finish {
            self.finish_stream(id);
        }
    }

    /// Mix `[from, to)` of every stream with audio outputs and hand it to the sink.
    fn play_audio(&mut self, from: GraphTime, to: GraphTime) -> Result<()> {
        let clock = self.clock();
        let channels = self.mixer.channels();
        let output = self.mixer.begin(cast_usize!((to - from).max(0)))?;
        for (_, stream) in self.streams.iter() {
            if stream.audio_outputs.is_empty() {
                continue;
            }
            let volume = stream.audio_volume();
            let mut t = from;
            while t < to {
                let (blocked, end) = stream.blocked.get_with_end(t);
                let end = end.min(to);
                if !blocked {
                    let start = stream.graph_time_to_stream_time(clock, t);
                    let offset = cast_usize!(t - from) * channels;
                    for track in stream.buffer.tracks_of(MediaKind::Audio) {
                        if stream.disabled_tracks.contains(&track.id()) {
                            continue;
                        }
                        let Some(audio) = track.segment().as_audio() else {
                            continue;
                        };
                        let mut slice = AudioSegment::new();
                        slice.append_slice(audio, start, start + (end - t));
                        slice.mix_into(&mut output[offset..], channels, volume);
                    }
                }
                t = end;
            }
        }
        self.sink.write(output, channels, from);
        Ok(())
    }

    /// Show each stream's frame at the current time in its video outputs.
    fn play_video(&mut self) {
        let clock = self.clock();
        for stream in self.streams.values_mut() {
            if stream.video_outputs.is_empty() {
                continue;
            }
            let time = stream.graph_time_to_stream_time(clock, clock.current_time);
            let mut current = None;
            for track in stream.buffer.tracks_of(MediaKind::Video) {
                let Some(video) = track.segment().as_video() else {
                    continue;
                };
                if let Some((start, frame)) = video.frame_at(time) {
                    if !frame.is_null() {
                        let frame = if stream.disabled_tracks.contains(&track.id()) {
                            frame.to_black()
                        } else {
                            frame.clone()
                        };
                        current = Some((start, frame));
                    }
                }
            }
            let Some((start, frame)) = current else {
                continue;
            };
            if stream.last_played_video_frame.as_ref() == Some(&frame) {
                continue;
            }
            let at = stream.stream_time_to_graph_time(clock, start, true);
            for output in &stream.video_outputs {
                output.set_current_frame(frame.clone(), at);
            }
            if !stream.notified_finished {
                stream.last_played_video_frame = Some(frame);
            }
        }
    }

    fn notify_has_current_data(&mut self) {
        for stream in self.streams.values_mut() {
            if stream.has_current_data && !stream.notified_has_current_data {
                stream.notified_has_current_data = true;
                self.outbox
                    .notify(&stream.listeners, Notification::HasCurrentData);
            }
        }
    }

    fn publish(&mut self) {
        let clock = self.clock();
        let mut snapshot = Snapshot {
            graph_time: self.current_time,
            state_computed_time: self.state_computed_time,
            update_index: self.update_index,
            ..Snapshot::default()
        };
        for (key, stream) in self.streams.iter() {
            snapshot.streams.insert(
                StreamId(key),
                StreamSnapshot {
                    current_time: stream.graph_time_to_stream_time(clock, clock.current_time),
                    finished: stream.notified_finished,
                    blocked: stream.notified_blocked,
                    failed: stream.failed,
                    state: stream.state,
                },
            );
        }
        self.snapshot.write(snapshot);
    }

    /// Destroy every stream and deliver the resulting notifications.
    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<StreamId> = self.streams.keys().map(StreamId).collect();
        for id in ids {
            self.destroy_stream(id);
        }
        self.publish();
        self.outbox.dispatch();
    }
}

/// Pad every open track of `stream` with null data up to the stream time of `to`.
fn pad_with_null(stream: &mut Stream, clock: Clock, to: GraphTime) {
    let end = stream.graph_time_to_stream_time(clock, to);
    for track in stream.buffer.tracks_mut() {
        if track.is_ended() {
            continue;
        }
        let missing = end - track.end();
        if missing > 0 {
            track.segment_mut().append_null(missing);
        }
    }
    let known = stream.buffer.known_tracks_time().max(end);
    if let Err(error) = stream.buffer.advance_known_tracks_time(known) {
        warn!(%error, "known tracks time not advanced");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use buffer::MediaSegment;
    use parking_lot::Mutex;
    use util::time::{GraphTime, StreamTime, STREAM_TIME_MAX};

    use crate::{
        listener::{
            Blocking, Consumption, DirectListener, MainThreadListener, StreamEvent, TrackEvents,
        },
        port::PortFlags,
        source::AddTrackFlags,
        state::StreamState,
        stream::Stream,
        testing::{constant, graph, step, Recorded, Recorder},
        transform::{ProcessContext, Transform},
        Error, Result, StreamId,
    };

    struct Failing;

    impl Transform for Failing {
        fn process_input(
            &mut self,
            _cx: &mut ProcessContext<'_>,
            _from: GraphTime,
            _to: GraphTime,
        ) -> Result<()> {
            Err(Error::Transform("nothing to do".into()))
        }
    }

    #[test]
    fn listener_added_after_finish_learns_state() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, constant(1024, 0.1), AddTrackFlags::NONE)
            .unwrap();
        input.end_track(1).unwrap();
        input.finish().unwrap();
        step(&graph, &mut driver, 2560);
        step(&graph, &mut driver, 5120);
        assert!(source.is_finished());

        let recorder = Recorder::new();
        source.add_listener(recorder.clone());
        step(&graph, &mut driver, 7680);
        assert_eq!(
            recorder.take(),
            vec![
                Recorded::Blocking(Blocking::Blocked),
                Recorded::Event(StreamEvent::Finished),
                Recorded::HasCurrentData,
            ]
        );
    }

    #[test]
    fn listeners_receive_all_track_data_once_before_finish() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let recorder = Recorder::new();
        source.add_listener(recorder.clone());
        let input = source.input();
        input
            .add_audio_track(1, 44_100, 0, constant(600, 0.25), AddTrackFlags::NONE)
            .unwrap();
        step(&graph, &mut driver, 512);
        assert!(input.append_to_track(1, constant(400, 0.25)));
        step(&graph, &mut driver, 768);
        input.end_track(1).unwrap();
        input.finish().unwrap();
        for end in [1280, 2560, 3840] {
            step(&graph, &mut driver, end);
        }
        assert!(source.is_finished());

        let recorded = recorder.take();
        let finished = recorded
            .iter()
            .position(|event| *event == Recorded::Event(StreamEvent::Finished))
            .unwrap();
        let changes: Vec<_> = recorded
            .iter()
            .filter_map(|event| match event {
                Recorded::TrackChange {
                    track,
                    offset,
                    events,
                    duration,
                } => Some((*track, *offset, *events, *duration)),
                _ => None,
            })
            .collect();
        assert!(recorded[finished..]
            .iter()
            .all(|event| !matches!(event, Recorded::TrackChange { .. })));

        let mut end = 0;
        for (track, offset, _, duration) in &changes {
            assert_eq!(*track, 1);
            assert_eq!(*offset, end, "track data delivered out of order or twice");
            end += duration;
        }
        assert_eq!(end, 1088);
        assert!(changes[0].2.contains(TrackEvents::CREATED));
        let ended: Vec<_> = changes
            .iter()
            .filter(|change| change.2.contains(TrackEvents::ENDED))
            .collect();
        assert_eq!(ended.len(), 1);
    }

    #[test]
    fn failing_transform_is_isolated() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let failing = graph.create_processed_stream(Failing);
        let _port = failing.allocate_input_port(&source, PortFlags::NONE);
        let union = graph.create_track_union_stream();
        let _downstream = union.allocate_input_port(&failing, PortFlags::NONE);

        step(&graph, &mut driver, 2560);
        step(&graph, &mut driver, 3840);
        assert!(failing.has_failed());
        assert!(!union.has_failed());
        assert!(driver.step_to(5120).is_ok());
    }

    #[test]
    fn cycles_are_muted_until_broken() {
        let (graph, mut driver) = graph();
        let a = graph.create_track_union_stream();
        let b = graph.create_track_union_stream();
        let _ab = b.allocate_input_port(&a, PortFlags::NONE);
        let ba = a.allocate_input_port(&b, PortFlags::NONE);
        let muted = |driver: &crate::driver::Driver, id: crate::StreamId| {
            driver
                .engine
                .streams
                .get(id.0)
                .and_then(Stream::as_processed)
                .is_some_and(|processed| processed.in_muted_cycle)
        };

        step(&graph, &mut driver, 1280);
        assert!(muted(&driver, a.id()));
        assert!(muted(&driver, b.id()));

        ba.disconnect();
        step(&graph, &mut driver, 2560);
        assert!(!muted(&driver, a.id()));
        assert!(!muted(&driver, b.id()));
        let order = &driver.engine.order;
        let position = |id| order.iter().position(|other| *other == id);
        assert!(position(a.id()) < position(b.id()));
    }

    #[derive(Default)]
    struct FinishCount(AtomicUsize);

    impl MainThreadListener for FinishCount {
        fn notify_stream_finished(&self, _stream: StreamId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroyed_streams_leave_no_main_thread_state() {
        let (graph, mut driver) = graph();
        let count = Arc::new(FinishCount::default());
        let mut end = 0;
        let mut last = None;
        for _ in 0..4 {
            let source = graph.create_source_stream();
            source.add_main_thread_listener(count.clone());
            let input = source.input();
            input
                .add_track(1, 0, constant(128, 0.1), AddTrackFlags::NONE)
                .unwrap();
            input.end_track(1).unwrap();
            input.finish().unwrap();
            for _ in 0..3 {
                end += 1280;
                step(&graph, &mut driver, end);
            }
            assert!(source.is_finished());

            source.destroy();
            end += 1280;
            step(&graph, &mut driver, end);
            assert!(source.is_destroyed());
            last = Some(source);
        }
        assert_eq!(count.0.load(Ordering::SeqCst), 4);
        assert_eq!(graph.main_thread_entries(), 0);
        assert!(last.is_some_and(|source| source.is_destroyed()));
    }

    #[test]
    fn destination_can_be_destroyed_before_its_source() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let union = graph.create_track_union_stream();
        let _port = union.allocate_input_port(&source, PortFlags::BLOCK_INPUT);
        let source_events = Recorder::new();
        let union_events = Recorder::new();
        source.add_listener(source_events.clone());
        union.add_listener(union_events.clone());
        step(&graph, &mut driver, 1280);
        assert_eq!(driver.engine.ports.len(), 1);

        union.destroy();
        union.destroy();
        step(&graph, &mut driver, 2560);
        assert_eq!(driver.engine.ports.len(), 0);
        assert_eq!(driver.engine.streams.len(), 1);
        assert_eq!(
            union_events.take().last(),
            Some(&Recorded::Event(StreamEvent::Removed))
        );
        assert_eq!(union.state(), StreamState::Destroyed);

        source.destroy();
        step(&graph, &mut driver, 3840);
        assert!(driver.engine.streams.is_empty());
        assert!(source_events
            .take()
            .contains(&Recorded::Event(StreamEvent::Removed)));
        assert!(!source.input().append_to_track(1, constant(128, 0.1)));
    }

    #[test]
    fn removed_listener_is_told_so() {
        let (graph, mut driver) = graph();
        let union = graph.create_track_union_stream();
        let recorder = Recorder::new();
        let listener: Arc<dyn crate::MediaStreamListener> = recorder.clone();
        union.add_listener(listener.clone());
        step(&graph, &mut driver, 1280);
        recorder.take();

        union.remove_listener(&listener);
        step(&graph, &mut driver, 2560);
        assert_eq!(
            recorder.take().last(),
            Some(&Recorded::Event(StreamEvent::Removed))
        );
        union.destroy();
        step(&graph, &mut driver, 3840);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn disabling_a_union_track_disables_its_input() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(7, 0, constant(48_000, 0.1), AddTrackFlags::NONE)
            .unwrap();
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
        let union = graph.create_track_union_stream();
        let _port = union.allocate_input_port(&source, PortFlags::NONE);
        step(&graph, &mut driver, 1280);

        union.set_track_enabled(7, false);
        step(&graph, &mut driver, 2560);
        let engine = &driver.engine;
        let source_stream = engine.streams.get(source.id().0).unwrap();
        assert!(source_stream.disabled_tracks.contains(&7));
        assert!(input.state.lock().disabled_tracks.contains(&7));
        let union_stream = engine.streams.get(union.id().0).unwrap();
        assert!(union_stream.disabled_tracks.contains(&7));

        union.set_track_enabled(7, true);
        step(&graph, &mut driver, 3840);
        assert!(!input.state.lock().disabled_tracks.contains(&7));
    }

    #[test]
    fn batches_are_numbered() {
        let (graph, mut driver) = graph();
        let union = graph.create_track_union_stream();
        graph.commit_changes().unwrap();
        union.set_autofinish(true);
        graph.commit_changes().unwrap();
        step(&graph, &mut driver, 1280);
        assert_eq!(graph.update_index(), 2);
        let stream = driver.engine.streams.get(union.id().0).unwrap();
        assert_eq!(*stream.update_indices.last(), 2);
    }

    #[test]
    fn consumed_sources_are_pulled() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let input = source.input();
        input.set_pull_enabled(true);
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
        let recorder = Recorder::new();
        source.add_listener(recorder.clone());
        let union = graph.create_track_union_stream();
        let _port = union.allocate_input_port(&source, PortFlags::NONE);
        union.add_audio_output(1);

        step(&graph, &mut driver, 2560);
        let events = recorder.take();
        assert!(events.contains(&Recorded::Consumption(Consumption::Consumed)));
        assert!(events.contains(&Recorded::Pull(2560)));

        union.remove_audio_output(1);
        step(&graph, &mut driver, 3840);
        assert!(recorder
            .take()
            .contains(&Recorded::Consumption(Consumption::NotConsumed)));
    }

    #[derive(Default)]
    struct Tap {
        received: Mutex<Vec<(StreamTime, StreamTime)>>,
    }

    impl DirectListener for Tap {
        fn notify_realtime_data(
            &self,
            _track: buffer::TrackId,
            offset: StreamTime,
            _events: TrackEvents,
            data: &MediaSegment,
        ) {
            self.received.lock().push((offset, data.duration()));
        }
    }

    #[test]
    fn direct_listeners_see_appends_immediately() {
        let (graph, mut driver) = graph();
        let source = graph.create_source_stream();
        let recorder = Recorder::new();
        source.add_listener(recorder.clone());
        step(&graph, &mut driver, 1280);
        recorder.take();

        let input = source.input();
        input
            .add_track(1, 0, constant(256, 0.1), AddTrackFlags::NONE)
            .unwrap();
        let tap = Arc::new(Tap::default());
        input.add_direct_listener(tap.clone());
        assert!(input.append_to_track(1, constant(128, 0.1)));
        assert_eq!(*tap.received.lock(), vec![(256, 128)]);

        step(&graph, &mut driver, 2560);
        assert!(recorder
            .take()
            .contains(&Recorded::Event(StreamEvent::HasDirectListeners)));
    }
}
