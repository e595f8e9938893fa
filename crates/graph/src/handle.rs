//! Handles to streams and ports owned by a [Graph].
//!
//! Every method queues a message; nothing changes on the graph thread until
//! [Graph::commit_changes]. Queries read the main-thread snapshot.
use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use buffer::TrackId;
use util::time::StreamTime;

use crate::{
    listener::{MainThreadListener, MediaStreamListener},
    message::Message,
    output::VideoFrameContainer,
    port::{PortFlags, PortId},
    source::SourceInput,
    state::StreamState,
    Graph, StreamId,
};

#[derive(Clone)]
pub struct MediaStream {
    id: StreamId,
    graph: Graph,
}

impl MediaStream {
    pub(crate) fn new(id: StreamId, graph: Graph) -> Self {
        Self { id, graph }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn queue(&self, message: Message) {
        self.graph.queue(message);
    }

    /// Mix this stream's audio into the graph output under `key`, at unit volume.
    pub fn add_audio_output(&self, key: u64) {
        self.queue(Message::AddAudioOutput {
            stream: self.id,
            key,
        });
    }

    pub fn set_audio_output_volume(&self, key: u64, volume: f32) {
        self.queue(Message::SetAudioOutputVolume {
            stream: self.id,
            key,
            volume,
        });
    }

    pub fn remove_audio_output(&self, key: u64) {
        self.queue(Message::RemoveAudioOutput {
            stream: self.id,
            key,
        });
    }

    pub fn add_video_output(&self, container: &VideoFrameContainer) {
        self.queue(Message::AddVideoOutput {
            stream: self.id,
            container: container.clone(),
        });
    }

    pub fn remove_video_output(&self, container: &VideoFrameContainer) {
        self.queue(Message::RemoveVideoOutput {
            stream: self.id,
            container: container.clone(),
        });
    }

    /// The stream is blocked while the count is positive.
    pub fn change_explicit_blocker_count(&self, delta: i32) {
        self.queue(Message::ChangeExplicitBlockerCount {
            stream: self.id,
            delta,
        });
    }

    /// Add the single user blocker if it is not already held.
    pub fn block_stream_if_needed(&self) {
        self.queue(Message::SetUserBlocked {
            stream: self.id,
            blocked: true,
        });
    }

    pub fn unblock_stream_if_needed(&self) {
        self.queue(Message::SetUserBlocked {
            stream: self.id,
            blocked: false,
        });
    }

    pub fn add_listener(&self, listener: Arc<dyn MediaStreamListener>) {
        self.queue(Message::AddListener {
            stream: self.id,
            listener,
        });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MediaStreamListener>) {
        self.queue(Message::RemoveListener {
            stream: self.id,
            listener: listener.clone(),
        });
    }

    /// Takes effect immediately. A listener added after the stream finished is told so at once.
    pub fn add_main_thread_listener(&self, listener: Arc<dyn MainThreadListener>) {
        self.graph.add_main_thread_listener(self.id, listener);
    }

    pub fn remove_main_thread_listener(&self, listener: &Arc<dyn MainThreadListener>) {
        self.graph.remove_main_thread_listener(self.id, listener);
    }

    /// Disabled audio tracks play silence and disabled video tracks play black frames.
    pub fn set_track_enabled(&self, track: TrackId, enabled: bool) {
        self.queue(Message::SetTrackEnabled {
            stream: self.id,
            track,
            enabled,
        });
    }

    /// Destroy the stream along with every port attached to it. Repeated calls do nothing.
    pub fn destroy(&self) {
        if self.graph.mark_destroyed(self.id) {
            self.queue(Message::DestroyStream(self.id));
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.graph.is_destroyed(self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.graph
            .stream_snapshot(self.id)
            .is_some_and(|stream| stream.finished)
    }

    /// A stream the graph has not picked up yet counts as blocked.
    pub fn is_blocked(&self) -> bool {
        self.graph
            .stream_snapshot(self.id)
            .map_or(true, |stream| stream.blocked)
    }

    pub fn has_failed(&self) -> bool {
        self.graph
            .stream_snapshot(self.id)
            .is_some_and(|stream| stream.failed)
    }

    /// Stream time played so far.
    pub fn current_time(&self) -> StreamTime {
        self.graph
            .stream_snapshot(self.id)
            .map_or(0, |stream| stream.current_time)
    }

    pub fn state(&self) -> StreamState {
        if self.is_destroyed() {
            return StreamState::Destroyed;
        }
        self.graph
            .stream_snapshot(self.id)
            .map(|stream| stream.state)
            .unwrap_or_default()
    }
}

/// A stream fed by a producer through its [SourceInput].
#[derive(Clone)]
pub struct SourceStream {
    stream: MediaStream,
    input: Arc<SourceInput>,
}

impl SourceStream {
    pub(crate) fn new(stream: MediaStream, input: Arc<SourceInput>) -> Self {
        Self { stream, input }
    }

    /// The producer side. Clone it onto whichever thread produces the data.
    pub fn input(&self) -> &Arc<SourceInput> {
        &self.input
    }
}

impl Deref for SourceStream {
    type Target = MediaStream;
    fn deref(&self) -> &MediaStream {
        &self.stream
    }
}

/// A stream computed from its input ports by a [crate::Transform].
#[derive(Clone)]
pub struct ProcessedStream {
    stream: MediaStream,
}

impl ProcessedStream {
    pub(crate) fn new(stream: MediaStream) -> Self {
        Self { stream }
    }

    pub fn allocate_input_port(&self, source: &MediaStream, flags: PortFlags) -> InputPort {
        self.allocate_input_port_with_numbers(source, flags, 0, 0)
    }

    pub fn allocate_input_port_with_numbers(
        &self,
        source: &MediaStream,
        flags: PortFlags,
        input_number: u16,
        output_number: u16,
    ) -> InputPort {
        let id = self.graph().allocate_port_id();
        self.graph().queue(Message::CreatePort {
            id,
            source: source.id(),
            dest: self.id(),
            flags,
            input_number,
            output_number,
        });
        InputPort {
            id,
            source: source.id(),
            dest: self.id(),
            flags,
            input_number,
            output_number,
            graph: self.graph().clone(),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Finish once every input has finished.
    pub fn set_autofinish(&self, autofinish: bool) {
        self.graph().queue(Message::SetAutofinish {
            stream: self.id(),
            autofinish,
        });
    }

    /// End every track and finish the stream.
    pub fn finish(&self) {
        self.graph().queue(Message::Finish(self.id()));
    }
}

impl Deref for ProcessedStream {
    type Target = MediaStream;
    fn deref(&self) -> &MediaStream {
        &self.stream
    }
}

/// A connection from a source stream into a processed stream.
pub struct InputPort {
    id: PortId,
    source: StreamId,
    dest: StreamId,
    flags: PortFlags,
    input_number: u16,
    output_number: u16,
    graph: Graph,
    disconnected: AtomicBool,
}

impl InputPort {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn source(&self) -> StreamId {
        self.source
    }

    pub fn dest(&self) -> StreamId {
        self.dest
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn input_number(&self) -> u16 {
        self.input_number
    }

    pub fn output_number(&self) -> u16 {
        self.output_number
    }

    /// Remove the port from the graph. Repeated calls do nothing.
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.graph.queue(Message::DestroyPort(self.id));
        }
    }
}
