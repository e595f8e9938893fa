//! The capability processed streams are built from.
use buffer::{MediaSegment, StreamBuffer, TrackId};
use util::time::{GraphTime, StreamTime};

use crate::{
    listener::{Notification, Outbox, TrackEvents},
    port::{InputInterval, Port, PortFlags, PortId},
    stream::{Clock, Stream},
    Error, Result, StreamId,
};

/// Produces a processed stream's output from its inputs.
///
/// `process_input` is called for every block of graph time `[from, to)` during which the stream
/// is not finished, after every input outside the stream's cycle has produced that block. An
/// error is logged, the stream is marked failed, and the block is filled with null data.
pub trait Transform: Send + 'static {
    fn process_input(
        &mut self,
        cx: &mut ProcessContext<'_>,
        from: GraphTime,
        to: GraphTime,
    ) -> Result<()>;

    /// An output track was enabled or disabled. Returns the input track the change should be
    /// forwarded to, if any.
    fn forward_track_enabled(
        &mut self,
        _track: TrackId,
        _enabled: bool,
    ) -> Option<(StreamId, TrackId)> {
        None
    }
}

/// Everything a transform may look at or change while processing one block.
pub struct ProcessContext<'a> {
    pub(crate) id: StreamId,
    pub(crate) stream: &'a Stream,
    pub(crate) buffer: &'a mut StreamBuffer,
    pub(crate) inputs: Vec<InputView<'a>>,
    pub(crate) clock: Clock,
    pub(crate) allow_finish: bool,
    pub(crate) finish: bool,
    pub(crate) has_current_data: bool,
    pub(crate) outbox: &'a mut Outbox,
}

impl<'a> ProcessContext<'a> {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn inputs(&self) -> &[InputView<'a>] {
        &self.inputs
    }

    pub fn buffer(&self) -> &StreamBuffer {
        self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut StreamBuffer {
        self.buffer
    }

    pub fn graph_time_to_stream_time(&self, time: GraphTime) -> StreamTime {
        self.stream.graph_time_to_stream_time(self.clock, time)
    }

    /// True once the stream has finished. Finished streams are not processed again.
    pub fn is_finished(&self) -> bool {
        self.stream.finished || self.finish
    }

    /// Whether this block ends at the state-computed time, the only point a stream may finish.
    pub fn allow_finish(&self) -> bool {
        self.allow_finish
    }

    pub fn autofinish(&self) -> bool {
        self.stream
            .as_processed()
            .is_some_and(|processed| processed.autofinish)
    }

    /// Finish the stream at the end of this block.
    pub fn finish(&mut self) -> Result<()> {
        if !self.allow_finish {
            return Err(Error::FinishNotAllowed);
        }
        self.finish = true;
        Ok(())
    }

    pub fn set_has_current_data(&mut self) {
        self.has_current_data = true;
    }

    pub fn is_track_disabled(&self, track: TrackId) -> bool {
        self.stream.disabled_tracks.contains(&track)
    }

    pub fn notify_queued_track_changes(
        &mut self,
        track: TrackId,
        offset: StreamTime,
        events: TrackEvents,
        data: &MediaSegment,
    ) {
        if self.stream.listeners.is_empty() {
            return;
        }
        let notification = Notification::QueuedTrackChanges {
            track,
            offset,
            events,
            data: data.clone(),
        };
        self.outbox.notify(&self.stream.listeners, notification);
    }

    pub fn notify_finished_track_creation(&mut self) {
        self.outbox
            .notify(&self.stream.listeners, Notification::FinishedTrackCreation);
    }
}

/// One input port of the stream being processed, with read access to its source.
#[derive(Copy, Clone)]
pub struct InputView<'a> {
    pub(crate) port_id: PortId,
    pub(crate) port: &'a Port,
    pub(crate) source: &'a Stream,
    pub(crate) dest: &'a Stream,
    pub(crate) clock: Clock,
}

impl<'a> InputView<'a> {
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn source_id(&self) -> StreamId {
        self.port.source
    }

    pub fn flags(&self) -> PortFlags {
        self.port.flags
    }

    pub fn input_number(&self) -> u16 {
        self.port.input_number
    }

    pub fn output_number(&self) -> u16 {
        self.port.output_number
    }

    /// The source's buffer, in the source's stream time.
    pub fn buffer(&self) -> &'a StreamBuffer {
        &self.source.buffer
    }

    pub fn is_finished(&self) -> bool {
        self.source.finished
    }

    pub fn has_current_data(&self) -> bool {
        self.source.has_current_data
    }

    /// Graph time to the source's stream time.
    pub fn graph_time_to_stream_time(&self, time: GraphTime) -> StreamTime {
        self.source.graph_time_to_stream_time(self.clock, time)
    }

    /// The first interval at or after `time` during which this stream is unblocked and the
    /// source's blocking does not change.
    pub fn next_input_interval(&self, time: GraphTime) -> InputInterval {
        Port::next_input_interval(self.source, self.dest, time)
    }
}
