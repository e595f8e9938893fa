//! A graph of media streams advanced in lockstep by a single graph thread.
//!
//! Source streams are fed by producers on any thread. Processed streams compute their output from
//! input ports. The graph thread decides which streams are blocked, runs every transform in
//! dependency order, mixes audio into an [AudioSink] and updates video outputs.
//!
//! ## Usage
//!
//! ```rs
//! use lockstep_graph as graph;
//!
//! let sink = graph::OfflineSink::new();
//! let graph = graph::Graph::with_sink(graph::Options::non_realtime(48_000), sink.clone())?;
//!
//! let source = graph.create_source_stream();
//! let union = graph.create_track_union_stream();
//! let _port = union.allocate_input_port(&source, graph::PortFlags::NONE);
//! union.add_audio_output(0);
//! graph.commit_changes()?;
//!
//! // Hand `source.input()` to the producer thread, then let the graph run for a second.
//! graph.start_non_realtime_processing(48_000)?;
//! ```
mod blocking;
mod driver;
mod engine;
mod error;
mod graph;
mod handle;
mod listener;
mod message;
mod order;
mod output;
mod port;
mod resample;
mod source;
mod state;
mod stream;
#[cfg(test)]
mod testing;
mod track_union;
mod transform;

pub use buffer;

pub use crate::{
    error::{Error, Result},
    graph::{Graph, Options, Snapshot, StreamSnapshot},
    handle::{InputPort, MediaStream, ProcessedStream, SourceStream},
    listener::{
        Blocking, Consumption, DirectListener, MainThreadListener, MediaStreamListener,
        StreamEvent, TrackEvents,
    },
    output::{AudioSink, NullSink, OfflineSink, VideoFrameContainer},
    port::{InputInterval, PortFlags, PortId},
    source::{AddTrackFlags, SourceInput},
    state::{StateEvent, StreamState},
    stream::StreamId,
    track_union::TrackUnion,
    transform::{InputView, ProcessContext, Transform},
};
pub use util::time;
