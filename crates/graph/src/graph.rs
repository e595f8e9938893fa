//! The control side of a graph.
//!
//! A [Graph] is a cheap, cloneable handle. Control calls queue messages locally; nothing reaches
//! the graph thread until [Graph::commit_changes] submits them as one batch, which the graph
//! applies atomically between two iterations. What the graph thread has done is visible through
//! the snapshot refreshed by [Graph::update_main_thread_state].
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, warn};
use util::{
    collections::{map, KeyAllocator, Map, Set},
    time::{
        microseconds_to_ticks_round_down, milliseconds_to_ticks, round_up_to_block,
        seconds_to_ticks_round_down, ticks_to_microseconds, ticks_to_seconds, GraphTime,
        StreamTime, TrackRate,
    },
};

use crate::{
    driver::{Driver, Lifecycle, Waker},
    engine::Engine,
    handle::{MediaStream, ProcessedStream, SourceStream},
    listener::{same_listener, MainThreadListener},
    message::{Command, Message},
    output::{AudioSink, NullSink},
    port::PortId,
    source::SourceInput,
    state::StreamState,
    stream::{Kind, Processed},
    track_union::TrackUnion,
    transform::Transform,
    Error, Result, StreamId,
};

/// Graph configuration. Durations are in milliseconds and converted to ticks at `sample_rate`.
#[derive(Clone, Debug)]
pub struct Options {
    pub sample_rate: TrackRate,
    /// Advance with the wall clock. Otherwise only advance when asked to.
    pub realtime: bool,
    pub output_channels: usize,
    /// Graph time advances in multiples of this many ticks.
    pub block_size: u32,
    pub iteration_ms: u32,
    /// How far past the current time blocking is decided and audio is mixed.
    pub audio_target_ms: u32,
    /// How far ahead a source track must be buffered to have enough.
    pub enough_buffered_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            realtime: true,
            output_channels: 2,
            block_size: 128,
            iteration_ms: 10,
            audio_target_ms: 30,
            enough_buffered_ms: 100,
        }
    }
}

impl Options {
    pub fn realtime(sample_rate: TrackRate) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    pub fn non_realtime(sample_rate: TrackRate) -> Self {
        Self {
            sample_rate,
            realtime: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidConfig("sample_rate must be positive".into()));
        }
        if self.output_channels == 0 {
            return Err(Error::InvalidConfig("output_channels must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be positive".into()));
        }
        if self.iteration_ms == 0 {
            return Err(Error::InvalidConfig("iteration_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn block_ticks(&self) -> GraphTime {
        GraphTime::from(self.block_size)
    }

    pub fn iteration_ticks(&self) -> GraphTime {
        round_up_to_block(
            milliseconds_to_ticks(self.sample_rate, self.iteration_ms),
            self.block_ticks(),
        )
    }

    /// The furthest a single realtime iteration advances graph time.
    pub fn max_iteration_ticks(&self) -> GraphTime {
        round_up_to_block(
            self.iteration_ticks() + self.audio_target_ticks(),
            self.block_ticks(),
        )
    }

    pub fn audio_target_ticks(&self) -> GraphTime {
        milliseconds_to_ticks(self.sample_rate, self.audio_target_ms)
    }

    pub fn enough_buffered_ticks(&self) -> StreamTime {
        milliseconds_to_ticks(self.sample_rate, self.enough_buffered_ms)
    }
}

/// What the graph thread published at the end of its last iteration.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub graph_time: GraphTime,
    /// Blocking is decided and audio mixed up to here.
    pub state_computed_time: GraphTime,
    /// Batches applied so far.
    pub update_index: i64,
    pub streams: Map<StreamId, StreamSnapshot>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub current_time: StreamTime,
    pub finished: bool,
    pub blocked: bool,
    pub failed: bool,
    pub state: StreamState,
}

#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    options: Options,
    stream_keys: Arc<Mutex<KeyAllocator>>,
    port_keys: Arc<Mutex<KeyAllocator>>,
    pending: Mutex<Vec<Message>>,
    pub(crate) waker: Arc<Waker>,
    main: Mutex<MainThread>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct MainThread {
    snapshot: triple_buffer::Output<Snapshot>,
    view: Snapshot,
    /// Streams destroyed on this side whose key the graph thread has not freed yet. Once it
    /// has, a dead key alone marks the stream destroyed.
    destroyed: Set<StreamId>,
    listeners: Map<StreamId, Vec<Arc<dyn MainThreadListener>>>,
    notified_finished: Set<StreamId>,
}

impl Graph {
    /// A graph whose audio is discarded.
    pub fn new(options: Options) -> Result<Self> {
        Self::with_sink(options, NullSink::default())
    }

    /// A graph that hands its mixed audio to `sink`, running on its own thread.
    pub fn with_sink(options: Options, sink: impl AudioSink) -> Result<Self> {
        let (graph, driver) = Self::build(options, Box::new(sink))?;
        let handle = thread::Builder::new()
            .name("lockstep-graph".into())
            .spawn(move || driver.run())
            .map_err(Error::Spawn)?;
        *graph.inner.thread.lock() = Some(handle);
        Ok(graph)
    }

    /// A graph and the driver for its thread, not yet running.
    pub(crate) fn build(options: Options, sink: Box<dyn AudioSink>) -> Result<(Self, Driver)> {
        options.validate()?;
        let (sender, receiver) = crossbeam::channel::unbounded();
        let waker = Arc::new(Waker::new(sender));
        let stream_keys = Arc::new(Mutex::new(KeyAllocator::new()));
        let port_keys = Arc::new(Mutex::new(KeyAllocator::new()));
        let (input, output) = triple_buffer::triple_buffer(&Snapshot::default());
        let engine = Engine::new(
            options.clone(),
            sink,
            input,
            stream_keys.clone(),
            port_keys.clone(),
        )?;
        let driver = Driver::new(engine, receiver, waker.clone());
        let inner = Inner {
            options,
            stream_keys,
            port_keys,
            pending: Mutex::new(vec![]),
            waker,
            main: Mutex::new(MainThread {
                snapshot: output,
                view: Snapshot::default(),
                destroyed: map::set(),
                listeners: map::map(),
                notified_finished: map::set(),
            }),
            thread: Mutex::new(None),
        };
        let graph = Self {
            inner: Arc::new(inner),
        };
        Ok((graph, driver))
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn sample_rate(&self) -> TrackRate {
        self.inner.options.sample_rate
    }

    pub(crate) fn queue(&self, message: Message) {
        self.inner.pending.lock().push(message);
    }

    pub(crate) fn allocate_port_id(&self) -> PortId {
        PortId(self.inner.port_keys.lock().alloc())
    }

    fn allocate_stream_id(&self) -> StreamId {
        StreamId(self.inner.stream_keys.lock().alloc())
    }

    pub fn create_source_stream(&self) -> SourceStream {
        let id = self.allocate_stream_id();
        let input = Arc::new(SourceInput::new(
            id,
            self.sample_rate(),
            self.inner.waker.clone(),
        ));
        self.queue(Message::CreateStream {
            id,
            kind: Kind::Source(input.clone()),
        });
        SourceStream::new(MediaStream::new(id, self.clone()), input)
    }

    pub fn create_processed_stream(&self, transform: impl Transform) -> ProcessedStream {
        let id = self.allocate_stream_id();
        self.queue(Message::CreateStream {
            id,
            kind: Kind::Processed(Processed::new(Box::new(transform))),
        });
        ProcessedStream::new(MediaStream::new(id, self.clone()))
    }

    /// A processed stream holding every track of every input. See [TrackUnion].
    pub fn create_track_union_stream(&self) -> ProcessedStream {
        self.create_processed_stream(TrackUnion::new())
    }

    /// Submit everything queued so far as one batch, then refresh the main-thread state.
    pub fn commit_changes(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.inner.pending.lock());
        let sent = batch.is_empty() || self.inner.waker.send(Command::Batch(batch));
        self.update_main_thread_state();
        if sent {
            Ok(())
        } else {
            Err(Error::GraphShutDown)
        }
    }

    /// Run `callback` on the graph thread once everything queued before it has been applied.
    /// If the graph is no longer running the callback runs right away.
    pub fn run_after_pending_updates(&self, callback: impl FnOnce() + Send + 'static) {
        if !self.is_running() {
            callback();
            return;
        }
        self.queue(Message::RunAfter(Box::new(callback)));
        if let Err(error) = self.commit_changes() {
            debug!(%error, "pending updates not submitted");
        }
    }

    /// Let a non-realtime graph process `ticks` more graph time, rounded up to a whole block.
    pub fn start_non_realtime_processing(&self, ticks: GraphTime) -> Result<()> {
        if self.inner.options.realtime {
            return Err(Error::InvalidConfig(
                "a realtime graph cannot be driven manually".into(),
            ));
        }
        let ticks = round_up_to_block(ticks.max(0), self.inner.options.block_ticks());
        {
            let mut monitor = self.inner.waker.monitor.lock();
            if monitor.lifecycle != Lifecycle::Running {
                return Err(Error::GraphShutDown);
            }
            monitor.end_time += ticks;
        }
        self.inner.waker.send(Command::Wake);
        Ok(())
    }

    /// Stop the graph thread and wait for it. Every stream is destroyed first.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.inner.waker.is_running()
    }

    /// The error that stopped the graph thread, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.waker.monitor.lock().fatal.clone()
    }

    /// Pick up the graph thread's latest snapshot and tell main-thread listeners about streams
    /// that finished since the last call.
    pub fn update_main_thread_state(&self) {
        let mut finished = vec![];
        {
            let mut main = self.inner.main.lock();
            let view = main.snapshot.read().clone();
            let MainThread {
                listeners,
                notified_finished,
                destroyed,
                ..
            } = &mut *main;
            let keys = self.inner.stream_keys.lock();
            for (id, stream) in &view.streams {
                if stream.finished && keys.is_live(id.0) && notified_finished.insert(*id) {
                    for listener in listeners.get(id).into_iter().flatten() {
                        finished.push((listener.clone(), *id));
                    }
                }
            }
            listeners.retain(|id, _| keys.is_live(id.0) && !destroyed.contains(id));
            destroyed.retain(|id| keys.is_live(id.0));
            notified_finished.retain(|id| keys.is_live(id.0));
            drop(keys);
            main.view = view;
        }
        for (listener, id) in finished {
            listener.notify_stream_finished(id);
        }
    }

    /// Graph time as of the last [Graph::update_main_thread_state].
    pub fn current_time(&self) -> GraphTime {
        self.inner.main.lock().view.graph_time
    }

    /// How far the graph has decided and processed, as of the last
    /// [Graph::update_main_thread_state].
    pub fn state_computed_time(&self) -> GraphTime {
        self.inner.main.lock().view.state_computed_time
    }

    pub fn update_index(&self) -> i64 {
        self.inner.main.lock().view.update_index
    }

    pub(crate) fn stream_snapshot(&self, id: StreamId) -> Option<StreamSnapshot> {
        self.inner.main.lock().view.streams.get(&id).copied()
    }

    /// Returns false if the stream was already destroyed.
    pub(crate) fn mark_destroyed(&self, id: StreamId) -> bool {
        let mut main = self.inner.main.lock();
        self.inner.stream_keys.lock().is_live(id.0) && main.destroyed.insert(id)
    }

    pub(crate) fn is_destroyed(&self, id: StreamId) -> bool {
        let main = self.inner.main.lock();
        main.destroyed.contains(&id) || !self.inner.stream_keys.lock().is_live(id.0)
    }

    #[cfg(test)]
    pub(crate) fn main_thread_entries(&self) -> usize {
        let main = self.inner.main.lock();
        main.destroyed.len() + main.notified_finished.len() + main.listeners.len()
    }

    pub(crate) fn add_main_thread_listener(
        &self,
        id: StreamId,
        listener: Arc<dyn MainThreadListener>,
    ) {
        let finished = {
            let mut main = self.inner.main.lock();
            main.listeners.entry(id).or_default().push(listener.clone());
            main.notified_finished.contains(&id)
        };
        if finished {
            listener.notify_stream_finished(id);
        }
    }

    pub(crate) fn remove_main_thread_listener(
        &self,
        id: StreamId,
        listener: &Arc<dyn MainThreadListener>,
    ) {
        let mut main = self.inner.main.lock();
        if let Some(listeners) = main.listeners.get_mut(&id) {
            listeners.retain(|existing| !same_listener(existing, listener));
        }
    }

    pub fn ticks_to_seconds(&self, ticks: GraphTime) -> f64 {
        ticks_to_seconds(self.sample_rate(), ticks)
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> GraphTime {
        seconds_to_ticks_round_down(self.sample_rate(), seconds)
    }

    pub fn ticks_to_microseconds(&self, ticks: GraphTime) -> i64 {
        ticks_to_microseconds(self.sample_rate(), ticks)
    }

    pub fn microseconds_to_ticks(&self, microseconds: i64) -> GraphTime {
        microseconds_to_ticks_round_down(self.sample_rate(), microseconds)
    }
}

impl Inner {
    fn shutdown(&self) {
        {
            let mut monitor = self.waker.monitor.lock();
            if monitor.lifecycle == Lifecycle::Running {
                monitor.lifecycle = Lifecycle::ShuttingDown;
            }
        }
        self.waker.send(Command::Shutdown);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("graph thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
