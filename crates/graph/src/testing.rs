//! Helpers for driving a graph synchronously from unit tests.
use std::sync::Arc;

use buffer::{AudioSegment, MediaSegment, TrackId};
use parking_lot::Mutex;
use util::time::{GraphTime, StreamTime};

use crate::{
    driver::Driver,
    listener::{Blocking, Consumption, MediaStreamListener, StreamEvent, TrackEvents},
    output::NullSink,
    Graph, Options,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A non-realtime graph at 48kHz whose thread is driven by hand.
pub(crate) fn graph() -> (Graph, Driver) {
    init_tracing();
    Graph::build(Options::non_realtime(48_000), Box::new(NullSink::default())).unwrap()
}

/// Submit what is queued, run one iteration up to `end` and refresh the main-thread view.
pub(crate) fn step(graph: &Graph, driver: &mut Driver, end: GraphTime) {
    graph.commit_changes().unwrap();
    driver.step_to(end).unwrap();
    graph.update_main_thread_state();
}

/// Mono audio holding `value` for `frames` frames.
pub(crate) fn constant(frames: usize, value: f32) -> AudioSegment {
    AudioSegment::from_planar(vec![vec![value; frames]])
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Recorded {
    Consumption(Consumption),
    Pull(StreamTime),
    Blocking(Blocking),
    HasCurrentData,
    Event(StreamEvent),
    TrackChange {
        track: TrackId,
        offset: StreamTime,
        events: TrackEvents,
        duration: StreamTime,
    },
    FinishedTrackCreation,
}

/// Records every notification except output advances.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: Recorded) {
        self.events.lock().push(event);
    }
}

impl MediaStreamListener for Recorder {
    fn notify_consumption_changed(&self, consumption: Consumption) {
        self.push(Recorded::Consumption(consumption));
    }

    fn notify_pull(&self, desired_time: StreamTime) {
        self.push(Recorded::Pull(desired_time));
    }

    fn notify_blocking_changed(&self, blocking: Blocking) {
        self.push(Recorded::Blocking(blocking));
    }

    fn notify_has_current_data(&self) {
        self.push(Recorded::HasCurrentData);
    }

    fn notify_event(&self, event: StreamEvent) {
        self.push(Recorded::Event(event));
    }

    fn notify_queued_track_changes(
        &self,
        track: TrackId,
        offset: StreamTime,
        events: TrackEvents,
        data: &MediaSegment,
    ) {
        self.push(Recorded::TrackChange {
            track,
            offset,
            events,
            duration: data.duration(),
        });
    }

    fn notify_finished_track_creation(&self) {
        self.push(Recorded::FinishedTrackCreation);
    }
}
