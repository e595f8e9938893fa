use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use approx::assert_abs_diff_eq;
use lockstep_graph::{
    buffer::{AudioSegment, Image, VideoFrame, VideoSegment},
    time::{round_up_to_block, GraphTime, StreamTime, STREAM_TIME_MAX},
    AddTrackFlags, Error, Graph, MainThreadListener, MediaStreamListener, OfflineSink, Options,
    PortFlags, StreamEvent, StreamId, VideoFrameContainer,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    graph: Graph,
    sink: OfflineSink,
    end: GraphTime,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let sink = OfflineSink::new();
        let graph = Graph::with_sink(Options::non_realtime(48_000), sink.clone()).unwrap();
        Self {
            graph,
            sink,
            end: 0,
        }
    }

    /// Commit pending changes and wait until the graph has applied them.
    fn sync(&self) {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.graph.run_after_pending_updates(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(TIMEOUT).unwrap();
        self.graph.update_main_thread_state();
    }

    /// Process `ticks` more graph time, then sync.
    fn advance(&mut self, ticks: GraphTime) {
        self.graph.commit_changes().unwrap();
        self.graph.start_non_realtime_processing(ticks).unwrap();
        self.end += round_up_to_block(ticks, 128);
        let deadline = Instant::now() + TIMEOUT;
        loop {
            self.graph.update_main_thread_state();
            if self.graph.state_computed_time() >= self.end {
                break;
            }
            assert!(Instant::now() < deadline, "graph stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
        self.sync();
    }

    /// Interleaved stereo frame `frame` of everything played so far.
    fn frame(&self, frame: usize) -> [f32; 2] {
        let samples = self.sink.samples();
        [samples[2 * frame], samples[2 * frame + 1]]
    }
}

fn constant(frames: usize, value: f32) -> AudioSegment {
    AudioSegment::from_planar(vec![vec![value; frames]])
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl MediaStreamListener for Events {
    fn notify_pull(&self, desired_time: StreamTime) {
        self.0.lock().push(format!("pull {desired_time}"));
    }

    fn notify_event(&self, event: StreamEvent) {
        self.0.lock().push(format!("{event:?}"));
    }
}

#[derive(Default)]
struct FinishCounter(AtomicUsize);

impl MainThreadListener for FinishCounter {
    fn notify_stream_finished(&self, _stream: StreamId) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn resampled_source_plays_for_its_converted_duration() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let source = graph.create_source_stream();
    let events = Arc::new(Events::default());
    source.add_listener(events.clone());
    source.add_audio_output(1);
    let input = source.input();
    input.set_pull_enabled(true);
    input
        .add_audio_track(1, 44_100, 0, constant(1000, 0.25), AddTrackFlags::NONE)
        .unwrap();
    input.end_track(1).unwrap();
    input.finish().unwrap();

    harness.advance(5120);
    assert!(source.is_finished());
    assert!(source.is_blocked());
    assert_eq!(source.current_time(), 1088);

    let events = events.0.lock().clone();
    let finished = events.iter().position(|event| event == "Finished").unwrap();
    assert!(events[finished..].iter().all(|event| !event.starts_with("pull")));

    assert_eq!(harness.sink.frames(), 5120);
    let [left, right] = harness.frame(600);
    assert_abs_diff_eq!(left, 0.25, epsilon = 0.05);
    assert_abs_diff_eq!(right, 0.25, epsilon = 0.05);
    let samples = harness.sink.samples();
    assert!(samples[2 * 1088..].iter().all(|sample| *sample == 0.0));
}

#[test]
fn track_union_mixes_its_inputs() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let union = graph.create_track_union_stream();
    for value in [0.25, 0.5] {
        let source = graph.create_source_stream();
        let input = source.input();
        input
            .add_track(1, 0, constant(48_000, value), AddTrackFlags::NONE)
            .unwrap();
        input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
        let _port = union.allocate_input_port(&source, PortFlags::BLOCK_OUTPUT);
    }
    union.add_audio_output(7);
    union.set_audio_output_volume(7, 0.5);

    harness.advance(2560);
    let [left, right] = harness.frame(1000);
    assert_abs_diff_eq!(left, 0.375, epsilon = 1e-6);
    assert_abs_diff_eq!(right, 0.375, epsilon = 1e-6);
    assert!(!union.is_blocked());
}

#[test]
fn blocked_sources_make_the_union_silent() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let source = graph.create_source_stream();
    let input = source.input();
    input
        .add_track(1, 0, constant(48_000, 0.5), AddTrackFlags::NONE)
        .unwrap();
    input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
    let union = graph.create_track_union_stream();
    let _port = union.allocate_input_port(&source, PortFlags::BLOCK_OUTPUT);
    union.add_audio_output(1);
    harness.advance(1280);

    source.change_explicit_blocker_count(1);
    harness.advance(2560);
    assert!(source.is_blocked());
    assert!(union.is_blocked());
    let frames = harness.sink.frames();
    assert_eq!(harness.frame(frames - 1), [0.0, 0.0]);

    source.change_explicit_blocker_count(-1);
    harness.advance(2560);
    assert!(!union.is_blocked());
    let frames = harness.sink.frames();
    assert_abs_diff_eq!(harness.frame(frames - 1)[0], 0.5, epsilon = 1e-6);
}

#[test]
fn union_autofinishes_after_its_inputs() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let source = graph.create_source_stream();
    let input = source.input();
    input
        .add_track(1, 0, constant(2000, 0.1), AddTrackFlags::NONE)
        .unwrap();
    let union = graph.create_track_union_stream();
    union.set_autofinish(true);
    let _port = union.allocate_input_port(&source, PortFlags::NONE);
    let counter = Arc::new(FinishCounter::default());
    union.add_main_thread_listener(counter.clone());

    harness.advance(1280);
    assert!(!union.is_finished());

    input.end_track(1).unwrap();
    input.finish().unwrap();
    harness.advance(4800);
    assert!(source.is_finished());
    assert!(union.is_finished());
    assert!(union.is_blocked());

    harness.advance(1280);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    let late = Arc::new(FinishCounter::default());
    union.add_main_thread_listener(late.clone());
    assert_eq!(late.0.load(Ordering::SeqCst), 1);
}

#[test]
fn sources_can_be_destroyed_under_a_running_union() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let source = graph.create_source_stream();
    let input = source.input();
    input
        .add_track(1, 0, constant(48_000, 0.1), AddTrackFlags::NONE)
        .unwrap();
    input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();
    let union = graph.create_track_union_stream();
    let events = Arc::new(Events::default());
    union.add_listener(events.clone());
    let port = union.allocate_input_port(&source, PortFlags::NONE);
    harness.advance(1280);

    source.destroy();
    harness.advance(1280);
    assert!(source.is_destroyed());
    assert!(!union.has_failed());
    assert!(!input.append_to_track(1, constant(128, 0.1)));

    port.disconnect();
    port.disconnect();
    union.destroy();
    harness.advance(1280);
    assert!(union.is_destroyed());
    assert_eq!(events.0.lock().last().map(String::as_str), Some("Removed"));
}

#[test]
fn video_outputs_show_the_current_frame() {
    let mut harness = Harness::new();
    let graph = harness.graph.clone();
    let source = graph.create_source_stream();
    let container = VideoFrameContainer::new();
    source.add_video_output(&container);
    let mut video = VideoSegment::new();
    video.append_frame(VideoFrame::new(Image::new(4, 4, vec![0; 64])), 48_000);
    let input = source.input();
    input.add_track(1, 0, video, AddTrackFlags::NONE).unwrap();
    input.advance_known_tracks_time(STREAM_TIME_MAX).unwrap();

    harness.advance(2560);
    let frame = container.current_frame().unwrap();
    assert_eq!(frame.size(), (4, 4));
    assert!(!frame.is_force_black());
    let updates = container.update_count();

    source.set_track_enabled(1, false);
    harness.advance(2560);
    assert!(container.current_frame().unwrap().is_force_black());
    assert_eq!(container.update_count(), updates + 1);
}

#[test]
fn shut_down_graphs_refuse_work() {
    let harness = Harness::new();
    let graph = harness.graph.clone();
    let union = graph.create_track_union_stream();
    graph.commit_changes().unwrap();
    graph.shutdown();
    assert!(!graph.is_running());
    assert!(graph.fatal_error().is_none());

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    graph.run_after_pending_updates(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    union.set_autofinish(true);
    assert!(matches!(graph.commit_changes(), Err(Error::GraphShutDown)));
    assert!(matches!(
        graph.start_non_realtime_processing(128),
        Err(Error::GraphShutDown)
    ));
}

#[test]
fn options_are_validated() {
    init_tracing();
    let options = Options {
        block_size: 0,
        ..Options::non_realtime(48_000)
    };
    assert!(matches!(Graph::new(options), Err(Error::InvalidConfig(_))));

    let realtime = Graph::new(Options::realtime(48_000)).unwrap();
    assert!(matches!(
        realtime.start_non_realtime_processing(128),
        Err(Error::InvalidConfig(_))
    ));
    realtime.shutdown();
}
