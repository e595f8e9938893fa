//! Renders two sine tones through a track union into memory.
//!
//! One tone is pulled by the graph as it needs data, the other is pushed from a producer thread
//! at 44.1kHz and resampled on the way in.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use buffer::AudioSegment;
use graph::{
    time::{StreamTime, STREAM_TIME_MAX},
    AddTrackFlags, Graph, MediaStreamListener, OfflineSink, Options, PortFlags, SourceInput,
};
use parking_lot::Mutex;
use tracing::{info, warn};

const SAMPLE_RATE: u32 = 48_000;

struct Sine {
    phase: f32,
    freq: f32,
    sample_rate: f32,
}

impl Sine {
    fn new(freq: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            freq,
            sample_rate: sample_rate as f32,
        }
    }

    fn render(&mut self, frames: usize) -> AudioSegment {
        let mut samples = Vec::with_capacity(frames);
        for _ in 0..frames {
            samples.push(0.25 * (self.phase * std::f32::consts::TAU).sin());
            self.phase = (self.phase + self.freq / self.sample_rate).fract();
        }
        AudioSegment::from_planar(vec![samples])
    }
}

/// Appends as much of the tone as the graph asks for.
struct PulledSine {
    input: Arc<SourceInput>,
    sine: Mutex<Sine>,
}

impl MediaStreamListener for PulledSine {
    fn notify_pull(&self, desired_time: StreamTime) {
        let Ok(end) = self.input.end_of_appended_data(1) else {
            return;
        };
        let missing = usize::try_from(desired_time - end).unwrap_or(0);
        if missing > 0 {
            let segment = self.sine.lock().render(missing);
            self.input.append_to_track(1, segment);
        }
    }
}

fn main() -> graph::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sink = OfflineSink::new();
    let graph = Graph::with_sink(Options::non_realtime(SAMPLE_RATE), sink.clone())?;

    let pulled = graph.create_source_stream();
    let input = pulled.input().clone();
    input.add_track(1, 0, AudioSegment::new(), AddTrackFlags::NONE)?;
    input.advance_known_tracks_time(STREAM_TIME_MAX)?;
    input.set_pull_enabled(true);
    pulled.add_listener(Arc::new(PulledSine {
        input,
        sine: Mutex::new(Sine::new(440.0, SAMPLE_RATE)),
    }));

    let pushed = graph.create_source_stream();
    let producer = {
        let input = pushed.input().clone();
        std::thread::spawn(move || -> graph::Result<()> {
            let mut sine = Sine::new(660.0, 44_100);
            input.add_audio_track(1, 44_100, 0, sine.render(4410), AddTrackFlags::NONE)?;
            for _ in 1..10 {
                input.append_to_track(1, sine.render(4410));
            }
            input.end_track(1)?;
            input.finish()
        })
    };

    let union = graph.create_track_union_stream();
    let _pulled_port = union.allocate_input_port(&pulled, PortFlags::NONE);
    let _pushed_port = union.allocate_input_port(&pushed, PortFlags::NONE);
    union.add_audio_output(0);
    graph.commit_changes()?;

    match producer.join() {
        Ok(result) => result?,
        Err(_) => warn!("producer thread panicked"),
    }

    let end = i64::from(SAMPLE_RATE) * 2;
    graph.start_non_realtime_processing(end)?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while graph.state_computed_time() < end && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
        graph.update_main_thread_state();
    }

    let samples = sink.samples();
    let peak = samples.iter().fold(0.0f32, |peak, sample| peak.max(sample.abs()));
    info!(
        frames = sink.frames(),
        channels = sink.channels(),
        peak,
        pushed_finished = pushed.is_finished(),
        seconds = graph.ticks_to_seconds(graph.state_computed_time()),
        "rendered"
    );
    if let Some(error) = graph.fatal_error() {
        warn!(%error, "graph stopped early");
    }
    graph.shutdown();
    Ok(())
}
