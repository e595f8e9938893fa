//! Sample-rate conversion for audio appended at a foreign rate.
//!
//! The resampler is stateful per track. Output is released only up to the number of frames the
//! input so far corresponds to, so the converted track never runs ahead of its input. Flushing
//! pads the input with silence until the remainder has been produced.
use buffer::AudioSegment;
use rubato::{FftFixedIn, Resampler};
use util::{
    cast_usize,
    time::{rate_convert_round, rate_convert_round_down, TrackRate},
};

use crate::Result;

const CHUNK_SIZE: usize = 512;
const SUB_CHUNKS: usize = 2;

pub(crate) struct TrackResampler {
    inner: FftFixedIn<f32>,
    input_rate: TrackRate,
    output_rate: TrackRate,
    channels: usize,
    pending: Vec<Vec<f32>>,
    ready: Vec<Vec<f32>>,
    delay: usize,
    frames_in: i64,
    frames_out: i64,
}

impl TrackResampler {
    pub(crate) fn new(
        input_rate: TrackRate,
        output_rate: TrackRate,
        channels: usize,
    ) -> Result<Self> {
        let channels = channels.max(1);
        let inner = FftFixedIn::<f32>::new(
            cast_usize!(input_rate),
            cast_usize!(output_rate),
            CHUNK_SIZE,
            SUB_CHUNKS,
            channels,
        )?;
        let delay = inner.output_delay();
        Ok(Self {
            inner,
            input_rate,
            output_rate,
            channels,
            pending: vec![vec![]; channels],
            ready: vec![vec![]; channels],
            delay,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels
    }

    /// Count `frames_in` input frames of silence, already handed out as `frames_out` output
    /// frames, as part of the track. Only valid before the first call to `process`.
    pub(crate) fn skip_leading(&mut self, frames_in: i64, frames_out: i64) {
        self.frames_in += frames_in;
        self.frames_out += frames_out;
    }

    /// Convert `input`, returning whatever output is ready.
    pub(crate) fn process(&mut self, input: &AudioSegment) -> Result<AudioSegment> {
        for (pending, channel) in self.pending.iter_mut().zip(input.to_planar(self.channels)) {
            pending.extend(channel);
        }
        self.frames_in += input.duration();
        while self.pending[0].len() >= self.inner.input_frames_next() {
            self.run_chunk()?;
        }
        let expected = rate_convert_round_down(self.output_rate, self.input_rate, self.frames_in);
        Ok(self.release(expected))
    }

    /// Produce the rest of the output, so that the total output is the rounded conversion of
    /// the total input.
    pub(crate) fn flush(&mut self) -> Result<AudioSegment> {
        let expected = rate_convert_round(self.output_rate, self.input_rate, self.frames_in);
        let wanted = cast_usize!((expected - self.frames_out).max(0));
        while self.ready[0].len() < wanted {
            let needed = self.inner.input_frames_next();
            for pending in &mut self.pending {
                pending.resize(needed.max(pending.len()), 0.0);
            }
            if !self.run_chunk()? {
                break;
            }
        }
        Ok(self.release(expected))
    }

    /// Run one chunk through the resampler. Returns false if it produced nothing.
    fn run_chunk(&mut self) -> Result<bool> {
        let needed = self.inner.input_frames_next();
        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|pending| pending.drain(..needed).collect())
            .collect();
        let output = self.inner.process(&chunk, None)?;
        let produced = output.first().map_or(0, Vec::len);
        let skip = self.delay.min(produced);
        self.delay -= skip;
        for (ready, channel) in self.ready.iter_mut().zip(output) {
            ready.extend_from_slice(&channel[skip..]);
        }
        Ok(produced > 0)
    }

    fn release(&mut self, expected: i64) -> AudioSegment {
        let frames = cast_usize!((expected - self.frames_out).max(0)).min(self.ready[0].len());
        if frames == 0 {
            return AudioSegment::new();
        }
        self.frames_out += util::cast_ticks!(frames);
        let released = self
            .ready
            .iter_mut()
            .map(|ready| ready.drain(..frames).collect())
            .collect();
        AudioSegment::from_planar(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frames: usize, rate: f32) -> AudioSegment {
        let samples = (0..frames)
            .map(|n| (n as f32 * 440.0 * std::f32::consts::TAU / rate).sin())
            .collect();
        AudioSegment::from_planar(vec![samples])
    }

    #[test]
    fn output_never_runs_ahead_of_input() {
        let mut resampler = TrackResampler::new(44_100, 48_000, 1).unwrap();
        let mut total = 0;
        for _ in 0..10 {
            total += resampler.process(&sine(300, 44_100.0)).unwrap().duration();
            assert!(total <= rate_convert_round_down(48_000, 44_100, resampler.frames_in));
        }
    }

    #[test]
    fn flushed_duration_matches_the_rate_ratio() {
        let cases = [(44_100, 48_000, 1000), (96_000, 48_000, 4410), (8_000, 48_000, 7)];
        for (input, output, frames) in cases {
            let mut resampler = TrackResampler::new(input, output, 2).unwrap();
            let input_data = sine(frames, input as f32);
            let mut duration = resampler.process(&input_data).unwrap().duration();
            duration += resampler.flush().unwrap().duration();
            let expected = rate_convert_round(output, input, frames as i64);
            assert_eq!(duration, expected, "{input} -> {output}");
        }
    }
}
