//! Audio segments.
//!
//! An [AudioSegment] is a list of [AudioChunk]s. A chunk either references a range of a shared
//! planar buffer or is silence ("null"). Slicing and appending never copy samples.
use std::sync::Arc;

use util::{cast_ticks, cast_usize, time::StreamTime};

/// Planar samples, one `Vec` per channel, shared between chunks.
pub type SharedChannels = Arc<Vec<Vec<f32>>>;

#[derive(Clone, Debug)]
pub struct AudioChunk {
    buffer: Option<SharedChannels>,
    offset: usize,
    duration: StreamTime,
    volume: f32,
}

#[derive(Clone, Debug, Default)]
pub struct AudioSegment {
    chunks: Vec<AudioChunk>,
    duration: StreamTime,
}

impl AudioChunk {
    pub fn null(duration: StreamTime) -> Self {
        Self {
            buffer: None,
            offset: 0,
            duration,
            volume: 1.0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn duration(&self) -> StreamTime {
        self.duration
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn channel_count(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.len())
    }

    /// The sample for output `channel` at `frame` within this chunk. Mono is copied to every
    /// channel; channels the chunk does not have are silent.
    #[inline]
    pub fn sample(&self, channel: usize, frame: usize) -> f32 {
        let Some(buffer) = &self.buffer else {
            return 0.0;
        };
        let source = match buffer.len() {
            0 => return 0.0,
            1 => &buffer[0],
            n if channel < n => &buffer[channel],
            _ => return 0.0,
        };
        source.get(self.offset + frame).copied().unwrap_or(0.0) * self.volume
    }

    fn slice(&self, start: StreamTime, end: StreamTime) -> Self {
        Self {
            buffer: self.buffer.clone(),
            offset: self.offset + cast_usize!(start.max(0)),
            duration: end - start,
            volume: self.volume,
        }
    }
}

impl AudioSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// A segment holding one planar buffer. Channels are truncated to the shortest one.
    pub fn from_planar(channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        let mut segment = Self::new();
        segment.append_buffer(Arc::new(channels), 0, frames);
        segment
    }

    pub fn from_interleaved(samples: &[f32], num_channels: usize) -> Self {
        if num_channels == 0 {
            return Self::new();
        }
        let frames = samples.len() / num_channels;
        let channels = (0..num_channels)
            .map(|channel| {
                (0..frames)
                    .map(|frame| samples[frame * num_channels + channel])
                    .collect()
            })
            .collect();
        Self::from_planar(channels)
    }

    pub fn duration(&self) -> StreamTime {
        self.duration
    }

    pub fn is_empty(&self) -> bool {
        self.duration == 0
    }

    pub fn is_null(&self) -> bool {
        self.chunks.iter().all(AudioChunk::is_null)
    }

    pub fn chunks(&self) -> &[AudioChunk] {
        &self.chunks
    }

    /// The largest channel count of any chunk.
    pub fn channel_count(&self) -> usize {
        self.chunks
            .iter()
            .map(AudioChunk::channel_count)
            .max()
            .unwrap_or(0)
    }

    pub fn append_buffer(&mut self, buffer: SharedChannels, offset: usize, frames: usize) {
        self.push(AudioChunk {
            buffer: Some(buffer),
            offset,
            duration: cast_ticks!(frames),
            volume: 1.0,
        });
    }

    pub fn append_null(&mut self, duration: StreamTime) {
        self.push(AudioChunk::null(duration));
    }

    /// Append `[start, end)` of `source`. The range is clamped to the source's duration.
    pub fn append_slice(&mut self, source: &AudioSegment, start: StreamTime, end: StreamTime) {
        let start = start.max(0);
        let end = end.min(source.duration);
        let mut offset = 0;
        for chunk in &source.chunks {
            let chunk_end = offset + chunk.duration;
            if chunk_end > start && offset < end {
                let from = start.max(offset) - offset;
                let to = end.min(chunk_end) - offset;
                self.push(chunk.slice(from, to));
            }
            if chunk_end >= end {
                break;
            }
            offset = chunk_end;
        }
    }

    /// Move every chunk of `other` onto the end of this segment.
    pub fn append_from(&mut self, other: &mut AudioSegment) {
        for chunk in other.chunks.drain(..) {
            self.push(chunk);
        }
        other.duration = 0;
    }

    pub fn remove_leading(&mut self, duration: StreamTime) {
        let mut remaining = duration.min(self.duration);
        self.duration -= remaining.max(0);
        let mut drop = 0;
        for chunk in &mut self.chunks {
            if remaining <= 0 {
                break;
            }
            if chunk.duration <= remaining {
                remaining -= chunk.duration;
                drop += 1;
            } else {
                *chunk = chunk.slice(remaining, chunk.duration);
                remaining = 0;
            }
        }
        self.chunks.drain(..drop);
    }

    /// Replace everything before `time` with silence, releasing the samples.
    pub fn forget_up_to(&mut self, time: StreamTime) {
        let time = time.min(self.duration);
        if time <= 0 {
            return;
        }
        self.remove_leading(time);
        let mut chunks = Vec::with_capacity(self.chunks.len() + 1);
        chunks.push(AudioChunk::null(time));
        chunks.append(&mut self.chunks);
        self.chunks = chunks;
        self.duration += time;
        self.coalesce_front();
    }

    /// Replace all data with silence of the same duration.
    pub fn replace_with_null(&mut self) {
        let duration = self.duration;
        self.chunks.clear();
        self.duration = 0;
        self.append_null(duration);
    }

    pub fn apply_volume(&mut self, volume: f32) {
        for chunk in &mut self.chunks {
            chunk.volume *= volume;
        }
    }

    /// Add this segment into an interleaved buffer of `num_channels`, scaled by `volume`.
    pub fn mix_into(&self, output: &mut [f32], num_channels: usize, volume: f32) {
        if num_channels == 0 {
            return;
        }
        let mut frame = 0;
        for chunk in &self.chunks {
            let frames = cast_usize!(chunk.duration.max(0));
            if !chunk.is_null() {
                for n in 0..frames {
                    let base = (frame + n) * num_channels;
                    let Some(out) = output.get_mut(base..base + num_channels) else {
                        return;
                    };
                    for (channel, sample) in out.iter_mut().enumerate() {
                        *sample += chunk.sample(channel, n) * volume;
                    }
                }
            }
            frame += frames;
        }
    }

    /// Copy the segment out as planar samples with `num_channels` channels.
    pub fn to_planar(&self, num_channels: usize) -> Vec<Vec<f32>> {
        let frames = cast_usize!(self.duration.max(0));
        let mut channels = vec![vec![0.0; frames]; num_channels];
        let mut frame = 0;
        for chunk in &self.chunks {
            let len = cast_usize!(chunk.duration.max(0));
            if !chunk.is_null() {
                for (index, channel) in channels.iter_mut().enumerate() {
                    for n in 0..len {
                        channel[frame + n] = chunk.sample(index, n);
                    }
                }
            }
            frame += len;
        }
        channels
    }

    fn push(&mut self, chunk: AudioChunk) {
        if chunk.duration <= 0 {
            return;
        }
        self.duration += chunk.duration;
        if let Some(last) = self.chunks.last_mut() {
            if last.is_null() && chunk.is_null() {
                last.duration += chunk.duration;
                return;
            }
        }
        self.chunks.push(chunk);
    }

    fn coalesce_front(&mut self) {
        if self.chunks.len() >= 2 && self.chunks[0].is_null() && self.chunks[1].is_null() {
            let extra = self.chunks.remove(1).duration;
            self.chunks[0].duration += extra;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(frames: usize) -> AudioSegment {
        AudioSegment::from_planar(vec![(0..frames).map(|n| n as f32).collect()])
    }

    #[test]
    fn slices_share_samples() {
        let source = ramp(10);
        let mut segment = AudioSegment::new();
        segment.append_null(2);
        segment.append_slice(&source, 3, 6);
        segment.append_slice(&source, 8, 100);
        assert_eq!(segment.duration(), 7);
        let planar = segment.to_planar(1);
        assert_eq!(planar[0], vec![0.0, 0.0, 3.0, 4.0, 5.0, 8.0, 9.0]);
    }

    #[test]
    fn forgetting_keeps_the_duration() {
        let mut segment = ramp(10);
        segment.forget_up_to(4);
        assert_eq!(segment.duration(), 10);
        assert!(segment.chunks()[0].is_null());
        assert_eq!(segment.to_planar(1)[0][3..6], [0.0, 4.0, 5.0]);

        segment.forget_up_to(6);
        assert_eq!(segment.chunks().len(), 2);
        assert_eq!(segment.chunks()[0].duration(), 6);
    }

    #[test]
    fn nulls_coalesce() {
        let mut segment = AudioSegment::new();
        segment.append_null(5);
        segment.append_null(5);
        assert_eq!(segment.chunks().len(), 1);
        assert!(segment.is_null());
        let mut other = ramp(3);
        segment.append_from(&mut other);
        assert_eq!(other.duration(), 0);
        assert_eq!(segment.duration(), 13);
        segment.replace_with_null();
        assert!(segment.is_null());
        assert_eq!(segment.duration(), 13);
    }

    #[test]
    fn mono_is_upmixed_when_mixing() {
        let mut segment = AudioSegment::from_planar(vec![vec![0.5, 0.25]]);
        segment.apply_volume(0.5);
        let mut output = vec![1.0; 4];
        segment.mix_into(&mut output, 2, 2.0);
        assert_relative_eq!(output[0], 1.5);
        assert_relative_eq!(output[1], 1.5);
        assert_relative_eq!(output[2], 1.25);
        assert_relative_eq!(output[3], 1.25);
    }

    #[test]
    fn interleaved_round_trips_through_planar() {
        let segment = AudioSegment::from_interleaved(&[1.0, -1.0, 2.0, -2.0], 2);
        assert_eq!(segment.channel_count(), 2);
        assert_eq!(segment.to_planar(2), vec![vec![1.0, 2.0], vec![-1.0, -2.0]]);
    }
}
