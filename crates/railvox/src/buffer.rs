//! Decoded PCM buffers and the decode step of the request pipeline.

use bytes::Bytes;
use rodio::Source;
use std::io::Cursor;

use crate::error::{VoxError, VoxResult};

/// Interleaved f32 PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn from_interleaved(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        let mut samples = samples;
        samples.truncate(samples.len() - samples.len() % channels as usize);
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// A buffer of silence, mostly useful for tests and padding.
    pub fn silent(frames: usize, channels: u16, sample_rate: u32) -> Self {
        Self::from_interleaved(vec![0.0; frames * channels as usize], channels, sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `frame` on `channel`; zero past the end.
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.samples
            .get(frame * self.channels as usize + channel)
            .copied()
            .unwrap_or(0.0)
    }

    /// De-interleaved copy of one channel.
    pub fn channel_data(&self, channel: usize) -> Vec<f32> {
        let step = self.channels as usize;
        self.samples
            .iter()
            .skip(channel)
            .step_by(step)
            .copied()
            .collect()
    }

    /// Up- or down-mix to `channels`. Mono fans out, many-to-mono averages, otherwise
    /// channels wrap.
    pub fn remix(self, channels: u16) -> Self {
        let channels = channels.max(1);
        if channels == self.channels {
            return self;
        }
        let src = self.channels as usize;
        let dst = channels as usize;
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * dst);
        for frame in self.samples.chunks_exact(src) {
            if dst == 1 {
                out.push(frame.iter().sum::<f32>() / src as f32);
            } else {
                out.extend((0..dst).map(|c| frame[c % src]));
            }
        }
        Self::from_interleaved(out, channels, self.sample_rate)
    }

    /// Linear-interpolation resample to `sample_rate`.
    pub fn resample(self, sample_rate: u32) -> Self {
        if sample_rate == self.sample_rate || self.sample_rate == 0 || self.samples.is_empty() {
            return Self {
                sample_rate: if self.sample_rate == 0 { sample_rate } else { self.sample_rate },
                ..self
            };
        }
        let ratio = self.sample_rate as f64 / sample_rate as f64;
        let channels = self.channels as usize;
        let in_frames = self.frames();
        let out_frames = ((in_frames as f64) / ratio).round().max(1.0) as usize;
        let mut out = Vec::with_capacity(out_frames * channels);
        for i in 0..out_frames {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            for c in 0..channels {
                let a = self.sample(idx, c);
                let b = if idx + 1 < in_frames { self.sample(idx + 1, c) } else { a };
                out.push(a + (b - a) * frac);
            }
        }
        Self::from_interleaved(out, self.channels, sample_rate)
    }
}

/// Decode MP3/WAV/FLAC/Vorbis bytes into the given output format.
///
/// Blocking; callers run it on the blocking pool.
pub fn decode(bytes: Bytes, channels: u16, sample_rate: u32) -> VoxResult<AudioBuffer> {
    if bytes.is_empty() {
        return Err(VoxError::Decode("empty input".to_string()));
    }
    let decoder = rodio::Decoder::new(Cursor::new(bytes))?;
    let src_channels = decoder.channels();
    let src_rate = decoder.sample_rate();
    let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
    if samples.is_empty() {
        return Err(VoxError::Decode("no audio frames".to_string()));
    }

    Ok(AudioBuffer::from_interleaved(samples, src_channels, src_rate)
        .remix(channels)
        .resample(sample_rate))
}
