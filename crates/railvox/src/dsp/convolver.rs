//! Uniformly partitioned FFT convolution (overlap-save).
//!
//! The impulse response is cut into `RENDER_QUANTUM`-sized partitions whose spectra are
//! computed once ([`ImpulseSpectra`], shared and cached). A [`Convolver`] holds the
//! per-use state: a frequency-domain delay line of past input blocks per channel.
//! Latency is zero as long as blocks arrive in whole quanta.

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

use super::RENDER_QUANTUM;
use crate::buffer::AudioBuffer;

/// Power floor used when normalizing near-silent impulse responses.
const MIN_POWER: f64 = 0.000125;
/// Overall calibration (-58 dB) so a normalized response sits near unity loudness.
const GAIN_CALIBRATION: f64 = 0.00125;
const GAIN_CALIBRATION_SAMPLE_RATE: f64 = 44_100.0;

/// Frequency-domain partitions of an impulse response, one list per IR channel.
pub struct ImpulseSpectra {
    channels: Vec<Vec<Vec<Complex<f32>>>>,
    frames: usize,
}

impl std::fmt::Debug for ImpulseSpectra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpulseSpectra")
            .field("channels", &self.channels.len())
            .field("partitions", &self.partition_count())
            .field("frames", &self.frames)
            .finish()
    }
}

impl ImpulseSpectra {
    /// Partition and transform `impulse`. With `normalize`, the response is scaled by its
    /// inverse RMS power so loud and quiet recordings come out at similar levels.
    pub fn new(impulse: &AudioBuffer, normalize: bool) -> Self {
        let block = RENDER_QUANTUM;
        let scale = if normalize {
            normalization_scale(impulse) as f32
        } else {
            1.0
        };

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(block * 2);
        let frames = impulse.frames();
        let partitions = frames.div_ceil(block).max(1);

        let channels = (0..impulse.channels() as usize)
            .map(|c| {
                let data = impulse.channel_data(c);
                (0..partitions)
                    .map(|p| {
                        let mut padded = fft.make_input_vec();
                        let start = p * block;
                        let end = (start + block).min(data.len());
                        if start < end {
                            for (dst, src) in padded.iter_mut().zip(&data[start..end]) {
                                *dst = src * scale;
                            }
                        }
                        let mut spectrum = fft.make_output_vec();
                        // Lengths come from the plan itself
                        let _ = fft.process(&mut padded, &mut spectrum);
                        spectrum
                    })
                    .collect()
            })
            .collect();

        Self { channels, frames }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn partition_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Length of the source response in frames.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

fn normalization_scale(impulse: &AudioBuffer) -> f64 {
    let samples = impulse.samples();
    if samples.is_empty() {
        return 1.0;
    }
    let power: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let power = (power / samples.len() as f64).sqrt().max(MIN_POWER);

    let mut scale = GAIN_CALIBRATION / power;
    if impulse.sample_rate() > 0 {
        scale *= GAIN_CALIBRATION_SAMPLE_RATE / impulse.sample_rate() as f64;
    }
    // True-stereo responses feed each output twice
    if impulse.channels() == 4 {
        scale *= 0.5;
    }
    scale
}

struct ChannelState {
    /// Ring of input spectra, newest at `head`.
    history: Vec<Vec<Complex<f32>>>,
    head: usize,
    /// Previous input block (first half of the overlap-save frame).
    previous: Vec<f32>,
}

/// Running convolution of interleaved blocks against one impulse response.
pub struct Convolver {
    spectra: Arc<ImpulseSpectra>,
    states: Vec<ChannelState>,
    fft: Arc<dyn RealToComplex<f32>>,
    ifft: Arc<dyn ComplexToReal<f32>>,
    time_scratch: Vec<f32>,
    freq_scratch: Vec<Complex<f32>>,
    accum: Vec<Complex<f32>>,
}

impl Convolver {
    pub fn new(spectra: Arc<ImpulseSpectra>, channels: usize) -> Self {
        let block = RENDER_QUANTUM;
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(block * 2);
        let ifft = planner.plan_fft_inverse(block * 2);
        let partitions = spectra.partition_count().max(1);

        let states = (0..channels)
            .map(|_| ChannelState {
                history: vec![fft.make_output_vec(); partitions],
                head: 0,
                previous: vec![0.0; block],
            })
            .collect();

        Self {
            time_scratch: fft.make_input_vec(),
            freq_scratch: fft.make_output_vec(),
            accum: fft.make_output_vec(),
            spectra,
            states,
            fft,
            ifft,
        }
    }

    pub fn spectra(&self) -> &Arc<ImpulseSpectra> {
        &self.spectra
    }

    /// Convolve one interleaved quantum (`RENDER_QUANTUM * channels` samples) in place.
    pub fn process(&mut self, block: &mut [f32], channels: usize) {
        let quantum = RENDER_QUANTUM;
        debug_assert_eq!(block.len(), quantum * channels);
        let ir_channels = self.spectra.channel_count();
        if ir_channels == 0 {
            return;
        }
        let scale = 1.0 / (quantum * 2) as f32;

        for (c, state) in self.states.iter_mut().enumerate().take(channels) {
            // Frame = [previous block, current block]
            self.time_scratch[..quantum].copy_from_slice(&state.previous);
            for (i, frame) in block.chunks_exact(channels).enumerate() {
                self.time_scratch[quantum + i] = frame[c];
                state.previous[i] = frame[c];
            }

            let partitions = state.history.len();
            state.head = (state.head + partitions - 1) % partitions;
            let _ = self
                .fft
                .process(&mut self.time_scratch, &mut state.history[state.head]);

            let ir = &self.spectra.channels[c % ir_channels];
            self.accum.iter_mut().for_each(|bin| *bin = Complex::new(0.0, 0.0));
            for (p, partition) in ir.iter().enumerate() {
                let input = &state.history[(state.head + p) % partitions];
                for ((acc, x), h) in self.accum.iter_mut().zip(input).zip(partition) {
                    *acc += x * h;
                }
            }

            self.freq_scratch.copy_from_slice(&self.accum);
            // Real-signal spectra: DC and Nyquist bins carry no imaginary part
            if let Some(first) = self.freq_scratch.first_mut() {
                first.im = 0.0;
            }
            if let Some(last) = self.freq_scratch.last_mut() {
                last.im = 0.0;
            }
            if self
                .ifft
                .process(&mut self.freq_scratch, &mut self.time_scratch)
                .is_err()
            {
                self.time_scratch.fill(0.0);
            }

            for (i, frame) in block.chunks_exact_mut(channels).enumerate() {
                frame[c] = self.time_scratch[quantum + i] * scale;
            }
        }
    }
}
