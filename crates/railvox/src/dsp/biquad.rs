//! Biquad filter using Transposed Direct Form II.
//!
//! Only the high-pass response is needed by the tannoy stage. Resonance follows the
//! browser audio convention of Q expressed in dB.

use std::f64::consts::PI;

/// Normalized biquad coefficients (a0 = 1).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// High-pass with `q_db` resonance at the cutoff.
    pub fn highpass(freq: f64, q_db: f64, sample_rate: f64) -> Self {
        let nyquist = sample_rate / 2.0;
        let freq = freq.clamp(0.0, nyquist);

        // Degenerate cutoffs: pass everything at 0 Hz, nothing at Nyquist
        if freq <= 0.0 {
            return Self::passthrough();
        }
        if freq >= nyquist {
            return Self::default();
        }

        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let resonance = 10f64.powf(q_db / 20.0);
        let alpha = sin_omega / (2.0 * resonance);

        let b0 = (1.0 + cos_omega) / 2.0;
        let b1 = -(1.0 + cos_omega);
        let b2 = (1.0 + cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    pub fn passthrough() -> Self {
        Self {
            b0: 1.0,
            ..Self::default()
        }
    }
}

/// One channel of biquad state.
#[derive(Debug, Clone, Default)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        let x = input as f64;
        let c = &self.coeffs;
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y as f32
    }

    /// Filter channel `channel` of an interleaved block in place.
    pub fn process_interleaved(&mut self, block: &mut [f32], channels: usize, channel: usize) {
        for frame in block.chunks_exact_mut(channels) {
            frame[channel] = self.process_sample(frame[channel]);
        }
    }
}
