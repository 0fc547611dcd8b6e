//! Signal processing stages of the output chain.

pub mod biquad;
pub mod convolver;

pub use biquad::{Biquad, BiquadCoeffs};
pub use convolver::{Convolver, ImpulseSpectra};

/// Frames processed per graph render pass; also the convolver partition size.
pub const RENDER_QUANTUM: usize = 256;
