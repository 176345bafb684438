//! Per-path DSP kernel and its building blocks.
//!
//! [`AudioProcessor`] is the stateful transform applied to every chunk a
//! source path plays out: sample scaling, volume with soft-clip, 2x
//! oversampled resampling, speaker remix, DC removal, 18-band EQ, and
//! noise-shaped dither back down to 32-bit integer PCM.
//!
//! All intermediate math is `f64` normalized to `[-1.0, 1.0]`; integers
//! only exist at the edges.

pub mod biquad;
pub mod dither;
pub mod layout;
pub mod processor;
pub mod resampler;
pub mod softclip;

pub use biquad::{Biquad, BiquadCoeffs};
pub use dither::NoiseShapingDither;
pub use layout::MixMatrix;
pub use processor::AudioProcessor;
pub use resampler::LinearResampler;
pub use softclip::soft_clip;

/// Scale factor between normalized `f64` samples and left-aligned `i32`.
pub(crate) const I32_SCALE: f64 = 2147483648.0; // 2^31
