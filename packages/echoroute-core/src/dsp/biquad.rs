//! Biquad filter in Transposed Direct Form II.
//!
//! TDF-II keeps quantization noise low in floating point and stays stable
//! when coefficients change between chunks. Only the two responses the
//! pipeline needs are provided: peaking EQ bands and the 20 Hz DC-removal
//! high-pass.

use std::f64::consts::PI;

/// Normalized biquad coefficients (a0 divided out).
#[derive(Debug, Clone, Copy, Default)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Identity filter.
    pub fn bypass() -> Self {
        Self {
            b0: 1.0,
            ..Default::default()
        }
    }

    /// Peaking EQ coefficients (RBJ cookbook).
    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// High-pass coefficients (RBJ cookbook).
    pub fn highpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

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
}

/// One biquad filter with its state, processed sample-by-sample.
#[derive(Debug, Clone)]
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

    /// A peaking band at `freq` with the given linear band gain.
    ///
    /// The band value is the user-facing `[0.0, 2.0]` knob; it maps to
    /// decibels as `10 * (band - 1)`, so 1.0 is flat and 2.0 is +10 dB.
    pub fn peaking_band(freq: f64, q: f64, band_gain: f64, sample_rate: f64) -> Self {
        let gain_db = 10.0 * (band_gain - 1.0);
        Self::new(BiquadCoeffs::peaking(freq, q, gain_db, sample_rate))
    }

    /// The 20 Hz DC-removal high-pass.
    pub fn dc_blocker(sample_rate: f64) -> Self {
        Self::new(BiquadCoeffs::highpass(20.0, std::f64::consts::FRAC_1_SQRT_2, sample_rate))
    }

    /// Processes one sample (Transposed Direct Form II).
    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.coeffs.b0 * x + self.z1;
        self.z1 = self.coeffs.b1 * x - self.coeffs.a1 * y + self.z2;
        self.z2 = self.coeffs.b2 * x - self.coeffs.a2 * y;
        y
    }

    /// Clears the filter state.
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Steady-state gain of a filter at `freq` measured by driving it with a
    /// sine and comparing RMS in the settled tail.
    fn measure_gain(filter: &mut Biquad, freq: f64, sample_rate: f64) -> f64 {
        let samples = (sample_rate as usize).min(96000);
        let mut in_rms = 0.0;
        let mut out_rms = 0.0;
        for n in 0..samples {
            let x = (2.0 * PI * freq * n as f64 / sample_rate).sin() * 0.5;
            let y = filter.process(x);
            // Skip the first quarter while the filter settles.
            if n > samples / 4 {
                in_rms += x * x;
                out_rms += y * y;
            }
        }
        (out_rms / in_rms).sqrt()
    }

    #[test]
    fn flat_peaking_band_is_identity() {
        let mut filter = Biquad::peaking_band(1000.0, 1.0, 1.0, 96000.0);
        for n in 0..1000 {
            let x = (n as f64 * 0.01).sin();
            let y = filter.process(x);
            assert!((y - x).abs() < 1e-12, "sample {n}: {y} != {x}");
        }
    }

    #[test]
    fn peaking_band_boosts_center_frequency() {
        // Band 2.0 = +10 dB at center, measured at the oversampled rate.
        let mut filter = Biquad::peaking_band(1046.5, 1.0, 2.0, 96000.0);
        let gain_db = 20.0 * measure_gain(&mut filter, 1046.5, 96000.0).log10();
        assert!(
            (gain_db - 10.0).abs() < 0.5,
            "center gain {gain_db} dB, expected 10 dB"
        );
    }

    #[test]
    fn peaking_band_leaves_distant_frequencies_alone() {
        let mut filter = Biquad::peaking_band(1046.5, 1.0, 2.0, 96000.0);
        let gain_db = 20.0 * measure_gain(&mut filter, 60.0, 96000.0).log10();
        assert!(gain_db.abs() < 0.5, "far-field gain {gain_db} dB");
    }

    #[test]
    fn dc_blocker_removes_constant_offset() {
        let mut filter = Biquad::dc_blocker(96000.0);
        let mut last = 1.0;
        for _ in 0..96000 {
            last = filter.process(1.0);
        }
        assert!(last.abs() < 1e-3, "residual DC {last}");
    }

    #[test]
    fn dc_blocker_passes_audio_band() {
        let mut filter = Biquad::dc_blocker(96000.0);
        let gain = measure_gain(&mut filter, 1000.0, 96000.0);
        assert!((gain - 1.0).abs() < 0.01, "1 kHz gain {gain}");
    }
}
