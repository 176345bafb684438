//! Stateful linear-interpolation resampler for interleaved audio.
//!
//! One instance converts between a fixed rate pair; the kernel owns two:
//! an upsampler to `output_rate * 2` and a decimator back to `output_rate`.
//! The fractional read position and the last frame of the previous chunk
//! carry across calls so chunk boundaries are seamless.

/// Linear-interpolation resampler over interleaved frames.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Input frames consumed per output frame.
    step: f64,
    /// Fractional read position relative to the current chunk; `-1.0` is the
    /// retained last frame of the previous chunk.
    position: f64,
    /// Last frame of the previous chunk, for interpolation across the seam.
    last_frame: Vec<f64>,
}

impl LinearResampler {
    /// Creates a resampler converting `input_rate` to `output_rate` for
    /// `channels`-channel interleaved data.
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Self {
        debug_assert!(input_rate > 0 && output_rate > 0 && channels > 0);
        Self {
            channels,
            step: f64::from(input_rate) / f64::from(output_rate),
            position: 0.0,
            last_frame: vec![0.0; channels],
        }
    }

    /// True when the rate pair makes this a passthrough.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.step == 1.0
    }

    /// Resamples one interleaved chunk, appending output frames to `out`.
    ///
    /// `input.len()` must be a multiple of the channel count. The number of
    /// output frames varies by one between calls as the phase accumulates.
    pub fn process_into(&mut self, input: &[f64], out: &mut Vec<f64>) {
        debug_assert_eq!(input.len() % self.channels, 0);
        let in_frames = input.len() / self.channels;
        if in_frames == 0 {
            return;
        }

        // Fast path: locked rates with integral phase.
        if self.step == 1.0 && self.position == 0.0 {
            out.extend_from_slice(input);
            self.last_frame
                .copy_from_slice(&input[(in_frames - 1) * self.channels..]);
            return;
        }

        // Interpolate while both neighbors are available; frame -1 is the
        // retained seam frame.
        while self.position <= (in_frames - 1) as f64 {
            let base = self.position.floor();
            let frac = self.position - base;
            let index = base as isize;

            for ch in 0..self.channels {
                let a = if index < 0 {
                    self.last_frame[ch]
                } else {
                    input[index as usize * self.channels + ch]
                };
                let b = if index + 1 < in_frames as isize {
                    input[(index + 1) as usize * self.channels + ch]
                } else {
                    // position == in_frames - 1 exactly; frac is 0.
                    a
                };
                out.push(a + (b - a) * frac);
            }
            self.position += self.step;
        }

        self.last_frame
            .copy_from_slice(&input[(in_frames - 1) * self.channels..]);
        self.position -= in_frames as f64;
    }

    /// Resamples one interleaved chunk into a fresh buffer.
    pub fn process(&mut self, input: &[f64]) -> Vec<f64> {
        let expected = (input.len() as f64 / self.step) as usize + self.channels;
        let mut out = Vec::with_capacity(expected);
        self.process_into(input, &mut out);
        out
    }

    /// Drops phase state (used when the input format is rebuilt).
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last_frame.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_rate_is_passthrough() {
        let mut resampler = LinearResampler::new(48000, 48000, 2);
        let input: Vec<f64> = (0..96).map(|i| i as f64 / 100.0).collect();
        assert_eq!(resampler.process(&input), input);
    }

    #[test]
    fn upsampling_doubles_frame_count_over_time() {
        let mut resampler = LinearResampler::new(48000, 96000, 1);
        let mut total_out = 0usize;
        for _ in 0..100 {
            let input = vec![0.25; 48];
            total_out += resampler.process(&input).len();
        }
        // 100 chunks x 48 frames at ratio 2 -> ~9600 output frames.
        assert!((9595..=9605).contains(&total_out), "got {total_out}");
    }

    #[test]
    fn downsampling_halves_frame_count_over_time() {
        let mut resampler = LinearResampler::new(96000, 48000, 2);
        let mut total_out = 0usize;
        for _ in 0..100 {
            let input = vec![0.5; 96 * 2];
            total_out += resampler.process(&input).len() / 2;
        }
        assert!((4795..=4805).contains(&total_out), "got {total_out}");
    }

    #[test]
    fn fractional_ratio_converges_on_expected_rate() {
        // 44.1 kHz -> 96 kHz, the worst-case non-integral path.
        let mut resampler = LinearResampler::new(44100, 96000, 1);
        let mut total_out = 0usize;
        let chunks = 1000;
        for _ in 0..chunks {
            total_out += resampler.process(&vec![0.0; 441]).len();
        }
        let expected = chunks as i64 * 441 * 96000 / 44100;
        let drift = (total_out as i64 - expected as i64).unsigned_abs();
        assert!(drift <= 2, "drift {drift} frames over {chunks} chunks");
    }

    #[test]
    fn interpolation_is_continuous_across_chunk_seams() {
        // A ramp split into chunks must come out as the same ramp.
        let mut resampler = LinearResampler::new(48000, 96000, 1);
        let mut out = Vec::new();
        for chunk in 0..4 {
            let input: Vec<f64> = (0..48).map(|i| (chunk * 48 + i) as f64).collect();
            resampler.process_into(&input, &mut out);
        }
        // After the first chunk's warm-up, consecutive samples differ by the
        // constant ramp slope divided by the upsampling factor.
        for pair in out[4..].windows(2) {
            let delta = pair[1] - pair[0];
            assert!((delta - 0.5).abs() < 1e-9, "seam discontinuity: {delta}");
        }
    }

    #[test]
    fn stereo_channels_stay_independent() {
        let mut resampler = LinearResampler::new(48000, 96000, 2);
        let mut input = Vec::new();
        for i in 0..48 {
            input.push(i as f64); // left ramp
            input.push(-(i as f64)); // right ramp, inverted
        }
        let out = resampler.process(&input);
        for frame in out.chunks_exact(2) {
            assert!((frame[0] + frame[1]).abs() < 1e-9);
        }
    }
}
