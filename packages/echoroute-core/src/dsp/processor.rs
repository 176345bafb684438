//! The per-path DSP kernel.
//!
//! One [`AudioProcessor`] converts 1152-byte chunks in a fixed input format
//! into 32-bit signed PCM in the configured output format. The stage order
//! is fixed:
//!
//! 1. left-align input samples into `i32` and normalize to `f64`
//! 2. volume, then soft-clip
//! 3. upsample to `output_rate * 2`
//! 4. split interleaved data into per-channel buffers
//! 5. speaker mix (input channels -> output channels)
//! 6. 20 Hz DC-removal high-pass per channel
//! 7. 18-band peaking EQ per channel, soft-clipping after boosting bands
//! 8. merge back to interleaved
//! 9. decimate to `output_rate`
//! 10. noise-shaped TPDF dither, requantize to `i32`
//!
//! When the whole chain is provably identity (same rate, unity volume, same
//! channel count, identity mix, flat EQ) the kernel short-circuits to the
//! scaled input. The predicate is cached and invalidated by the setters.

use crate::protocol::StreamFormat;
use crate::protocol_constants::{CHUNK_SIZE, EQ_CENTER_FREQUENCIES, OVERSAMPLING_FACTOR};
use crate::state::{EqualizerSettings, SpeakerLayoutMatrix};

use super::biquad::Biquad;
use super::dither::NoiseShapingDither;
use super::layout::MixMatrix;
use super::resampler::LinearResampler;
use super::softclip::soft_clip;
use super::I32_SCALE;

/// Q of every EQ band.
const EQ_BAND_Q: f64 = 1.0;

/// When set, band gains are rescaled so the loudest band sits at 1.0
/// before converting to decibels, trading absolute boost for headroom.
const NORMALIZE_EQ_GAIN: bool = false;

/// Construction parameters for one kernel instance.
#[derive(Debug, Clone)]
pub struct ProcessorSpec {
    pub input_format: StreamFormat,
    pub output_channels: u8,
    pub output_sample_rate: u32,
    pub volume: f32,
    pub eq: EqualizerSettings,
    /// Optional mix-matrix override for this input channel count.
    pub custom_layout: Option<SpeakerLayoutMatrix>,
    /// Fixed dither seed for reproducible renders; `None` seeds from the OS.
    pub dither_seed: Option<u64>,
    /// Prefix used in log lines, e.g. the owning path id.
    pub log_context: String,
}

/// Stateful per-path DSP kernel.
pub struct AudioProcessor {
    input_format: StreamFormat,
    output_channels: u8,
    output_sample_rate: u32,
    volume: f32,
    eq: EqualizerSettings,
    mix: MixMatrix,
    upsampler: LinearResampler,
    downsampler: LinearResampler,
    dc_filters: Vec<Biquad>,
    /// `eq_filters[output_channel][band]`.
    eq_filters: Vec<Vec<Biquad>>,
    dither: NoiseShapingDither,
    /// Cached bypass predicate; `None` after any parameter change.
    bypass: Option<bool>,
    log_context: String,
    // Scratch buffers, allocated once and reused across chunks.
    scratch_split: Vec<Vec<f64>>,
    scratch_mixed: Vec<Vec<f64>>,
}

impl AudioProcessor {
    /// Creates a kernel for the given format pair.
    pub fn new(spec: ProcessorSpec) -> Self {
        let oversampled_rate = spec.output_sample_rate * OVERSAMPLING_FACTOR;
        let input_channels = spec.input_format.channels;

        let mix = match &spec.custom_layout {
            Some(custom) => MixMatrix::from_custom(input_channels, spec.output_channels, custom),
            None => MixMatrix::for_channels(input_channels, spec.output_channels),
        };

        let dither = match spec.dither_seed {
            Some(seed) => NoiseShapingDither::with_seed(
                spec.input_format.bit_depth,
                spec.output_channels as usize,
                seed,
            ),
            None => NoiseShapingDither::new(
                spec.input_format.bit_depth,
                spec.output_channels as usize,
            ),
        };

        let mut processor = Self {
            upsampler: LinearResampler::new(
                spec.input_format.sample_rate,
                oversampled_rate,
                input_channels as usize,
            ),
            downsampler: LinearResampler::new(
                oversampled_rate,
                spec.output_sample_rate,
                spec.output_channels as usize,
            ),
            dc_filters: (0..spec.output_channels)
                .map(|_| Biquad::dc_blocker(f64::from(oversampled_rate)))
                .collect(),
            eq_filters: Vec::new(),
            dither,
            mix,
            input_format: spec.input_format,
            output_channels: spec.output_channels,
            output_sample_rate: spec.output_sample_rate,
            volume: spec.volume.clamp(0.0, 1.0),
            eq: spec.eq,
            bypass: None,
            log_context: spec.log_context,
            scratch_split: vec![Vec::new(); input_channels as usize],
            scratch_mixed: vec![Vec::new(); spec.output_channels as usize],
        };
        processor.rebuild_eq_filters();
        processor
    }

    /// The input format this kernel was built for.
    #[inline]
    pub fn input_format(&self) -> StreamFormat {
        self.input_format
    }

    /// Sets the linear volume, clamped to `[0.0, 1.0]`.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.bypass = None;
    }

    /// Replaces the 18 band gains and rebuilds the filter bank.
    pub fn set_equalizer(&mut self, eq: EqualizerSettings) {
        self.eq = eq;
        self.rebuild_eq_filters();
        self.bypass = None;
    }

    /// Installs or clears a custom mix matrix for the current channel pair.
    pub fn set_mix_matrix(&mut self, custom: Option<&SpeakerLayoutMatrix>) {
        self.mix = match custom {
            Some(layout) => {
                MixMatrix::from_custom(self.input_format.channels, self.output_channels, layout)
            }
            None => MixMatrix::for_channels(self.input_format.channels, self.output_channels),
        };
        self.bypass = None;
    }

    /// Rebuilds the per-channel EQ bank from the current band gains.
    fn rebuild_eq_filters(&mut self) {
        let oversampled_rate = f64::from(self.output_sample_rate * OVERSAMPLING_FACTOR);
        let mut bands = *self.eq.bands();
        if NORMALIZE_EQ_GAIN {
            let max = bands.iter().cloned().fold(0.0f32, f32::max);
            if max > 1.0 {
                for band in &mut bands {
                    *band /= max;
                }
            }
        }
        self.eq_filters = (0..self.output_channels)
            .map(|_| {
                bands
                    .iter()
                    .zip(EQ_CENTER_FREQUENCIES.iter())
                    .map(|(&gain, &freq)| {
                        Biquad::peaking_band(freq, EQ_BAND_Q, f64::from(gain), oversampled_rate)
                    })
                    .collect()
            })
            .collect();
    }

    /// Evaluates (and caches) the bypass predicate: every stage is identity.
    fn is_bypass(&mut self) -> bool {
        if let Some(bypass) = self.bypass {
            return bypass;
        }
        let bypass = self.input_format.sample_rate == self.output_sample_rate
            && self.volume == 1.0
            && self.input_format.channels == self.output_channels
            && self.mix.is_identity()
            && self.eq.is_flat();
        self.bypass = Some(bypass);
        if bypass {
            log::debug!("[DSP] {} entering bypass", self.log_context);
        }
        bypass
    }

    /// Left-aligns the chunk's samples into `i32`.
    fn scale_to_i32(&self, chunk: &[u8]) -> Vec<i32> {
        match self.input_format.bit_depth {
            16 => chunk
                .chunks_exact(2)
                .map(|b| i32::from(i16::from_le_bytes([b[0], b[1]])) << 16)
                .collect(),
            24 => chunk
                .chunks_exact(3)
                .map(|b| i32::from_le_bytes([0, b[0], b[1], b[2]]))
                .collect(),
            _ => chunk
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        }
    }

    /// Processes one 1152-byte chunk, returning interleaved `i32` samples in
    /// the output format. The sample count varies by a frame between calls
    /// as resampler phase accumulates.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<i32> {
        debug_assert_eq!(chunk.len(), CHUNK_SIZE);

        let scaled = self.scale_to_i32(chunk);
        if self.is_bypass() {
            return scaled;
        }

        // Normalize and apply volume + soft clip.
        let volume = f64::from(self.volume);
        let samples: Vec<f64> = scaled
            .iter()
            .map(|&s| soft_clip(f64::from(s) / I32_SCALE * volume))
            .collect();

        // Upsample to the oversampled rate (still input channels).
        let upsampled = self.upsampler.process(&samples);
        let input_channels = self.input_format.channels as usize;
        let frames = upsampled.len() / input_channels;

        // Split into per-channel buffers.
        for (ch, buf) in self.scratch_split.iter_mut().enumerate() {
            buf.clear();
            buf.extend(upsampled.iter().skip(ch).step_by(input_channels));
        }

        // Speaker mix into the output channel layout.
        for buf in self.scratch_mixed.iter_mut() {
            buf.resize(frames, 0.0);
        }
        self.mix.apply(&self.scratch_split, &mut self.scratch_mixed);

        // DC removal and EQ per output channel.
        for (ch, buf) in self.scratch_mixed.iter_mut().enumerate() {
            let dc = &mut self.dc_filters[ch];
            for sample in buf.iter_mut() {
                *sample = dc.process(*sample);
            }
            for (band, filter) in self.eq_filters[ch].iter_mut().enumerate() {
                let gain = self.eq.bands()[band];
                if gain == 1.0 {
                    continue; // flat band is identity
                }
                // Only boosting bands can push past full scale.
                let clip_after = gain > 1.0;
                for sample in buf.iter_mut() {
                    let filtered = filter.process(*sample);
                    *sample = if clip_after {
                        soft_clip(filtered)
                    } else {
                        filtered
                    };
                }
            }
        }

        // Merge back to interleaved.
        let output_channels = self.output_channels as usize;
        let mut merged = Vec::with_capacity(frames * output_channels);
        for frame in 0..frames {
            for buf in self.scratch_mixed.iter() {
                merged.push(buf[frame]);
            }
        }

        // Decimate to the output rate, then dither down to i32.
        let decimated = self.downsampler.process(&merged);
        decimated
            .iter()
            .enumerate()
            .map(|(i, &s)| self.dither.process(s, i % output_channels))
            .collect()
    }
}
