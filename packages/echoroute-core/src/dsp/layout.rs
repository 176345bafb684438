//! Speaker-mix gain matrices.
//!
//! A matrix maps `input_channels` onto `output_channels`:
//! `gains[input][output]`. The built-in tables cover mono, stereo, quad,
//! 5.1, and 7.1 in WAVEFORMATEX channel order
//! (FL FR [C LFE] [BL BR] [SL SR]); per-path overrides can replace any
//! table.
//!
//! The tables follow one pattern: each output sums its contributing inputs
//! with gains that keep perceived level near unity. Upmixes duplicate
//! fronts into the rears and feed center/LFE at half level; downmixes are
//! the transpose at half level; N-to-1 collapses with equal `1/N` gains.

use serde::{Deserialize, Serialize};

use crate::state::SpeakerLayoutMatrix;

/// A speaker-mix matrix with its dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixMatrix {
    input_channels: usize,
    output_channels: usize,
    /// `gains[input][output]`.
    gains: Vec<Vec<f32>>,
}

impl MixMatrix {
    /// Builds the built-in matrix for a channel-count pair.
    pub fn for_channels(input_channels: u8, output_channels: u8) -> Self {
        let inputs = input_channels as usize;
        let outputs = output_channels as usize;
        let gains = builtin_table(inputs, outputs);
        Self {
            input_channels: inputs,
            output_channels: outputs,
            gains,
        }
    }

    /// Wraps a user-supplied override, padding or truncating rows to the
    /// expected dimensions (missing gains are zero).
    pub fn from_custom(
        input_channels: u8,
        output_channels: u8,
        custom: &SpeakerLayoutMatrix,
    ) -> Self {
        let inputs = input_channels as usize;
        let outputs = output_channels as usize;
        let mut gains = vec![vec![0.0f32; outputs]; inputs];
        for (row, custom_row) in gains.iter_mut().zip(custom.iter()) {
            for (slot, &gain) in row.iter_mut().zip(custom_row.iter()) {
                *slot = gain;
            }
        }
        Self {
            input_channels: inputs,
            output_channels: outputs,
            gains,
        }
    }

    #[inline]
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    #[inline]
    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Gain from `input` to `output`.
    #[inline]
    pub fn gain(&self, input: usize, output: usize) -> f32 {
        self.gains[input][output]
    }

    /// True when the matrix is square with 1.0 on the diagonal and 0.0
    /// elsewhere (part of the DSP bypass predicate).
    pub fn is_identity(&self) -> bool {
        if self.input_channels != self.output_channels {
            return false;
        }
        self.gains.iter().enumerate().all(|(i, row)| {
            row.iter()
                .enumerate()
                .all(|(o, &g)| if i == o { g == 1.0 } else { g == 0.0 })
        })
    }

    /// Applies the matrix: `inputs` and `outputs` are per-channel sample
    /// buffers of equal length.
    pub fn apply(&self, inputs: &[Vec<f64>], outputs: &mut [Vec<f64>]) {
        debug_assert_eq!(inputs.len(), self.input_channels);
        debug_assert_eq!(outputs.len(), self.output_channels);
        for out_buf in outputs.iter_mut() {
            out_buf.fill(0.0);
        }
        for (input_idx, input_buf) in inputs.iter().enumerate() {
            for (output_idx, out_buf) in outputs.iter_mut().enumerate() {
                let gain = f64::from(self.gains[input_idx][output_idx]);
                if gain == 0.0 {
                    continue;
                }
                for (out, &sample) in out_buf.iter_mut().zip(input_buf.iter()) {
                    *out += gain * sample;
                }
            }
        }
    }
}

/// Identity matrix of the given size.
fn identity(n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| (0..n).map(|o| if i == o { 1.0 } else { 0.0 }).collect())
        .collect()
}

/// Builds the built-in gain table for an `(inputs, outputs)` pair.
fn builtin_table(inputs: usize, outputs: usize) -> Vec<Vec<f32>> {
    if inputs == outputs {
        return identity(inputs);
    }
    // Mono fans out to every output at unity.
    if inputs == 1 {
        return vec![vec![1.0; outputs]];
    }
    // Any layout collapses to mono with equal weights.
    if outputs == 1 {
        return vec![vec![1.0 / inputs as f32]; inputs];
    }
    match (inputs, outputs) {
        // Stereo upmixes: fronts duplicated into rears (and sides for 7.1),
        // center and LFE fed from both fronts at half level.
        (2, 4) => vec![
            vec![1.0, 0.0, 1.0, 0.0], // L -> FL, BL
            vec![0.0, 1.0, 0.0, 1.0], // R -> FR, BR
        ],
        (2, 6) => vec![
            vec![1.0, 0.0, 0.5, 0.5, 1.0, 0.0], // L -> FL, C/2, LFE/2, BL
            vec![0.0, 1.0, 0.5, 0.5, 0.0, 1.0], // R -> FR, C/2, LFE/2, BR
        ],
        (2, 8) => vec![
            vec![1.0, 0.0, 0.5, 0.5, 1.0, 0.0, 1.0, 0.0],
            vec![0.0, 1.0, 0.5, 0.5, 0.0, 1.0, 0.0, 1.0],
        ],
        // Quad up/downmixes.
        (4, 2) => vec![
            vec![0.5, 0.0],
            vec![0.0, 0.5],
            vec![0.5, 0.0],
            vec![0.0, 0.5],
        ],
        (4, 6) => vec![
            vec![1.0, 0.0, 0.25, 0.25, 0.0, 0.0],
            vec![0.0, 1.0, 0.25, 0.25, 0.0, 0.0],
            vec![0.0, 0.0, 0.25, 0.25, 1.0, 0.0],
            vec![0.0, 0.0, 0.25, 0.25, 0.0, 1.0],
        ],
        (4, 8) => vec![
            vec![1.0, 0.0, 0.25, 0.25, 0.0, 0.0, 0.5, 0.0],
            vec![0.0, 1.0, 0.25, 0.25, 0.0, 0.0, 0.0, 0.5],
            vec![0.0, 0.0, 0.25, 0.25, 1.0, 0.0, 0.5, 0.0],
            vec![0.0, 0.0, 0.25, 0.25, 0.0, 1.0, 0.0, 0.5],
        ],
        // 5.1 folddowns and upmix.
        (6, 2) => vec![
            vec![0.5, 0.0],
            vec![0.0, 0.5],
            vec![0.25, 0.25],
            vec![0.25, 0.25],
            vec![0.5, 0.0],
            vec![0.0, 0.5],
        ],
        (6, 4) => vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ],
        (6, 8) => vec![
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0],
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.5, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.5],
        ],
        // 7.1 folddowns.
        (8, 2) => vec![
            vec![0.5, 0.0],
            vec![0.0, 0.5],
            vec![0.25, 0.25],
            vec![0.25, 0.25],
            vec![0.5, 0.0],
            vec![0.0, 0.5],
            vec![0.5, 0.0],
            vec![0.0, 0.5],
        ],
        (8, 4) => vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![0.25, 0.25, 0.25, 0.25],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
            vec![0.5, 0.0, 0.5, 0.0],
            vec![0.0, 0.5, 0.0, 0.5],
        ],
        (8, 6) => vec![
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.0],
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.5],
        ],
        // Uncommon counts (3, 5, 7 channels): route same-index channels
        // through and leave the rest silent.
        _ => {
            let mut gains = vec![vec![0.0f32; outputs]; inputs];
            for (i, row) in gains.iter_mut().enumerate().take(outputs) {
                row[i] = 1.0;
            }
            gains
        }
    }
}
