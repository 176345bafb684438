//! Engine configuration and declarative desired-state types.
//!
//! Provides the sink/path configuration structs ([`SinkConfig`],
//! [`SourceConfig`]), the declarative state consumed by the reconciler
//! ([`DesiredEngineState`]), and the validation/clamping rules for
//! user-supplied parameters.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::{RouteError, RouteResult};
use crate::protocol::StreamFormat;
use crate::protocol_constants::{
    DEFAULT_RTP_PORT, DEFAULT_SCREAM_PORT, EQ_BANDS, MAX_CHANNELS, MAX_DELAY_MS,
    SUPPORTED_BIT_DEPTHS, SUPPORTED_SAMPLE_RATES, TIMESHIFT_RETENTION_SECS,
};

/// Relative tolerance used when diffing float parameters (volume, timeshift).
///
/// EQ values, delay, and formats compare exactly; only these two fields are
/// produced by UI sliders where re-serialization jitter is expected.
pub const FLOAT_TOLERANCE: f32 = 1e-5;

/// Returns true when two float parameters are equal within
/// [`FLOAT_TOLERANCE`] (relative).
#[inline]
pub fn float_params_equal(a: f32, b: f32) -> bool {
    (a - b).abs() <= FLOAT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Static engine configuration: the ingress ports bound at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// UDP port for Scream ingress.
    pub scream_port: u16,
    /// UDP port for RTP ingress.
    pub rtp_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scream_port: DEFAULT_SCREAM_PORT,
            rtp_port: DEFAULT_RTP_PORT,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sink Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Output configuration for one sink endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Destination IP for Scream/RTP egress.
    pub output_ip: IpAddr,
    /// Destination port.
    pub output_port: u16,
    /// Output bit depth (16, 24, or 32).
    pub bit_depth: u8,
    /// Output sample rate (one of the supported set).
    pub sample_rate: u32,
    /// Output channel count (1..=8).
    pub channels: u8,
    /// WAVEFORMATEX channel mask, low byte. Carried verbatim on the wire.
    pub chlayout1: u8,
    /// WAVEFORMATEX channel mask, high byte.
    pub chlayout2: u8,
    /// Use TCP instead of UDP for PCM egress.
    #[serde(default)]
    pub use_tcp: bool,
    /// Emit RTP instead of Scream datagrams (ignored when TCP is set).
    #[serde(default)]
    pub use_rtp: bool,
    /// Run the LAME side-stream for this sink.
    #[serde(default)]
    pub enable_mp3: bool,
    /// CBR bitrate of the MP3 side-stream (kbps).
    #[serde(default = "default_mp3_bitrate")]
    pub mp3_bitrate_kbps: u32,
}

fn default_mp3_bitrate() -> u32 {
    192
}

impl SinkConfig {
    /// Validates the configured output format.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::ConfigInvalid`] when the rate, depth, or channel
    /// count is outside the supported set. The rate check also guarantees the
    /// format is expressible in the Scream rate byte.
    pub fn validate(&self) -> RouteResult<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(RouteError::ConfigInvalid(format!(
                "sample rate {} not in supported set {SUPPORTED_SAMPLE_RATES:?}",
                self.sample_rate
            )));
        }
        if !SUPPORTED_BIT_DEPTHS.contains(&self.bit_depth) {
            return Err(RouteError::ConfigInvalid(format!(
                "bit depth {} not in {SUPPORTED_BIT_DEPTHS:?}",
                self.bit_depth
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(RouteError::ConfigInvalid(format!(
                "channel count {} out of range 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        Ok(())
    }

    /// The 5-byte-header form of this sink's output format.
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            bit_depth: self.bit_depth,
            channels: self.channels,
            chlayout1: self.chlayout1,
            chlayout2: self.chlayout2,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            output_port: 4010,
            bit_depth: 16,
            sample_rate: 48000,
            channels: 2,
            chlayout1: 0x03,
            chlayout2: 0x00,
            use_tcp: false,
            use_rtp: false,
            enable_mp3: false,
            mp3_bitrate_kbps: default_mp3_bitrate(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Equalizer Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Per-path 18-band equalizer, one linear gain per band in `[0.0, 2.0]`.
///
/// 1.0 is flat. Construction sanitizes: missing bands, NaN, and
/// out-of-range values are replaced with 1.0, so the band vector is always
/// exactly 18 long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct EqualizerSettings {
    bands: [f32; EQ_BANDS],
}

impl EqualizerSettings {
    /// Flat response (all bands 1.0).
    pub fn flat() -> Self {
        Self {
            bands: [1.0; EQ_BANDS],
        }
    }

    /// Builds settings from an arbitrary user-supplied vector, substituting
    /// 1.0 for every missing or invalid band.
    pub fn sanitize(values: &[f32]) -> Self {
        let mut bands = [1.0f32; EQ_BANDS];
        for (slot, &value) in bands.iter_mut().zip(values.iter()) {
            if value.is_finite() && (0.0..=2.0).contains(&value) {
                *slot = value;
            }
        }
        Self { bands }
    }

    /// The 18 band gains.
    #[inline]
    pub fn bands(&self) -> &[f32; EQ_BANDS] {
        &self.bands
    }

    /// True when every band is exactly 1.0 (the DSP bypass condition).
    pub fn is_flat(&self) -> bool {
        self.bands.iter().all(|&b| b == 1.0)
    }
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self::flat()
    }
}

impl From<Vec<f32>> for EqualizerSettings {
    fn from(values: Vec<f32>) -> Self {
        Self::sanitize(&values)
    }
}

impl From<EqualizerSettings> for Vec<f32> {
    fn from(eq: EqualizerSettings) -> Self {
        eq.bands.to_vec()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Path Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// A custom speaker-mix matrix: `gains[input_channel][output_channel]`.
///
/// Installed per input-channel-count to override the built-in mix tables
/// for one path.
pub type SpeakerLayoutMatrix = Vec<Vec<f32>>;

/// Runtime configuration handed to a new `SourceInputProcessor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Tag this path listens for (typically the sender's IPv4 string).
    pub source_tag: String,
    /// Linear volume, clamped to `[0.0, 1.0]`.
    pub volume: f32,
    /// 18-band equalizer.
    #[serde(default)]
    pub eq: EqualizerSettings,
    /// Fixed playout delay, clamped to `[0, 5000]` ms.
    pub delay_ms: u32,
    /// Rewind into the arrival buffer, clamped to the retention window.
    pub timeshift_sec: f32,
    /// Output channel count (copied from the target sink).
    pub output_channels: u8,
    /// Output sample rate (copied from the target sink).
    pub output_sample_rate: u32,
}

impl SourceConfig {
    /// Clamps volume, delay, and timeshift into their legal ranges,
    /// logging once when anything was out of range.
    pub fn clamped(mut self) -> Self {
        let mut adjusted = false;
        if !(0.0..=1.0).contains(&self.volume) || !self.volume.is_finite() {
            self.volume = self.volume.clamp(0.0, 1.0);
            if !self.volume.is_finite() {
                self.volume = 1.0;
            }
            adjusted = true;
        }
        if self.delay_ms > MAX_DELAY_MS {
            self.delay_ms = MAX_DELAY_MS;
            adjusted = true;
        }
        let max_shift = TIMESHIFT_RETENTION_SECS as f32;
        if !(0.0..=max_shift).contains(&self.timeshift_sec) || !self.timeshift_sec.is_finite() {
            self.timeshift_sec = if self.timeshift_sec.is_finite() {
                self.timeshift_sec.clamp(0.0, max_shift)
            } else {
                0.0
            };
            adjusted = true;
        }
        if adjusted {
            log::warn!(
                "[Config] Source path parameters clamped: tag={}, volume={}, delay={}ms, timeshift={}s",
                self.source_tag,
                self.volume,
                self.delay_ms,
                self.timeshift_sec
            );
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Desired Engine State (reconciler input)
// ─────────────────────────────────────────────────────────────────────────────

/// Desired state of one sink, including which paths feed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedSinkParams {
    pub sink_id: String,
    pub sink_engine_config: SinkConfig,
    /// Path ids that should be connected to this sink.
    #[serde(default)]
    pub connected_source_path_ids: Vec<String>,
}

/// Desired state of one source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedSourcePathParams {
    pub path_id: String,
    pub source_tag: String,
    pub target_sink_id: String,
    pub volume: f32,
    #[serde(default)]
    pub eq: EqualizerSettings,
    pub delay_ms: u32,
    #[serde(default)]
    pub timeshift_sec: f32,
    pub target_output_channels: u8,
    pub target_output_samplerate: u32,
    /// Optional per-input-channel-count mix-matrix overrides.
    #[serde(default)]
    pub speaker_layouts_map: BTreeMap<u8, SpeakerLayoutMatrix>,
    /// Instance id assigned by the manager on apply. Never part of equality.
    #[serde(skip)]
    pub generated_instance_id: Option<String>,
}

impl AppliedSourcePathParams {
    /// Builds the runtime [`SourceConfig`] for this path.
    pub fn to_source_config(&self) -> SourceConfig {
        SourceConfig {
            source_tag: self.source_tag.clone(),
            volume: self.volume,
            eq: self.eq.clone(),
            delay_ms: self.delay_ms,
            timeshift_sec: self.timeshift_sec,
            output_channels: self.target_output_channels,
            output_sample_rate: self.target_output_samplerate,
        }
        .clamped()
    }

    /// Parameter equality ignoring `generated_instance_id`, with float
    /// tolerance on volume and timeshift and exact comparison elsewhere.
    pub fn params_equal(&self, other: &Self) -> bool {
        self.path_id == other.path_id
            && self.source_tag == other.source_tag
            && self.target_sink_id == other.target_sink_id
            && float_params_equal(self.volume, other.volume)
            && self.eq == other.eq
            && self.delay_ms == other.delay_ms
            && float_params_equal(self.timeshift_sec, other.timeshift_sec)
            && self.target_output_channels == other.target_output_channels
            && self.target_output_samplerate == other.target_output_samplerate
            && self.speaker_layouts_map == other.speaker_layouts_map
    }

    /// True when the difference from `other` requires rebuilding the
    /// processor instead of updating it in place: a change of source tag,
    /// output channels, or output rate.
    pub fn is_fundamental_change(&self, other: &Self) -> bool {
        self.source_tag != other.source_tag
            || self.target_output_channels != other.target_output_channels
            || self.target_output_samplerate != other.target_output_samplerate
    }
}

/// The complete declarative state the reconciler drives the engine toward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredEngineState {
    #[serde(default)]
    pub sinks: Vec<AppliedSinkParams>,
    #[serde(default)]
    pub source_paths: Vec<AppliedSourcePathParams>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path() -> AppliedSourcePathParams {
        AppliedSourcePathParams {
            path_id: "p1".into(),
            source_tag: "192.168.1.10".into(),
            target_sink_id: "s1".into(),
            volume: 0.5,
            eq: EqualizerSettings::flat(),
            delay_ms: 0,
            timeshift_sec: 0.0,
            target_output_channels: 2,
            target_output_samplerate: 48000,
            speaker_layouts_map: BTreeMap::new(),
            generated_instance_id: None,
        }
    }

    #[test]
    fn sink_config_rejects_unsupported_rate() {
        let config = SinkConfig {
            sample_rate: 22050,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sink_config_accepts_all_supported_rates() {
        for rate in SUPPORTED_SAMPLE_RATES {
            let config = SinkConfig {
                sample_rate: rate,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "rate {rate}");
        }
    }

    #[test]
    fn eq_sanitize_fills_missing_bands_with_flat() {
        let eq = EqualizerSettings::sanitize(&[1.5, 0.5]);
        assert_eq!(eq.bands()[0], 1.5);
        assert_eq!(eq.bands()[1], 0.5);
        assert!(eq.bands()[2..].iter().all(|&b| b == 1.0));
    }

    #[test]
    fn eq_sanitize_replaces_invalid_values() {
        let eq = EqualizerSettings::sanitize(&[f32::NAN, -0.5, 3.0, 2.0]);
        assert_eq!(eq.bands()[0], 1.0);
        assert_eq!(eq.bands()[1], 1.0);
        assert_eq!(eq.bands()[2], 1.0);
        assert_eq!(eq.bands()[3], 2.0);
    }

    #[test]
    fn source_config_clamps_out_of_range_values() {
        let config = SourceConfig {
            source_tag: "10.0.0.1".into(),
            volume: 1.8,
            eq: EqualizerSettings::flat(),
            delay_ms: 9000,
            timeshift_sec: -3.0,
            output_channels: 2,
            output_sample_rate: 48000,
        }
        .clamped();
        assert_eq!(config.volume, 1.0);
        assert_eq!(config.delay_ms, MAX_DELAY_MS);
        assert_eq!(config.timeshift_sec, 0.0);
    }

    #[test]
    fn params_equal_tolerates_float_jitter() {
        let a = test_path();
        let mut b = test_path();
        b.volume = 0.500_001;
        assert!(a.params_equal(&b));
        b.volume = 0.51;
        assert!(!a.params_equal(&b));
    }

    #[test]
    fn params_equal_ignores_generated_instance_id() {
        let a = test_path();
        let mut b = test_path();
        b.generated_instance_id = Some("abc".into());
        assert!(a.params_equal(&b));
    }

    #[test]
    fn fundamental_change_detects_format_and_tag() {
        let a = test_path();

        let mut rate = test_path();
        rate.target_output_samplerate = 44100;
        assert!(a.is_fundamental_change(&rate));

        let mut tag = test_path();
        tag.source_tag = "192.168.1.11".into();
        assert!(a.is_fundamental_change(&tag));

        let mut volume = test_path();
        volume.volume = 0.9;
        assert!(!a.is_fundamental_change(&volume));
    }
}
