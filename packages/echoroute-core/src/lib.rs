//! EchoRoute Core - shared library for the EchoRoute audio router.
//!
//! This crate provides the real-time data plane and control plane for
//! routing uncompressed PCM across a LAN: Scream/RTP ingress, per-path
//! DSP (volume, EQ, resampling, remix, delay, timeshift), per-sink mixing
//! with MP3 side-streams, and a reconciler that drives the running engine
//! from a declarative desired state.
//!
//! # Architecture
//!
//! - [`protocol`]: Scream/RTP wire formats and the typed internal frame
//! - [`dsp`]: the per-path DSP kernel and its building blocks
//! - [`receiver`]: UDP ingress listeners with source discovery
//! - [`source`]: per-path processing (timeshift ring, kernel, control)
//! - [`sink`]: per-sink mixing, silence suppression, egress, MP3
//! - [`manager`]: component ownership and imperative operations
//! - [`reconciler`]: desired-state diffing over the manager
//! - [`state`]: configuration and desired-state types
//! - [`error`]: centralized error types
//!
//! Data flows `receiver -> source paths -> sink mixers -> network`; control
//! flows `ConfigApplier::apply_state -> AudioManager -> components`.

#![warn(clippy::all)]

pub mod dsp;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod protocol_constants;
pub mod receiver;
pub mod reconciler;
pub mod sink;
pub mod source;
pub mod state;

// Re-export commonly used types at the crate root
pub use error::{RouteError, RouteResult};
pub use manager::AudioManager;
pub use protocol::{RtpHeader, SourceTag, StreamFormat, TaggedFrame};
pub use reconciler::{ConfigApplier, EngineOps};
pub use state::{
    AppliedSinkParams, AppliedSourcePathParams, DesiredEngineState, EngineConfig,
    EqualizerSettings, SinkConfig, SourceConfig, SpeakerLayoutMatrix,
};

// Re-export component types for hosts that embed pieces directly
pub use dsp::processor::{AudioProcessor, ProcessorSpec};
pub use receiver::{DiscoveredSource, IngressKind, RtpReceiver, ScreamReceiver};
pub use sink::{Mp3Feed, SinkAudioMixer};
pub use source::{PathState, SourceCommand, SourceInputProcessor};
