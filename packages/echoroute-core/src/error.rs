//! Centralized error types for the EchoRoute core library.
//!
//! The data plane never propagates an error past a single chunk's boundary:
//! a chunk that fails is zeroed and processing continues. These types cover
//! the control plane (component startup, configuration, manager operations)
//! and the socket boundaries.

use thiserror::Error;

/// Application-wide error type for the EchoRoute engine.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Recoverable socket condition (`EAGAIN`, short read, partial write).
    ///
    /// Handled locally with a rate-limited log; never tears a component down.
    #[error("transient I/O: {0}")]
    TransientIo(String),

    /// TCP peer closed or errored with something other than `EAGAIN`.
    ///
    /// Surfaces to the sink's connection state machine, which transitions
    /// to Backoff and drops packets until reconnect.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Datagram with the wrong length, a bad RTP payload type, or an
    /// undecodable Scream header. Dropped and counted.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Out-of-range or structurally invalid configuration. Values are
    /// clamped or defaulted where possible; logged once per offending path.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A component could not start (socket bind, encoder init).
    #[error("component startup failed: {0}")]
    ComponentStartup(String),

    /// Requested sink does not exist.
    #[error("sink not found: {0}")]
    SinkNotFound(String),

    /// Requested source-path instance does not exist.
    #[error("source instance not found: {0}")]
    SourceNotFound(String),

    /// The engine could not bind its listening ports. No partial engine is
    /// exposed when initialization fails.
    #[error("engine initialization failed: {0}")]
    Fatal(String),
}

impl RouteError {
    /// Returns a machine-readable error code for host-facing surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::PeerGone(_) => "peer_gone",
            Self::MalformedPacket(_) => "malformed_packet",
            Self::ConfigInvalid(_) => "config_invalid",
            Self::ComponentStartup(_) => "component_startup_failed",
            Self::SinkNotFound(_) => "sink_not_found",
            Self::SourceNotFound(_) => "source_not_found",
            Self::Fatal(_) => "initialization_failed",
        }
    }
}

impl From<std::io::Error> for RouteError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Self::TransientIo(err.to_string())
        } else {
            Self::PeerGone(err.to_string())
        }
    }
}

/// Convenient Result alias for engine-wide operations.
pub type RouteResult<T> = Result<T, RouteError>;
