//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (Scream, RTP, audio
//! standards) and changing them would break wire compatibility with senders
//! and receivers in the wild.

// ─────────────────────────────────────────────────────────────────────────────
// Scream Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// PCM payload size of a canonical frame (bytes).
///
/// Every Scream packet, every internal queue slot, and every TCP write
/// carries exactly this many payload bytes.
pub const CHUNK_SIZE: usize = 1152;

/// Scream format header size (bytes).
///
/// Byte 0: sample-rate code, byte 1: bit depth, byte 2: channel count,
/// bytes 3-4: WAVEFORMATEX channel mask.
pub const SCREAM_HEADER_SIZE: usize = 5;

/// Total size of a Scream UDP datagram (header + payload).
pub const SCREAM_PACKET_SIZE: usize = SCREAM_HEADER_SIZE + CHUNK_SIZE;

/// Length of the ASCII source tag prefixed to internal frames at process
/// boundaries (space-padded, null-terminated source identifier).
pub const TAG_LENGTH: usize = 45;

/// Default UDP port for Scream ingress.
pub const DEFAULT_SCREAM_PORT: u16 = 16401;

// ─────────────────────────────────────────────────────────────────────────────
// RTP Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed RTP header size without CSRC entries (bytes).
pub const RTP_HEADER_SIZE: usize = 12;

/// Total size of an RTP ingress datagram (header + payload).
pub const RTP_PACKET_SIZE: usize = RTP_HEADER_SIZE + CHUNK_SIZE;

/// The only RTP payload type accepted on ingress and stamped on egress.
pub const RTP_PAYLOAD_TYPE: u8 = 127;

/// Default UDP port for RTP ingress.
pub const DEFAULT_RTP_PORT: u16 = 40000;

// ─────────────────────────────────────────────────────────────────────────────
// Audio Standards
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rates a sink may be configured with (Hz).
///
/// Every member is expressible in the Scream rate byte as
/// `base (44100 | 48000) x multiplier`.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [44100, 48000, 88200, 96000, 192000];

/// Bit depths a sink may be configured with.
pub const SUPPORTED_BIT_DEPTHS: [u8; 3] = [16, 24, 32];

/// Maximum number of audio channels per stream.
pub const MAX_CHANNELS: u8 = 8;

/// Number of equalizer bands per source path.
pub const EQ_BANDS: usize = 18;

/// ISO center frequencies of the 18 equalizer bands (Hz).
pub const EQ_CENTER_FREQUENCIES: [f64; EQ_BANDS] = [
    65.4, 92.5, 130.8, 185.0, 261.6, 370.0, 523.3, 740.0, 1046.5, 1480.0, 2093.0, 2960.0, 4186.0,
    5920.0, 8372.0, 11839.8, 16744.0, 20000.0,
];

/// Oversampling factor applied inside the DSP kernel.
///
/// All EQ and DC-removal filters are designed at `output_rate * 2`.
pub const OVERSAMPLING_FACTOR: u32 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Timing and Buffering
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum per-path delay (milliseconds).
pub const MAX_DELAY_MS: u32 = 5000;

/// Timeshift buffer retention window (seconds).
///
/// The per-path arrival ring keeps `[now - 5 min, now]`; entries age out of
/// the window only when the user has not repositioned the cursor within the
/// same window.
pub const TIMESHIFT_RETENTION_SECS: u64 = 300;

/// Maximum wait on the timeshift condition before rechecking (seconds).
pub const TIMESHIFT_WAIT_SECS: u64 = 1;

/// Deadline for one mixer read from an active input queue (milliseconds).
///
/// An input that misses the deadline is marked inactive and contributes
/// zeros for that tick.
pub const MIXER_INPUT_DEADLINE_MS: u64 = 70;

/// How long a source processor waits on a full output queue before dropping
/// the chunk (milliseconds).
pub const OUTPUT_QUEUE_PUSH_TIMEOUT_MS: u64 = 10;

/// Bounded capacity of receiver -> source-path queues (tagged frames).
pub const RECEIVER_QUEUE_FRAMES: usize = 64;

/// Bounded capacity of source-path -> sink queues (1152-byte chunks).
pub const PATH_OUTPUT_QUEUE_CHUNKS: usize = 32;

/// Bounded capacity of the per-sink MP3 byte queue (encoded buffers).
pub const MP3_QUEUE_BUFFERS: usize = 128;

/// TCP connect timeout for sinks (seconds).
pub const TCP_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Cool-down before a TCP sink in Backoff attempts to reconnect (seconds).
pub const TCP_BACKOFF_SECS: u64 = 5;

/// Without an MP3 subscriber for this long the side-stream is considered
/// inactive (milliseconds).
pub const MP3_IDLE_TIMEOUT_MS: u64 = 15;

/// Bounded join timeout applied to each component during shutdown (seconds).
pub const SHUTDOWN_JOIN_TIMEOUT_SECS: u64 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Egress Socket Tuning
// ─────────────────────────────────────────────────────────────────────────────

/// DSCP Expedited Forwarding, shifted into the TOS byte.
pub const TOS_DSCP_EF: u32 = 46 << 2;

/// Linux `SO_PRIORITY` applied to egress sockets (best-effort).
pub const EGRESS_SO_PRIORITY: u32 = 6;

/// Send buffer size for TCP sinks (bytes): sixteen payloads of headroom.
pub const TCP_SEND_BUFFER_BYTES: usize = 16 * CHUNK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_sizes_are_consistent() {
        assert_eq!(SCREAM_PACKET_SIZE, 1157);
        assert_eq!(RTP_PACKET_SIZE, 1164);
        assert_eq!(TCP_SEND_BUFFER_BYTES, 18432);
    }

    #[test]
    fn eq_band_table_is_complete() {
        assert_eq!(EQ_CENTER_FREQUENCIES.len(), EQ_BANDS);
        // Bands ascend; the table is a fixed ISO ladder.
        for pair in EQ_CENTER_FREQUENCIES.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
