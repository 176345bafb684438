//! Scream wire format and the typed internal frame.
//!
//! A Scream datagram is a 5-byte format header followed by a 1152-byte PCM
//! payload. Internally the engine passes [`TaggedFrame`] values (typed source
//! tag + format + payload) through channels; the flat
//! `[45-byte tag][5-byte header][payload]` layout exists only at process
//! boundaries.

pub mod rtp;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{RouteError, RouteResult};
use crate::protocol_constants::{
    CHUNK_SIZE, MAX_CHANNELS, SCREAM_HEADER_SIZE, SUPPORTED_BIT_DEPTHS, TAG_LENGTH,
};

pub use rtp::RtpHeader;

/// Flag bit in the Scream rate byte selecting the 44.1 kHz base rate.
const RATE_BASE_44100_FLAG: u8 = 0x80;

/// PCM stream format as carried in the 5-byte Scream header.
///
/// The channel-mask bytes are WAVEFORMATEX bit fields carried verbatim;
/// they are never re-encoded so interop with Scream receivers in the wild
/// is preserved bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    pub chlayout1: u8,
    pub chlayout2: u8,
}

impl StreamFormat {
    /// 48 kHz / 16-bit / stereo with the standard FL|FR mask.
    ///
    /// This is the format synthesized for RTP ingress, which carries no
    /// format information of its own.
    pub const STEREO_48K_16: Self = Self {
        sample_rate: 48000,
        bit_depth: 16,
        channels: 2,
        chlayout1: 0x03,
        chlayout2: 0x00,
    };

    /// Decodes a 5-byte Scream header.
    ///
    /// The rate byte has the 44.1 kHz base flag in bit 7 and the rate
    /// multiplier in bits 0-6 (`rate = base * multiplier`). A zero
    /// multiplier, an unknown bit depth, or an out-of-range channel count
    /// is malformed.
    pub fn decode(header: &[u8; SCREAM_HEADER_SIZE]) -> RouteResult<Self> {
        let base: u32 = if header[0] & RATE_BASE_44100_FLAG != 0 {
            44100
        } else {
            48000
        };
        let multiplier = u32::from(header[0] & !RATE_BASE_44100_FLAG);
        if multiplier == 0 {
            return Err(RouteError::MalformedPacket(
                "scream rate byte has zero multiplier".into(),
            ));
        }

        let bit_depth = header[1];
        if !SUPPORTED_BIT_DEPTHS.contains(&bit_depth) {
            return Err(RouteError::MalformedPacket(format!(
                "unsupported bit depth {bit_depth}"
            )));
        }

        let channels = header[2];
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(RouteError::MalformedPacket(format!(
                "channel count {channels} out of range"
            )));
        }

        Ok(Self {
            sample_rate: base * multiplier,
            bit_depth,
            channels,
            chlayout1: header[3],
            chlayout2: header[4],
        })
    }

    /// Encodes the format into the 5-byte Scream header.
    ///
    /// The rate must be an exact multiple of 44100 or 48000 (validated at
    /// configuration time; see [`crate::state::SinkConfig::validate`]).
    pub fn encode(&self) -> [u8; SCREAM_HEADER_SIZE] {
        let rate_byte = if self.sample_rate % 44100 == 0 {
            RATE_BASE_44100_FLAG | (self.sample_rate / 44100) as u8
        } else {
            (self.sample_rate / 48000) as u8
        };
        [
            rate_byte,
            self.bit_depth,
            self.channels,
            self.chlayout1,
            self.chlayout2,
        ]
    }

    /// Returns bytes per sample (e.g., 2 for 16-bit audio).
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    /// Number of interleaved samples in one 1152-byte chunk.
    #[inline]
    pub const fn samples_per_chunk(&self) -> usize {
        CHUNK_SIZE / self.bytes_per_sample()
    }

    /// Number of frames (one sample per channel) in one 1152-byte chunk.
    #[inline]
    pub const fn frames_per_chunk(&self) -> usize {
        self.samples_per_chunk() / (self.channels as usize)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}bit/{}ch mask={:02x}{:02x}",
            self.sample_rate, self.bit_depth, self.channels, self.chlayout1, self.chlayout2
        )
    }
}

/// Logical identity of a source endpoint, typically its IPv4 dotted string.
///
/// Cheap to clone (shared `Arc<str>`); compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceTag(Arc<str>);

impl SourceTag {
    /// Creates a tag from a source identifier.
    ///
    /// The identifier must be non-empty ASCII and short enough to fit the
    /// 45-byte wire field with its terminator.
    pub fn new(tag: &str) -> RouteResult<Self> {
        if tag.is_empty() || tag.len() >= TAG_LENGTH || !tag.is_ascii() {
            return Err(RouteError::ConfigInvalid(format!(
                "source tag {tag:?} must be 1..{TAG_LENGTH} ASCII bytes"
            )));
        }
        Ok(Self(Arc::from(tag)))
    }

    /// Returns the tag as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Flattens the tag into the 45-byte wire field: the identifier,
    /// a NUL terminator, then space padding.
    pub fn to_wire(&self) -> [u8; TAG_LENGTH] {
        let mut field = [b' '; TAG_LENGTH];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field[self.0.len()] = 0;
        field
    }

    /// Parses the 45-byte wire field back into a tag.
    pub fn from_wire(field: &[u8; TAG_LENGTH]) -> RouteResult<Self> {
        let end = field
            .iter()
            .position(|&b| b == 0 || b == b' ')
            .unwrap_or(TAG_LENGTH);
        let tag = std::str::from_utf8(&field[..end])
            .map_err(|_| RouteError::MalformedPacket("source tag is not ASCII".into()))?;
        Self::new(tag)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<std::net::IpAddr> for SourceTag {
    fn from(ip: std::net::IpAddr) -> Self {
        // A dotted IP string always fits the wire field.
        Self(Arc::from(ip.to_string().as_str()))
    }
}

/// One tagged PCM chunk flowing from a receiver to source-path processors.
///
/// The payload is shared (`Bytes`), so fanning a frame out to N subscriber
/// queues clones a pointer, not 1152 bytes.
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    pub tag: SourceTag,
    pub format: StreamFormat,
    pub payload: Bytes,
}

impl TaggedFrame {
    /// Creates a tagged frame; the payload must be exactly one chunk.
    pub fn new(tag: SourceTag, format: StreamFormat, payload: Bytes) -> RouteResult<Self> {
        if payload.len() != CHUNK_SIZE {
            return Err(RouteError::MalformedPacket(format!(
                "payload is {} bytes, expected {CHUNK_SIZE}",
                payload.len()
            )));
        }
        Ok(Self {
            tag,
            format,
            payload,
        })
    }

    /// Flattens to the boundary layout `[tag 45][header 5][payload 1152]`.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TAG_LENGTH + SCREAM_HEADER_SIZE + CHUNK_SIZE);
        buf.extend_from_slice(&self.tag.to_wire());
        buf.extend_from_slice(&self.format.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses the boundary layout back into a typed frame.
    pub fn from_wire(data: &[u8]) -> RouteResult<Self> {
        if data.len() != TAG_LENGTH + SCREAM_HEADER_SIZE + CHUNK_SIZE {
            return Err(RouteError::MalformedPacket(format!(
                "tagged frame is {} bytes",
                data.len()
            )));
        }
        let tag_field: &[u8; TAG_LENGTH] = data[..TAG_LENGTH].try_into().expect("sliced to length");
        let header: &[u8; SCREAM_HEADER_SIZE] = data[TAG_LENGTH..TAG_LENGTH + SCREAM_HEADER_SIZE]
            .try_into()
            .expect("sliced to length");
        Ok(Self {
            tag: SourceTag::from_wire(tag_field)?,
            format: StreamFormat::decode(header)?,
            payload: Bytes::copy_from_slice(&data[TAG_LENGTH + SCREAM_HEADER_SIZE..]),
        })
    }
}
