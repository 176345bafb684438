//! MP3 side-stream: LAME CBR encoding and the per-sink byte queue.
//!
//! The mixer encodes only while someone is subscribed to the feed; the
//! queue is an optional consumer, so overflow drops silently rather than
//! exerting backpressure on the audio path.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use mp3lame_encoder::{Builder, Encoder, FlushNoGap, InterleavedPcm};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{RouteError, RouteResult};
use crate::protocol_constants::MP3_QUEUE_BUFFERS;

/// Maps a requested kbps value onto LAME's CBR bitrate enum.
fn bitrate_for(kbps: u32) -> mp3lame_encoder::Bitrate {
    match kbps {
        0..=96 => mp3lame_encoder::Bitrate::Kbps96,
        97..=112 => mp3lame_encoder::Bitrate::Kbps112,
        113..=128 => mp3lame_encoder::Bitrate::Kbps128,
        129..=160 => mp3lame_encoder::Bitrate::Kbps160,
        161..=192 => mp3lame_encoder::Bitrate::Kbps192,
        193..=224 => mp3lame_encoder::Bitrate::Kbps224,
        225..=256 => mp3lame_encoder::Bitrate::Kbps256,
        _ => mp3lame_encoder::Bitrate::Kbps320,
    }
}

/// Stereo CBR LAME encoder at the sink's sample rate.
pub struct Mp3Encoder {
    encoder: Encoder,
    /// Encode scratch, sized for the worst case LAME documents.
    buffer: Vec<MaybeUninit<u8>>,
}

impl Mp3Encoder {
    pub fn new(sample_rate: u32, bitrate_kbps: u32) -> RouteResult<Self> {
        let mut builder = Builder::new()
            .ok_or_else(|| RouteError::ComponentStartup("LAME context allocation".into()))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| RouteError::ComponentStartup(format!("LAME sample rate: {e:?}")))?;
        builder
            .set_num_channels(2)
            .map_err(|e| RouteError::ComponentStartup(format!("LAME channels: {e:?}")))?;
        builder
            .set_brate(bitrate_for(bitrate_kbps))
            .map_err(|e| RouteError::ComponentStartup(format!("LAME bitrate: {e:?}")))?;
        builder
            .set_quality(mp3lame_encoder::Quality::Best)
            .map_err(|e| RouteError::ComponentStartup(format!("LAME quality: {e:?}")))?;
        let encoder = builder
            .build()
            .map_err(|e| RouteError::ComponentStartup(format!("LAME build: {e:?}")))?;
        Ok(Self {
            encoder,
            buffer: Vec::new(),
        })
    }

    /// Encodes one block of interleaved stereo `i16` samples, returning the
    /// compressed bytes (possibly empty while LAME fills its window).
    pub fn encode(&mut self, interleaved: &[i16]) -> RouteResult<Vec<u8>> {
        let frames = interleaved.len() / 2;
        // LAME's documented worst case per call.
        let worst_case = frames * 5 / 4 + 7200;
        if self.buffer.len() < worst_case {
            self.buffer.resize(worst_case, MaybeUninit::uninit());
        }

        let written = self
            .encoder
            .encode(InterleavedPcm(interleaved), &mut self.buffer)
            .map_err(|e| RouteError::TransientIo(format!("MP3 encode: {e:?}")))?;

        // The encoder initialized the first `written` bytes.
        Ok(self.buffer[..written]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect())
    }

    /// Flushes LAME's internal window, e.g. when the stream goes inactive.
    pub fn flush(&mut self) -> RouteResult<Vec<u8>> {
        if self.buffer.len() < 7200 {
            self.buffer.resize(7200, MaybeUninit::uninit());
        }
        let written = self
            .encoder
            .flush::<FlushNoGap>(&mut self.buffer)
            .map_err(|e| RouteError::TransientIo(format!("MP3 flush: {e:?}")))?;
        Ok(self.buffer[..written]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect())
    }
}

/// The externally readable MP3 byte queue for one sink.
///
/// Subscribers register with [`Mp3Feed::add_subscriber`]; the mixer checks
/// the count instead of probing writability, so "reader present" is explicit
/// rather than timing-derived.
pub struct Mp3Feed {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    subscribers: AtomicUsize,
}

impl Mp3Feed {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(MP3_QUEUE_BUFFERS);
        Self {
            tx,
            rx: Mutex::new(rx),
            subscribers: AtomicUsize::new(0),
        }
    }

    /// Registers a reader; encoding starts on the next mixer tick.
    pub fn add_subscriber(&self) {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
    }

    /// Unregisters a reader.
    pub fn remove_subscriber(&self) {
        let previous = self.subscribers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "subscriber count underflow");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Queues encoded bytes, dropping silently when the reader lags.
    pub fn push(&self, data: Bytes) {
        if !data.is_empty() {
            let _ = self.tx.try_send(data);
        }
    }

    /// Non-blocking pull of the next encoded buffer.
    pub fn pull(&self) -> Option<Bytes> {
        self.rx.lock().try_recv().ok()
    }
}

impl Default for Mp3Feed {
    fn default() -> Self {
        Self::new()
    }
}
