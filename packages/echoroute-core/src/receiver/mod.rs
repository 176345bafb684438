//! UDP ingress: Scream and RTP listeners.
//!
//! Each receiver owns one socket and one task. Datagrams are validated,
//! tagged with the sender's IP, and fanned out to every subscribed
//! source-path queue. Sources are reported once per unique tag on a
//! sideband channel so the host can surface them.

pub mod rtp;
pub mod scream;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::{SourceTag, TaggedFrame};
use crate::protocol_constants::OUTPUT_QUEUE_PUSH_TIMEOUT_MS;

pub use rtp::RtpReceiver;
pub use scream::ScreamReceiver;

/// Which listener first observed a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressKind {
    Scream,
    Rtp,
}

/// One entry on the discovered-sources sideband, emitted exactly once per
/// unique tag per receiver.
#[derive(Debug, Clone)]
pub struct DiscoveredSource {
    pub tag: SourceTag,
    pub kind: IngressKind,
}

/// Lock-free ingress counters, sampled by the host.
///
/// Counters replace data-path logging: the receive loop only ever
/// increments, and anything that wants visibility reads a snapshot.
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    /// Datagrams accepted and fanned out.
    pub packets_received: AtomicU64,
    /// Datagrams discarded for having the wrong length.
    pub packets_discarded: AtomicU64,
    /// Datagrams with an undecodable header or wrong payload type.
    pub packets_malformed: AtomicU64,
    /// Frames dropped because a subscriber queue stayed full past its grace.
    pub frames_dropped: AtomicU64,
}

/// Point-in-time copy of [`ReceiverMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReceiverMetricsSnapshot {
    pub packets_received: u64,
    pub packets_discarded: u64,
    pub packets_malformed: u64,
    pub frames_dropped: u64,
}

impl ReceiverMetrics {
    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared fan-out state behind both receivers.
///
/// Subscribers come and go while the receive loop runs; the loop snapshots
/// the sender list before awaiting so no lock is held across a send.
pub(crate) struct FanOut {
    kind: IngressKind,
    subscribers: RwLock<Vec<(String, mpsc::Sender<TaggedFrame>)>>,
    discovered_tx: mpsc::Sender<DiscoveredSource>,
    seen_tags: Mutex<HashSet<SourceTag>>,
    metrics: Arc<ReceiverMetrics>,
}

impl FanOut {
    pub(crate) fn new(kind: IngressKind, discovered_tx: mpsc::Sender<DiscoveredSource>) -> Self {
        Self {
            kind,
            subscribers: RwLock::new(Vec::new()),
            discovered_tx,
            seen_tags: Mutex::new(HashSet::new()),
            metrics: Arc::new(ReceiverMetrics::default()),
        }
    }

    pub(crate) fn metrics(&self) -> Arc<ReceiverMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Registers a subscriber queue under an id (the source instance id).
    pub(crate) fn subscribe(&self, id: &str, sender: mpsc::Sender<TaggedFrame>) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|(existing, _)| existing != id);
        subscribers.push((id.to_string(), sender));
    }

    /// Removes a subscriber queue.
    pub(crate) fn unsubscribe(&self, id: &str) {
        self.subscribers.write().retain(|(existing, _)| existing != id);
    }

    /// Reports a tag on the sideband the first time it is seen.
    fn note_source(&self, tag: &SourceTag) {
        let is_new = self.seen_tags.lock().insert(tag.clone());
        if is_new {
            log::info!("[Receiver] Discovered {:?} source: {}", self.kind, tag);
            // The sideband consumer is optional; a full channel only costs
            // the notification, not the audio.
            let _ = self.discovered_tx.try_send(DiscoveredSource {
                tag: tag.clone(),
                kind: self.kind,
            });
        }
    }

    /// Fans one frame out to every subscriber, waiting briefly on full
    /// queues before dropping.
    pub(crate) async fn dispatch(&self, frame: TaggedFrame) {
        self.note_source(&frame.tag);
        self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);

        let senders: Vec<mpsc::Sender<TaggedFrame>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, sender)| sender.clone())
            .collect();

        let grace = Duration::from_millis(OUTPUT_QUEUE_PUSH_TIMEOUT_MS);
        for sender in senders {
            if sender.send_timeout(frame.clone(), grace).await.is_err() {
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn count_discarded(&self) {
        self.metrics
            .packets_discarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_malformed(&self) {
        self.metrics
            .packets_malformed
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamFormat;
    use crate::protocol_constants::CHUNK_SIZE;
    use bytes::Bytes;

    fn test_frame(tag: &str) -> TaggedFrame {
        TaggedFrame::new(
            SourceTag::new(tag).unwrap(),
            StreamFormat::STEREO_48K_16,
            Bytes::from(vec![1u8; CHUNK_SIZE]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_reaches_all_subscribers() {
        let (discovered_tx, _discovered_rx) = mpsc::channel(8);
        let fanout = FanOut::new(IngressKind::Scream, discovered_tx);

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        fanout.subscribe("a", tx_a);
        fanout.subscribe("b", tx_b);

        fanout.dispatch(test_frame("10.0.0.1")).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(fanout.metrics().snapshot().packets_received, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (discovered_tx, _discovered_rx) = mpsc::channel(8);
        let fanout = FanOut::new(IngressKind::Scream, discovered_tx);

        let (tx, mut rx) = mpsc::channel(4);
        fanout.subscribe("a", tx);
        fanout.unsubscribe("a");

        fanout.dispatch(test_frame("10.0.0.1")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn source_is_discovered_exactly_once() {
        let (discovered_tx, mut discovered_rx) = mpsc::channel(8);
        let fanout = FanOut::new(IngressKind::Rtp, discovered_tx);

        for _ in 0..3 {
            fanout.dispatch(test_frame("192.168.1.50")).await;
        }
        fanout.dispatch(test_frame("192.168.1.51")).await;

        let first = discovered_rx.try_recv().unwrap();
        assert_eq!(first.tag.as_str(), "192.168.1.50");
        assert_eq!(first.kind, IngressKind::Rtp);
        let second = discovered_rx.try_recv().unwrap();
        assert_eq!(second.tag.as_str(), "192.168.1.51");
        assert!(discovered_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_subscriber_queue_counts_drops() {
        let (discovered_tx, _discovered_rx) = mpsc::channel(8);
        let fanout = FanOut::new(IngressKind::Scream, discovered_tx);

        let (tx, _rx) = mpsc::channel(1);
        fanout.subscribe("slow", tx);

        fanout.dispatch(test_frame("10.0.0.1")).await; // fills the queue
        fanout.dispatch(test_frame("10.0.0.1")).await; // times out, dropped

        assert_eq!(fanout.metrics().snapshot().frames_dropped, 1);
    }
}
