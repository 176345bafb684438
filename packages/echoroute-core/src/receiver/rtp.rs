//! RTP ingress listener.
//!
//! Accepts `12-byte RTP header + 1152-byte payload` datagrams carrying
//! payload type 127, strips the RTP header, and emits frames in the same
//! tagged shape as the Scream listener. RTP carries no PCM format of its
//! own, so a fixed 48 kHz / 16-bit / stereo header is synthesized.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RouteError, RouteResult};
use crate::protocol::{RtpHeader, SourceTag, StreamFormat, TaggedFrame};
use crate::protocol_constants::{RTP_HEADER_SIZE, RTP_PACKET_SIZE};
use crate::receiver::{DiscoveredSource, FanOut, IngressKind, ReceiverMetrics};

/// UDP listener for RTP payload-type-127 PCM.
pub struct RtpReceiver {
    fanout: Arc<FanOut>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RtpReceiver {
    /// Binds the ingress socket and starts the receive task.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Fatal`] when the port cannot be bound.
    pub async fn start(
        bind_addr: SocketAddr,
        discovered_tx: mpsc::Sender<DiscoveredSource>,
    ) -> RouteResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| RouteError::Fatal(format!("rtp bind {bind_addr}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RouteError::Fatal(e.to_string()))?;
        log::info!("[RtpReceiver] Listening on {local_addr}");

        let fanout = Arc::new(FanOut::new(IngressKind::Rtp, discovered_tx));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(socket, Arc::clone(&fanout), shutdown.clone()));

        Ok(Self {
            fanout,
            shutdown,
            local_addr,
            task,
        })
    }

    /// The bound ingress address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a subscriber queue under the given source instance id.
    pub fn subscribe(&self, id: &str, sender: mpsc::Sender<TaggedFrame>) {
        self.fanout.subscribe(id, sender);
    }

    /// Removes a subscriber queue.
    pub fn unsubscribe(&self, id: &str) {
        self.fanout.unsubscribe(id);
    }

    /// Ingress counters for this listener.
    pub fn metrics(&self) -> Arc<ReceiverMetrics> {
        self.fanout.metrics()
    }

    /// Signals the receive task and waits for it to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
        log::info!("[RtpReceiver] Stopped");
    }
}

async fn receive_loop(socket: UdpSocket, fanout: Arc<FanOut>, shutdown: CancellationToken) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("[RtpReceiver] recv error: {e}");
                    continue;
                }
            },
        };

        if len != RTP_PACKET_SIZE {
            fanout.count_discarded();
            continue;
        }

        match RtpHeader::parse(&buf[..len]) {
            Ok(header) if header.is_pcm() => {}
            _ => {
                fanout.count_malformed();
                continue;
            }
        }

        let tag = SourceTag::from(peer.ip());
        let payload = Bytes::copy_from_slice(&buf[RTP_HEADER_SIZE..RTP_PACKET_SIZE]);
        match TaggedFrame::new(tag, StreamFormat::STEREO_48K_16, payload) {
            Ok(frame) => fanout.dispatch(frame).await,
            Err(_) => fanout.count_malformed(),
        }
    }
}
