//! Scream ingress listener.
//!
//! One UDP socket, one task. Accepts only exact 1157-byte datagrams
//! (5-byte format header + 1152-byte payload), tags them with the sender's
//! IP, and fans them out. Anything else is discarded and counted.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RouteError, RouteResult};
use crate::protocol::{SourceTag, StreamFormat, TaggedFrame};
use crate::protocol_constants::{SCREAM_HEADER_SIZE, SCREAM_PACKET_SIZE};
use crate::receiver::{DiscoveredSource, FanOut, IngressKind, ReceiverMetrics};

use tokio::sync::mpsc;

/// UDP listener for Scream packets.
pub struct ScreamReceiver {
    fanout: Arc<FanOut>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ScreamReceiver {
    /// Binds the ingress socket and starts the receive task.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Fatal`] when the port cannot be bound; the
    /// engine must not come up partially.
    pub async fn start(
        bind_addr: SocketAddr,
        discovered_tx: mpsc::Sender<DiscoveredSource>,
    ) -> RouteResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| RouteError::Fatal(format!("scream bind {bind_addr}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RouteError::Fatal(e.to_string()))?;
        log::info!("[ScreamReceiver] Listening on {local_addr}");

        let fanout = Arc::new(FanOut::new(IngressKind::Scream, discovered_tx));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(socket, Arc::clone(&fanout), shutdown.clone()));

        Ok(Self {
            fanout,
            shutdown,
            local_addr,
            task,
        })
    }

    /// The bound ingress address (useful when binding port 0).
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
        log::info!("[ScreamReceiver] Stopped");
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
                    log::warn!("[ScreamReceiver] recv error: {e}");
                    continue;
                }
            },
        };

        if len != SCREAM_PACKET_SIZE {
            fanout.count_discarded();
            continue;
        }

        let header: &[u8; SCREAM_HEADER_SIZE] = buf[..SCREAM_HEADER_SIZE]
            .try_into()
            .expect("sliced to length");
        let format = match StreamFormat::decode(header) {
            Ok(format) => format,
            Err(_) => {
                fanout.count_malformed();
                continue;
            }
        };

        let tag = SourceTag::from(peer.ip());
        let payload = Bytes::copy_from_slice(&buf[SCREAM_HEADER_SIZE..SCREAM_PACKET_SIZE]);
        match TaggedFrame::new(tag, format, payload) {
            Ok(frame) => fanout.dispatch(frame).await,
            Err(_) => fanout.count_malformed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    async fn start_receiver() -> (ScreamReceiver, mpsc::Receiver<DiscoveredSource>) {
        let (discovered_tx, discovered_rx) = mpsc::channel(8);
        let bind: SocketAddr = (IpAddr::V4(Ipv4Addr::LOCALHOST), 0).into();
        let receiver = ScreamReceiver::start(bind, discovered_tx).await.unwrap();
        (receiver, discovered_rx)
    }

    fn scream_packet(payload_byte: u8) -> Vec<u8> {
        let mut packet = vec![0x01, 16, 2, 0x03, 0x00];
        packet.extend_from_slice(&[payload_byte; 1152]);
        packet
    }

    #[tokio::test]
    async fn valid_packet_is_tagged_and_fanned_out() {
        let (receiver, mut discovered_rx) = start_receiver().await;
        let (tx, mut rx) = mpsc::channel(8);
        receiver.subscribe("p1", tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&scream_packet(0x42), receiver.local_addr())
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame should arrive")
            .unwrap();
        assert_eq!(frame.tag.as_str(), "127.0.0.1");
        assert_eq!(frame.format, StreamFormat::STEREO_48K_16);
        assert!(frame.payload.iter().all(|&b| b == 0x42));

        let discovered = tokio::time::timeout(Duration::from_secs(2), discovered_rx.recv())
            .await
            .expect("discovery should fire")
            .unwrap();
        assert_eq!(discovered.kind, IngressKind::Scream);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn wrong_size_datagram_is_discarded() {
        let (receiver, _discovered_rx) = start_receiver().await;
        let (tx, mut rx) = mpsc::channel(8);
        receiver.subscribe("p1", tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&[0u8; 100], receiver.local_addr())
            .await
            .unwrap();
        sender
            .send_to(&scream_packet(1), receiver.local_addr())
            .await
            .unwrap();

        // The valid packet still arrives; the short one was silently dropped.
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload[0], 1);
        assert_eq!(receiver.metrics().snapshot().packets_discarded, 1);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn bad_header_counts_as_malformed() {
        let (receiver, _discovered_rx) = start_receiver().await;
        let (tx, mut rx) = mpsc::channel(8);
        receiver.subscribe("p1", tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = scream_packet(1);
        packet[0] = 0x00; // zero multiplier
        sender.send_to(&packet, receiver.local_addr()).await.unwrap();
        sender
            .send_to(&scream_packet(2), receiver.local_addr())
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload[0], 2);
        assert_eq!(receiver.metrics().snapshot().packets_malformed, 1);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn stop_joins_the_receive_task() {
        let (receiver, _discovered_rx) = start_receiver().await;
        tokio::time::timeout(Duration::from_secs(2), receiver.stop())
            .await
            .expect("stop should not hang");
    }
}
