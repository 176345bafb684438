//! Egress senders: Scream-over-UDP, payload-over-TCP, and RTP.
//!
//! All variants implement [`FrameSink`], so the mixer is agnostic to the
//! transport and tests can capture emissions in memory. Egress sockets are
//! built through `socket2` so DSCP and queueing priority are applied before
//! the first packet leaves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{RouteError, RouteResult};
use crate::protocol::rtp::build_header;
use crate::protocol::StreamFormat;
use crate::protocol_constants::{
    EGRESS_SO_PRIORITY, SCREAM_HEADER_SIZE, TCP_BACKOFF_SECS, TCP_CONNECT_TIMEOUT_SECS,
    TCP_SEND_BUFFER_BYTES, TOS_DSCP_EF,
};

/// A transport the mixer can emit payloads through.
///
/// `csrcs` carries the contributing-source identifiers; only the RTP
/// variant uses them.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]) -> RouteResult<()>;
}

/// Lock-free egress counters.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub packets_sent: AtomicU64,
    /// Packets dropped without a send attempt (Backoff, EAGAIN).
    pub packets_dropped: AtomicU64,
    pub send_errors: AtomicU64,
}

/// Point-in-time copy of [`SenderMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SenderMetricsSnapshot {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub send_errors: u64,
}

impl SenderMetrics {
    pub fn snapshot(&self) -> SenderMetricsSnapshot {
        SenderMetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Applies Linux `SO_PRIORITY`; best-effort everywhere else.
#[cfg(target_os = "linux")]
fn set_so_priority(socket: &Socket) {
    use std::os::fd::AsRawFd;
    let priority: libc::c_int = EGRESS_SO_PRIORITY as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            std::ptr::addr_of!(priority).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::debug!(
            "[Sender] SO_PRIORITY not applied: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_so_priority(_socket: &Socket) {}

/// Builds a non-blocking UDP egress socket with DSCP EF and QoS priority.
fn egress_udp_socket() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_tos_v4(TOS_DSCP_EF) {
        log::debug!("[Sender] DSCP not applied: {e}");
    }
    set_so_priority(&socket);
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    Ok(socket.into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Scream UDP
// ─────────────────────────────────────────────────────────────────────────────

/// Scream egress: 5-byte format header prepended to every payload.
pub struct ScreamUdpSink {
    socket: UdpSocket,
    dest: SocketAddr,
    header: [u8; SCREAM_HEADER_SIZE],
    packet: Vec<u8>,
    metrics: Arc<SenderMetrics>,
    last_error_log: Option<Instant>,
}

impl ScreamUdpSink {
    pub fn new(dest: SocketAddr, format: StreamFormat) -> RouteResult<Self> {
        let socket = egress_udp_socket()
            .and_then(UdpSocket::from_std)
            .map_err(|e| RouteError::ComponentStartup(format!("udp egress socket: {e}")))?;
        Ok(Self {
            socket,
            dest,
            header: format.encode(),
            packet: Vec::new(),
            metrics: Arc::new(SenderMetrics::default()),
            last_error_log: None,
        })
    }

    pub fn metrics(&self) -> Arc<SenderMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl FrameSink for ScreamUdpSink {
    async fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) -> RouteResult<()> {
        self.packet.clear();
        self.packet.extend_from_slice(&self.header);
        self.packet.extend_from_slice(payload);

        match self.socket.send_to(&self.packet, self.dest).await {
            Ok(sent) if sent == self.packet.len() => {
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(sent) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                let message = format!("partial UDP write: {sent}/{} bytes", self.packet.len());
                self.log_rate_limited(&message);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                let message = format!("UDP send to {}: {e}", self.dest);
                self.log_rate_limited(&message);
                Ok(())
            }
        }
    }
}

impl ScreamUdpSink {
    fn log_rate_limited(&mut self, message: &str) {
        let now = Instant::now();
        let should_log = self
            .last_error_log
            .map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1));
        if should_log {
            log::warn!("[Sender] {message}");
            self.last_error_log = Some(now);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TCP
// ─────────────────────────────────────────────────────────────────────────────

/// TCP connection state machine.
///
/// `Disconnected -> Connected` on the first successful send; any
/// non-would-block error moves to `Backoff`, during which packets drop
/// silently (TCP was explicitly configured, so there is no UDP fallback).
#[derive(Debug)]
enum TcpState {
    Disconnected,
    Connected,
    Backoff { until: Instant },
}

/// Payload-only TCP egress (no Scream header).
pub struct TcpSink {
    dest: SocketAddr,
    state: TcpState,
    stream: Option<TcpStream>,
    metrics: Arc<SenderMetrics>,
}

impl TcpSink {
    /// Creates the sink; the connection is established lazily on first send.
    pub fn new(dest: SocketAddr) -> Self {
        Self {
            dest,
            state: TcpState::Disconnected,
            stream: None,
            metrics: Arc::new(SenderMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<SenderMetrics> {
        Arc::clone(&self.metrics)
    }

    /// True while the peer is connected.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, TcpState::Connected)
    }

    async fn connect(&mut self) -> RouteResult<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| RouteError::ComponentStartup(e.to_string()))?;
        socket
            .set_send_buffer_size(TCP_SEND_BUFFER_BYTES)
            .map_err(|e| RouteError::ComponentStartup(e.to_string()))?;
        if let Err(e) = socket.set_tos_v4(TOS_DSCP_EF) {
            log::debug!("[Sender] DSCP not applied: {e}");
        }
        set_so_priority(&socket);
        socket
            .set_nonblocking(true)
            .map_err(|e| RouteError::ComponentStartup(e.to_string()))?;

        // Non-blocking connect: kick it off on the raw socket, then let the
        // reactor report writability.
        let dest = self.dest;
        let connect = async move {
            match socket.connect(&dest.into()) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc_einprogress())
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            let stream = TcpStream::from_std(socket.into())?;
            stream.writable().await?;
            if let Some(e) = stream.take_error()? {
                return Err(e);
            }
            stream.set_nodelay(true)?;
            Ok(stream)
        };

        let stream = tokio::time::timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            connect,
        )
        .await
        .map_err(|_| RouteError::PeerGone(format!("connect {} timed out", self.dest)))?
        .map_err(|e| RouteError::PeerGone(format!("connect {}: {e}", self.dest)))?;

        log::info!("[Sender] TCP connected to {}", self.dest);
        self.stream = Some(stream);
        Ok(())
    }

    fn enter_backoff(&mut self, reason: &str) {
        log::warn!(
            "[Sender] TCP to {} entering backoff: {reason}",
            self.dest
        );
        self.stream = None;
        self.state = TcpState::Backoff {
            until: Instant::now() + Duration::from_secs(TCP_BACKOFF_SECS),
        };
    }
}

/// `EINPROGRESS` for the platform.
fn libc_einprogress() -> i32 {
    #[cfg(unix)]
    {
        libc::EINPROGRESS
    }
    #[cfg(not(unix))]
    {
        10036 // WSAEINPROGRESS
    }
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send_payload(&mut self, payload: &[u8], _csrcs: &[u32]) -> RouteResult<()> {
        // Backoff: drop silently until the cool-down elapses.
        if let TcpState::Backoff { until } = self.state {
            if Instant::now() < until {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            self.state = TcpState::Disconnected;
        }

        if self.stream.is_none() {
            if let Err(e) = self.connect().await {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                self.enter_backoff(&e.to_string());
                return Ok(());
            }
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        match stream.try_write(payload) {
            Ok(written) if written == payload.len() => {
                if !matches!(self.state, TcpState::Connected) {
                    self.state = TcpState::Connected;
                }
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(written) => {
                // Short write: the remainder of this payload is lost, the
                // connection stays up.
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[Sender] short TCP write to {}: {written}/{}",
                    self.dest,
                    payload.len()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                self.enter_backoff(&e.to_string());
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RTP
// ─────────────────────────────────────────────────────────────────────────────

/// RTP egress: 12-byte header with advancing sequence number and a
/// timestamp derived from the emitted sample count.
pub struct RtpSink {
    socket: UdpSocket,
    dest: SocketAddr,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    /// Frames per 1152-byte payload in the sink's format.
    frames_per_payload: u32,
    packet: Vec<u8>,
    metrics: Arc<SenderMetrics>,
}

impl RtpSink {
    pub fn new(dest: SocketAddr, format: StreamFormat) -> RouteResult<Self> {
        let socket = egress_udp_socket()
            .and_then(UdpSocket::from_std)
            .map_err(|e| RouteError::ComponentStartup(format!("rtp egress socket: {e}")))?;
        Ok(Self {
            socket,
            dest,
            sequence: 0,
            timestamp: 0,
            ssrc: rand::random(),
            frames_per_payload: format.frames_per_chunk() as u32,
            packet: Vec::new(),
            metrics: Arc::new(SenderMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<SenderMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl FrameSink for RtpSink {
    async fn send_payload(&mut self, payload: &[u8], csrcs: &[u32]) -> RouteResult<()> {
        self.packet.clear();
        self.packet
            .extend_from_slice(&build_header(self.sequence, self.timestamp, self.ssrc, csrcs));
        self.packet.extend_from_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.frames_per_payload);

        match self.socket.send_to(&self.packet, self.dest).await {
            Ok(_) => {
                self.metrics.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Sender] RTP send to {}: {e}", self.dest);
                Ok(())
            }
        }
    }
}
