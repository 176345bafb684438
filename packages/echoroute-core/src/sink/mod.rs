//! Per-sink mixing and emission.
//!
//! One [`SinkAudioMixer`] per sink: it reads one 1152-byte block per tick
//! from every connected path queue (70 ms deadline each), sums them with
//! saturating arithmetic, downscales to the sink's bit depth, suppresses
//! all-silent packets, and emits through the configured transport. When a
//! reader subscribes to the MP3 feed, the mixed stream is also folded to
//! stereo and run through LAME.

pub mod mp3;
pub mod sender;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dsp::processor::{AudioProcessor, ProcessorSpec};
use crate::error::RouteResult;
use crate::protocol::StreamFormat;
use crate::protocol_constants::{
    CHUNK_SIZE, MIXER_INPUT_DEADLINE_MS, MP3_IDLE_TIMEOUT_MS, SHUTDOWN_JOIN_TIMEOUT_SECS,
};
use crate::state::{EqualizerSettings, SinkConfig};

pub use mp3::{Mp3Encoder, Mp3Feed};
pub use sender::{FrameSink, RtpSink, ScreamUdpSink, SenderMetrics, TcpSink};

/// Samples of full-width PCM per mixing block (one path output chunk).
const SAMPLES_PER_BLOCK: usize = CHUNK_SIZE / 4;

/// Control messages for a running mixer.
pub enum MixerCommand {
    /// Connects a path's output queue.
    Attach {
        instance_id: String,
        queue: mpsc::Receiver<Bytes>,
    },
    /// Disconnects a path.
    Detach { instance_id: String },
}

/// Lock-free mixer counters.
#[derive(Debug, Default)]
pub struct MixerMetrics {
    /// Mixing ticks that produced data.
    pub ticks: AtomicU64,
    pub packets_emitted: AtomicU64,
    /// Packets withheld by silence suppression.
    pub packets_suppressed: AtomicU64,
    /// Deadline misses that marked an input inactive.
    pub inputs_timed_out: AtomicU64,
    /// Blocks fed to the MP3 encoder.
    pub mp3_blocks: AtomicU64,
}

/// Point-in-time copy of [`MixerMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MixerMetricsSnapshot {
    pub ticks: u64,
    pub packets_emitted: u64,
    pub packets_suppressed: u64,
    pub inputs_timed_out: u64,
    pub mp3_blocks: u64,
}

impl MixerMetrics {
    fn snapshot(&self) -> MixerMetricsSnapshot {
        MixerMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            packets_emitted: self.packets_emitted.load(Ordering::Relaxed),
            packets_suppressed: self.packets_suppressed.load(Ordering::Relaxed),
            inputs_timed_out: self.inputs_timed_out.load(Ordering::Relaxed),
            mp3_blocks: self.mp3_blocks.load(Ordering::Relaxed),
        }
    }
}

/// One connected path queue and its activity flag.
struct InputSlot {
    instance_id: String,
    queue: mpsc::Receiver<Bytes>,
    /// Inactive inputs are polled without a deadline and contribute zeros.
    active: bool,
}

/// Handle to one running sink mixer.
pub struct SinkAudioMixer {
    sink_id: String,
    config: SinkConfig,
    command_tx: mpsc::UnboundedSender<MixerCommand>,
    mp3_feed: Arc<Mp3Feed>,
    metrics: Arc<MixerMetrics>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SinkAudioMixer {
    /// Validates the config, builds the egress socket, and starts the
    /// mixing task.
    pub fn start(sink_id: String, config: SinkConfig) -> RouteResult<Self> {
        config.validate()?;
        let dest = SocketAddr::new(config.output_ip, config.output_port);
        let format = config.stream_format();

        let sender: Box<dyn FrameSink> = if config.use_tcp {
            Box::new(TcpSink::new(dest))
        } else if config.use_rtp {
            Box::new(RtpSink::new(dest, format)?)
        } else {
            Box::new(ScreamUdpSink::new(dest, format)?)
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mp3_feed = Arc::new(Mp3Feed::new());
        let metrics = Arc::new(MixerMetrics::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(mixer_loop(
            sink_id.clone(),
            config.clone(),
            sender,
            Arc::clone(&mp3_feed),
            Arc::clone(&metrics),
            command_rx,
            shutdown.clone(),
        ));

        log::info!(
            "[SinkMixer] {sink_id} started: dest={dest}, format={format}, transport={}",
            if config.use_tcp {
                "tcp"
            } else if config.use_rtp {
                "rtp"
            } else {
                "udp"
            }
        );

        Ok(Self {
            sink_id,
            config,
            command_tx,
            mp3_feed,
            metrics,
            shutdown,
            task,
        })
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Connects a path's output queue to this mixer.
    pub fn attach_input(&self, instance_id: &str, queue: mpsc::Receiver<Bytes>) -> bool {
        self.command_tx
            .send(MixerCommand::Attach {
                instance_id: instance_id.to_string(),
                queue,
            })
            .is_ok()
    }

    /// Disconnects a path from this mixer.
    pub fn detach_input(&self, instance_id: &str) -> bool {
        self.command_tx
            .send(MixerCommand::Detach {
                instance_id: instance_id.to_string(),
            })
            .is_ok()
    }

    /// The externally readable MP3 byte queue.
    pub fn mp3_feed(&self) -> Arc<Mp3Feed> {
        Arc::clone(&self.mp3_feed)
    }

    pub fn metrics(&self) -> MixerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Two-phase stop: signal, then join with a bounded timeout.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_JOIN_TIMEOUT_SECS),
            self.task,
        )
        .await;
        log::info!("[SinkMixer] {} stopped", self.sink_id);
    }
}

/// Returns true when the five sampled positions of the payload are all
/// bit-exact zero for the full sample width.
fn payload_is_silent(payload: &[u8], bytes_per_sample: usize) -> bool {
    let samples = payload.len() / bytes_per_sample;
    if samples == 0 {
        return true;
    }
    // 0%, 25%, 50%, 75%, 100% across the payload.
    (0..=4).all(|quarter| {
        let index = (samples - 1) * quarter / 4;
        let offset = index * bytes_per_sample;
        payload[offset..offset + bytes_per_sample]
            .iter()
            .all(|&b| b == 0)
    })
}

/// Stable 32-bit id for the RTP CSRC list.
fn csrc_of(instance_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    instance_id.hash(&mut hasher);
    hasher.finish() as u32
}

/// MP3 side-stream state within the mixer task.
struct Mp3Side {
    enabled: bool,
    sample_rate: u32,
    bitrate_kbps: u32,
    input_format: StreamFormat,
    /// Stereo folddown + encoder, built on first demand.
    pipeline: Option<(AudioProcessor, Mp3Encoder)>,
    active: bool,
    idle_since: Option<Instant>,
    block_bytes: Vec<u8>,
}

impl Mp3Side {
    fn new(config: &SinkConfig) -> Self {
        // The mixed stream entering the side-chain is full-width 32-bit in
        // the sink's channel layout and rate.
        let mut input_format = config.stream_format();
        input_format.bit_depth = 32;
        Self {
            enabled: config.enable_mp3,
            sample_rate: config.sample_rate,
            bitrate_kbps: config.mp3_bitrate_kbps,
            input_format,
            pipeline: None,
            active: false,
            idle_since: None,
            block_bytes: vec![0u8; CHUNK_SIZE],
        }
    }

    fn ensure_pipeline(&mut self, sink_id: &str) -> bool {
        if self.pipeline.is_some() {
            return true;
        }
        let processor = AudioProcessor::new(ProcessorSpec {
            input_format: self.input_format,
            output_channels: 2,
            output_sample_rate: self.sample_rate,
            volume: 1.0,
            eq: EqualizerSettings::flat(),
            custom_layout: None,
            dither_seed: None,
            log_context: format!("{sink_id}/mp3"),
        });
        match Mp3Encoder::new(self.sample_rate, self.bitrate_kbps) {
            Ok(encoder) => {
                self.pipeline = Some((processor, encoder));
                true
            }
            Err(e) => {
                log::error!("[SinkMixer] {sink_id} MP3 encoder unavailable: {e}");
                self.enabled = false;
                false
            }
        }
    }

    /// Encodes one mixed block when a reader is subscribed; tracks and logs
    /// active/inactive transitions with a short grace period.
    fn on_block(
        &mut self,
        sink_id: &str,
        mixed: &[i32],
        feed: &Mp3Feed,
        metrics: &MixerMetrics,
    ) {
        if !self.enabled {
            return;
        }
        if feed.subscriber_count() == 0 {
            if self.active {
                let idle_for = self.idle_since.get_or_insert_with(Instant::now).elapsed();
                if idle_for >= Duration::from_millis(MP3_IDLE_TIMEOUT_MS) {
                    self.active = false;
                    self.idle_since = None;
                    if let Some((_, encoder)) = self.pipeline.as_mut() {
                        if let Ok(tail) = encoder.flush() {
                            feed.push(Bytes::from(tail));
                        }
                    }
                    log::info!("[SinkMixer] {sink_id} MP3 stream inactive");
                }
            }
            return;
        }

        self.idle_since = None;
        if !self.active {
            self.active = true;
            log::info!("[SinkMixer] {sink_id} MP3 stream active");
        }
        if !self.ensure_pipeline(sink_id) {
            return;
        }

        for (slot, &sample) in self.block_bytes.chunks_exact_mut(4).zip(mixed.iter()) {
            slot.copy_from_slice(&sample.to_le_bytes());
        }
        let Some((processor, encoder)) = self.pipeline.as_mut() else {
            return;
        };
        let stereo = processor.process(&self.block_bytes);
        let pcm: Vec<i16> = stereo.iter().map(|&s| (s >> 16) as i16).collect();
        match encoder.encode(&pcm) {
            Ok(data) => {
                metrics.mp3_blocks.fetch_add(1, Ordering::Relaxed);
                feed.push(Bytes::from(data));
            }
            Err(e) => log::warn!("[SinkMixer] {sink_id} MP3 encode: {e}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn mixer_loop(
    sink_id: String,
    config: SinkConfig,
    mut sender: Box<dyn FrameSink>,
    mp3_feed: Arc<Mp3Feed>,
    metrics: Arc<MixerMetrics>,
    mut command_rx: mpsc::UnboundedReceiver<MixerCommand>,
    shutdown: CancellationToken,
) {
    let bytes_per_sample = (config.bit_depth / 8) as usize;
    let deadline = Duration::from_millis(MIXER_INPUT_DEADLINE_MS);
    let mut inputs: Vec<InputSlot> = Vec::new();
    let mut emit_buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE * 2);
    let mut mixed = vec![0i32; SAMPLES_PER_BLOCK];
    let mut mp3 = Mp3Side::new(&config);

    'run: loop {
        // Apply any pending wiring changes.
        while let Ok(command) = command_rx.try_recv() {
            apply_command(&sink_id, &mut inputs, command);
        }
        if shutdown.is_cancelled() {
            break;
        }

        // With nothing connected, park until wiring changes.
        if inputs.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = command_rx.recv() => match command {
                    Some(command) => {
                        apply_command(&sink_id, &mut inputs, command);
                        continue;
                    }
                    None => break,
                },
            }
        }

        // One tick: read one block per input.
        mixed.fill(0);
        let mut any_data = false;
        let mut closed: Vec<usize> = Vec::new();

        for (index, slot) in inputs.iter_mut().enumerate() {
            let block = if slot.active {
                match tokio::time::timeout(deadline, slot.queue.recv()).await {
                    Ok(Some(block)) => Some(block),
                    Ok(None) => {
                        closed.push(index);
                        None
                    }
                    Err(_) => {
                        slot.active = false;
                        metrics.inputs_timed_out.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "[SinkMixer] {sink_id} input {} missed deadline, marked inactive",
                            slot.instance_id
                        );
                        None
                    }
                }
            } else {
                match slot.queue.try_recv() {
                    Ok(block) => {
                        slot.active = true;
                        Some(block)
                    }
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed.push(index);
                        None
                    }
                }
            };

            if let Some(block) = block {
                if block.len() == CHUNK_SIZE {
                    any_data = true;
                    for (slot_sample, bytes) in mixed.iter_mut().zip(block.chunks_exact(4)) {
                        let sample = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                        *slot_sample = slot_sample.saturating_add(sample);
                    }
                }
            }
        }

        for index in closed.into_iter().rev() {
            let slot = inputs.remove(index);
            log::info!(
                "[SinkMixer] {sink_id} input {} queue closed, detached",
                slot.instance_id
            );
        }

        if !any_data {
            // Everyone is inactive; poll gently instead of spinning.
            tokio::select! {
                _ = shutdown.cancelled() => break 'run,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            continue;
        }
        metrics.ticks.fetch_add(1, Ordering::Relaxed);

        mp3.on_block(&sink_id, &mixed, &mp3_feed, &metrics);

        // Downscale: keep the high `bit_depth` bytes of each little-endian
        // sample.
        for &sample in &mixed {
            let le = sample.to_le_bytes();
            emit_buf.extend_from_slice(&le[4 - bytes_per_sample..]);
        }

        while emit_buf.len() >= CHUNK_SIZE {
            let payload: Vec<u8> = emit_buf.drain(..CHUNK_SIZE).collect();
            if payload_is_silent(&payload, bytes_per_sample) {
                metrics.packets_suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let csrcs: Vec<u32> = inputs
                .iter()
                .filter(|slot| slot.active)
                .map(|slot| csrc_of(&slot.instance_id))
                .collect();
            if let Err(e) = sender.send_payload(&payload, &csrcs).await {
                log::warn!("[SinkMixer] {sink_id} emit failed: {e}");
            } else {
                metrics.packets_emitted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn apply_command(sink_id: &str, inputs: &mut Vec<InputSlot>, command: MixerCommand) {
    match command {
        MixerCommand::Attach { instance_id, queue } => {
            inputs.retain(|slot| slot.instance_id != instance_id);
            log::info!("[SinkMixer] {sink_id} attached input {instance_id}");
            // New inputs get a deadline read on their first tick; a path
            // that is not producing yet goes inactive after one miss.
            inputs.push(InputSlot {
                instance_id,
                queue,
                active: true,
            });
        }
        MixerCommand::Detach { instance_id } => {
            let before = inputs.len();
            inputs.retain(|slot| slot.instance_id != instance_id);
            if inputs.len() != before {
                log::info!("[SinkMixer] {sink_id} detached input {instance_id}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;

    fn block_of(value: i32) -> Bytes {
        let payload: Vec<u8> = (0..SAMPLES_PER_BLOCK)
            .flat_map(|_| value.to_le_bytes())
            .collect();
        Bytes::from(payload)
    }

    async fn udp_sink_fixture(enable_mp3: bool) -> (SinkAudioMixer, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let config = SinkConfig {
            output_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            output_port: port,
            enable_mp3,
            ..Default::default()
        };
        let mixer = SinkAudioMixer::start("sink1".into(), config).unwrap();
        (mixer, receiver)
    }

    async fn recv_datagram(receiver: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("datagram should arrive")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[test]
    fn silence_detection_samples_five_positions() {
        let silent = vec![0u8; CHUNK_SIZE];
        assert!(payload_is_silent(&silent, 2));

        // Non-zero exactly at the midpoint sample.
        let mut midpoint = vec![0u8; CHUNK_SIZE];
        let samples = CHUNK_SIZE / 2;
        midpoint[(samples - 1) / 2 * 2] = 1;
        assert!(!payload_is_silent(&midpoint, 2));

        // Five-point sampling does not see values between the positions.
        let mut off_grid = vec![0u8; CHUNK_SIZE];
        off_grid[2] = 1;
        assert!(payload_is_silent(&off_grid, 2));
    }

    #[tokio::test]
    async fn mixes_two_inputs_with_saturating_sum() {
        let (mixer, receiver) = udp_sink_fixture(false).await;
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        mixer.attach_input("a", rx_a);
        mixer.attach_input("b", rx_b);

        // 16-bit sink: two mixed blocks per 1157-byte packet.
        for _ in 0..4 {
            tx_a.send(block_of(1000 << 16)).await.unwrap();
            tx_b.send(block_of(500 << 16)).await.unwrap();
        }

        let datagram = recv_datagram(&receiver).await;
        assert_eq!(datagram.len(), 5 + CHUNK_SIZE);
        let sample = i16::from_le_bytes([datagram[5], datagram[6]]);
        assert_eq!(sample, 1500, "payload should carry the saturating sum");

        mixer.stop().await;
    }

    #[tokio::test]
    async fn saturation_clamps_instead_of_wrapping() {
        let (mixer, receiver) = udp_sink_fixture(false).await;
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        mixer.attach_input("a", rx_a);
        mixer.attach_input("b", rx_b);

        for _ in 0..4 {
            tx_a.send(block_of(i32::MAX)).await.unwrap();
            tx_b.send(block_of(1 << 16)).await.unwrap();
        }

        let datagram = recv_datagram(&receiver).await;
        let sample = i16::from_le_bytes([datagram[5], datagram[6]]);
        assert_eq!(sample, i16::MAX, "sum must clamp at INT32_MAX");

        mixer.stop().await;
    }

    #[tokio::test]
    async fn silent_payloads_are_not_emitted() {
        let (mixer, receiver) = udp_sink_fixture(false).await;
        let (tx, rx) = mpsc::channel(16);
        mixer.attach_input("a", rx);

        for _ in 0..4 {
            tx.send(block_of(0)).await.unwrap();
        }
        // No packet while input is all zeros.
        let mut buf = [0u8; 2048];
        let quiet =
            tokio::time::timeout(Duration::from_millis(300), receiver.recv_from(&mut buf)).await;
        assert!(quiet.is_err(), "silence must be suppressed");

        // First non-zero input produces a packet.
        for _ in 0..4 {
            tx.send(block_of(42 << 16)).await.unwrap();
        }
        let datagram = recv_datagram(&receiver).await;
        assert_eq!(datagram.len(), 5 + CHUNK_SIZE);
        assert!(mixer.metrics().packets_suppressed > 0);

        mixer.stop().await;
    }

    #[tokio::test]
    async fn slow_input_is_marked_inactive_and_contributes_zeros() {
        let (mixer, receiver) = udp_sink_fixture(false).await;
        let (tx_live, rx_live) = mpsc::channel(64);
        let (_tx_stalled, rx_stalled) = mpsc::channel::<Bytes>(64);
        mixer.attach_input("live", rx_live);
        mixer.attach_input("stalled", rx_stalled);

        // Keep the live input fed; the stalled one never sends.
        let feeder = tokio::spawn(async move {
            for _ in 0..100 {
                if tx_live.send(block_of(777 << 16)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        });

        // After the stalled input misses its first deadline, output follows
        // the live input alone.
        let mut last_sample = 0i16;
        for _ in 0..5 {
            let datagram = recv_datagram(&receiver).await;
            last_sample = i16::from_le_bytes([datagram[5], datagram[6]]);
        }
        assert_eq!(last_sample, 777);
        assert!(mixer.metrics().inputs_timed_out >= 1);

        feeder.abort();
        mixer.stop().await;
    }

    #[tokio::test]
    async fn detach_removes_the_input_from_the_mix() {
        let (mixer, receiver) = udp_sink_fixture(false).await;
        let (tx_a, rx_a) = mpsc::channel(64);
        let (tx_b, rx_b) = mpsc::channel(64);
        mixer.attach_input("a", rx_a);
        mixer.attach_input("b", rx_b);

        for _ in 0..4 {
            tx_a.send(block_of(100 << 16)).await.unwrap();
            tx_b.send(block_of(200 << 16)).await.unwrap();
        }
        let datagram = recv_datagram(&receiver).await;
        assert_eq!(i16::from_le_bytes([datagram[5], datagram[6]]), 300);

        mixer.detach_input("b");
        // Drain anything mixed before the detach landed, then expect the
        // remaining input alone.
        let mut sample = 0i16;
        for _ in 0..6 {
            for _ in 0..2 {
                let _ = tx_a.send(block_of(100 << 16)).await;
                let _ = tx_b.send(block_of(200 << 16)).await;
            }
            let datagram = recv_datagram(&receiver).await;
            sample = i16::from_le_bytes([datagram[5], datagram[6]]);
            if sample == 100 {
                break;
            }
        }
        assert_eq!(sample, 100, "detached input must stop contributing");

        mixer.stop().await;
    }

    #[tokio::test]
    async fn mp3_feed_produces_frames_only_with_a_subscriber() {
        let (mixer, _receiver) = udp_sink_fixture(true).await;
        let feed = mixer.mp3_feed();
        let (tx, rx) = mpsc::channel(64);
        mixer.attach_input("a", rx);

        // Without a subscriber nothing is encoded.
        for _ in 0..8 {
            tx.send(block_of(5000 << 16)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(feed.pull().is_none());

        feed.add_subscriber();
        let feeder = tokio::spawn(async move {
            for i in 0..2000u32 {
                let value =
                    ((f64::from(i) * 0.3).sin() * f64::from(1 << 24)) as i32;
                if tx.send(block_of(value)).await.is_err() {
                    break;
                }
            }
        });

        // LAME buffers about a frame's worth before emitting bytes.
        let mut encoded = Vec::new();
        for _ in 0..200 {
            if let Some(data) = feed.pull() {
                encoded.extend_from_slice(&data);
                if encoded.len() > 4 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!encoded.is_empty(), "subscriber should receive MP3 bytes");
        assert_eq!(encoded[0], 0xff, "MP3 frame sync expected");

        feeder.abort();
        mixer.stop().await;
    }
}
