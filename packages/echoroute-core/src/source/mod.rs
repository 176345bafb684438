//! Per-path source processing.
//!
//! One [`SourceInputProcessor`] exists per active path (source tag -> sink).
//! It filters tagged frames down to its configured source, buffers them in
//! the timeshift ring, drives the DSP kernel, and emits fixed 1152-byte
//! slices of 32-bit PCM in the target sink's format.
//!
//! Three cooperating tasks per instance:
//! - producer: input queue -> timeshift ring (signals the consumer)
//! - consumer: waits for due chunks, runs the kernel, pushes output
//! - control: applies typed parameter commands
//!
//! Parameter updates are only applied in `Running`; anything issued earlier
//! queues and drains when the first matching frame arrives.

pub mod timeshift;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dsp::processor::{AudioProcessor, ProcessorSpec};
use crate::error::RouteResult;
use crate::protocol::{SourceTag, StreamFormat, TaggedFrame};
use crate::protocol_constants::{
    CHUNK_SIZE, MAX_DELAY_MS, OUTPUT_QUEUE_PUSH_TIMEOUT_MS, RECEIVER_QUEUE_FRAMES,
    SHUTDOWN_JOIN_TIMEOUT_SECS, TIMESHIFT_WAIT_SECS,
};
use crate::state::{EqualizerSettings, SourceConfig, SpeakerLayoutMatrix};

pub use timeshift::TimeshiftBuffer;

/// Typed commands accepted on a path's control channel.
#[derive(Debug, Clone)]
pub enum SourceCommand {
    SetVolume(f32),
    SetDelay(u32),
    SetTimeshift(f32),
    SetEqualizer(EqualizerSettings),
    SetSpeakerLayouts(BTreeMap<u8, SpeakerLayoutMatrix>),
    /// Wires the processor's output to a sink queue. Applied in any state.
    AttachOutput(mpsc::Sender<Bytes>),
    /// Detaches the output queue. Applied in any state.
    DetachOutput,
}

/// Lifecycle of a path processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    /// No matching frame seen yet.
    Idle,
    /// Streaming; parameter updates apply immediately.
    Running,
    /// Transient: the input format changed and the kernel is being rebuilt.
    Reformatting,
    Stopping,
    Terminated,
}

/// Lock-free per-path counters.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    /// Frames that matched this path's tag.
    pub frames_received: AtomicU64,
    /// Frames ignored because the tag did not match.
    pub frames_filtered: AtomicU64,
    /// Chunks run through the DSP kernel.
    pub chunks_processed: AtomicU64,
    /// Output chunks dropped on sink backpressure.
    pub chunks_dropped: AtomicU64,
}

/// Point-in-time copy of [`SourceMetrics`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SourceMetricsSnapshot {
    pub frames_received: u64,
    pub frames_filtered: u64,
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
}

impl SourceMetrics {
    fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_filtered: self.frames_filtered.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Mutable path parameters, shared between the control and consumer tasks.
#[derive(Debug, Clone)]
struct PathParams {
    volume: f32,
    eq: EqualizerSettings,
    layouts: BTreeMap<u8, SpeakerLayoutMatrix>,
}

/// State shared by the three tasks.
struct PathShared {
    instance_id: String,
    source_tag: SourceTag,
    output_channels: u8,
    output_sample_rate: u32,
    dither_seed: Option<u64>,
    ring: Mutex<TimeshiftBuffer>,
    chunk_ready: Notify,
    state: Mutex<PathState>,
    /// Parameter commands issued outside `Running`, drained on entry.
    pending: Mutex<Vec<SourceCommand>>,
    params: Mutex<PathParams>,
    /// Kernel replacement is guarded here; nothing else may touch a kernel
    /// mid-rebuild.
    dsp: Mutex<Option<AudioProcessor>>,
    output: Mutex<Option<mpsc::Sender<Bytes>>>,
    metrics: SourceMetrics,
}

impl PathShared {
    fn state(&self) -> PathState {
        *self.state.lock()
    }

    fn set_state(&self, next: PathState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!(
                "[SourcePath] {} state {:?} -> {:?}",
                self.instance_id,
                *state,
                next
            );
            *state = next;
        }
    }

    /// Applies one parameter command immediately.
    fn apply_command(&self, command: SourceCommand) {
        match command {
            SourceCommand::SetVolume(volume) => {
                let volume = volume.clamp(0.0, 1.0);
                self.params.lock().volume = volume;
                if let Some(dsp) = self.dsp.lock().as_mut() {
                    dsp.set_volume(volume);
                }
            }
            SourceCommand::SetDelay(delay_ms) => {
                self.ring.lock().set_delay(delay_ms.min(MAX_DELAY_MS));
                self.chunk_ready.notify_one();
            }
            SourceCommand::SetTimeshift(backshift_sec) => {
                self.ring.lock().reposition(Instant::now(), backshift_sec);
                self.chunk_ready.notify_one();
            }
            SourceCommand::SetEqualizer(eq) => {
                self.params.lock().eq = eq.clone();
                if let Some(dsp) = self.dsp.lock().as_mut() {
                    dsp.set_equalizer(eq);
                }
            }
            SourceCommand::SetSpeakerLayouts(layouts) => {
                let mut dsp = self.dsp.lock();
                if let Some(dsp) = dsp.as_mut() {
                    let input_channels = dsp.input_format().channels;
                    dsp.set_mix_matrix(layouts.get(&input_channels));
                }
                self.params.lock().layouts = layouts;
            }
            SourceCommand::AttachOutput(sender) => {
                *self.output.lock() = Some(sender);
            }
            SourceCommand::DetachOutput => {
                *self.output.lock() = None;
            }
        }
    }

    /// Drains commands queued while the path was not `Running`.
    fn drain_pending(&self) {
        let pending: Vec<SourceCommand> = std::mem::take(&mut *self.pending.lock());
        for command in pending {
            self.apply_command(command);
        }
    }

    /// Rebuilds the kernel for a new input format, then processes the chunk.
    /// Returns the produced interleaved samples.
    fn process_chunk(&self, format: StreamFormat, payload: &[u8]) -> Vec<i32> {
        let mut dsp = self.dsp.lock();
        let needs_rebuild = dsp
            .as_ref()
            .map_or(true, |kernel| kernel.input_format() != format);
        if needs_rebuild {
            if let Some(previous) = dsp.as_ref() {
                log::info!(
                    "[SourcePath] {} input format changed: {} -> {}",
                    self.instance_id,
                    previous.input_format(),
                    format
                );
                self.set_state(PathState::Reformatting);
            }
            let params = self.params.lock().clone();
            *dsp = Some(AudioProcessor::new(ProcessorSpec {
                input_format: format,
                output_channels: self.output_channels,
                output_sample_rate: self.output_sample_rate,
                volume: params.volume,
                eq: params.eq,
                custom_layout: params.layouts.get(&format.channels).cloned(),
                dither_seed: self.dither_seed,
                log_context: self.instance_id.clone(),
            }));
            self.set_state(PathState::Running);
        }
        match dsp.as_mut() {
            Some(kernel) => {
                self.metrics.chunks_processed.fetch_add(1, Ordering::Relaxed);
                kernel.process(payload)
            }
            None => Vec::new(),
        }
    }
}

/// Handle to one running path processor.
pub struct SourceInputProcessor {
    shared: Arc<PathShared>,
    control_tx: mpsc::UnboundedSender<SourceCommand>,
    input_tx: mpsc::Sender<TaggedFrame>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SourceInputProcessor {
    /// Validates the configuration and spawns the three path tasks.
    ///
    /// `dither_seed` pins the kernel's RNG for reproducible output; pass
    /// `None` outside tests.
    pub fn start(
        instance_id: String,
        config: SourceConfig,
        dither_seed: Option<u64>,
    ) -> RouteResult<Self> {
        let config = config.clamped();
        let source_tag = SourceTag::new(&config.source_tag)?;

        let shared = Arc::new(PathShared {
            instance_id: instance_id.clone(),
            source_tag,
            output_channels: config.output_channels,
            output_sample_rate: config.output_sample_rate,
            dither_seed,
            ring: Mutex::new(TimeshiftBuffer::new(config.delay_ms, config.timeshift_sec)),
            chunk_ready: Notify::new(),
            state: Mutex::new(PathState::Idle),
            pending: Mutex::new(Vec::new()),
            params: Mutex::new(PathParams {
                volume: config.volume,
                eq: config.eq,
                layouts: BTreeMap::new(),
            }),
            dsp: Mutex::new(None),
            output: Mutex::new(None),
            metrics: SourceMetrics::default(),
        });

        let (input_tx, input_rx) = mpsc::channel(RECEIVER_QUEUE_FRAMES);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(producer_loop(
                Arc::clone(&shared),
                input_rx,
                shutdown.clone(),
            )),
            tokio::spawn(consumer_loop(Arc::clone(&shared), shutdown.clone())),
            tokio::spawn(control_loop(
                Arc::clone(&shared),
                control_rx,
                shutdown.clone(),
            )),
        ];

        log::info!(
            "[SourcePath] {instance_id} started: tag={}, out={}ch/{}Hz",
            shared.source_tag,
            shared.output_channels,
            shared.output_sample_rate
        );

        Ok(Self {
            shared,
            control_tx,
            input_tx,
            shutdown,
            tasks,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// The queue end receivers fan tagged frames into.
    pub fn input_sender(&self) -> mpsc::Sender<TaggedFrame> {
        self.input_tx.clone()
    }

    /// Enqueues a control command. Returns false once the processor has
    /// shut down.
    pub fn command(&self, command: SourceCommand) -> bool {
        self.control_tx.send(command).is_ok()
    }

    pub fn state(&self) -> PathState {
        self.shared.state()
    }

    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Two-phase stop: signal, then join each task with a bounded timeout.
    pub async fn stop(self) {
        self.shared.set_state(PathState::Stopping);
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_JOIN_TIMEOUT_SECS),
                task,
            )
            .await;
        }
        self.shared.set_state(PathState::Terminated);
        log::info!("[SourcePath] {} stopped", self.shared.instance_id);
    }
}

/// Moves matching frames from the input queue into the timeshift ring.
async fn producer_loop(
    shared: Arc<PathShared>,
    mut input_rx: mpsc::Receiver<TaggedFrame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = input_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if frame.tag != shared.source_tag {
            shared
                .metrics
                .frames_filtered
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }
        shared
            .metrics
            .frames_received
            .fetch_add(1, Ordering::Relaxed);

        if shared.state() == PathState::Idle {
            shared.set_state(PathState::Running);
            shared.drain_pending();
        }

        shared
            .ring
            .lock()
            .push(Instant::now(), frame.format, frame.payload);
        shared.chunk_ready.notify_one();
    }
}

/// Plays due chunks through the kernel and slices output to the sink queue.
async fn consumer_loop(shared: Arc<PathShared>, shutdown: CancellationToken) {
    let mut slice_buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE * 4);
    let mut last_drop_log: Option<Instant> = None;

    loop {
        // Sleep until the next chunk could be due, the producer signals, or
        // the 1-second recheck elapses.
        let wait = shared
            .ring
            .lock()
            .time_until_due(Instant::now())
            .unwrap_or(Duration::from_secs(TIMESHIFT_WAIT_SECS))
            .min(Duration::from_secs(TIMESHIFT_WAIT_SECS));
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::timeout(wait, shared.chunk_ready.notified()) => {}
        }

        loop {
            let due = shared.ring.lock().next_due(Instant::now());
            let Some((format, payload)) = due else { break };

            let samples = shared.process_chunk(format, &payload);
            for sample in samples {
                slice_buf.extend_from_slice(&sample.to_le_bytes());
            }

            while slice_buf.len() >= CHUNK_SIZE {
                let chunk = Bytes::copy_from_slice(&slice_buf[..CHUNK_SIZE]);
                slice_buf.drain(..CHUNK_SIZE);

                let sender = shared.output.lock().clone();
                let Some(sender) = sender else { continue };
                let pushed = sender
                    .send_timeout(
                        chunk,
                        Duration::from_millis(OUTPUT_QUEUE_PUSH_TIMEOUT_MS),
                    )
                    .await;
                if pushed.is_err() {
                    shared
                        .metrics
                        .chunks_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    let should_log = last_drop_log
                        .map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1));
                    if should_log {
                        log::warn!(
                            "[SourcePath] {} sink backpressure, dropping output chunks",
                            shared.instance_id
                        );
                        last_drop_log = Some(now);
                    }
                }
            }
        }
    }
}

/// Applies control commands, queueing parameter updates outside `Running`.
async fn control_loop(
    shared: Arc<PathShared>,
    mut control_rx: mpsc::UnboundedReceiver<SourceCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = control_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            SourceCommand::AttachOutput(_) | SourceCommand::DetachOutput => {
                shared.apply_command(command);
            }
            parameter_update => {
                let state = shared.state();
                if state == PathState::Running || state == PathState::Reformatting {
                    shared.apply_command(parameter_update);
                } else {
                    shared.pending.lock().push(parameter_update);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough_config(tag: &str) -> SourceConfig {
        SourceConfig {
            source_tag: tag.into(),
            volume: 1.0,
            eq: EqualizerSettings::flat(),
            delay_ms: 0,
            timeshift_sec: 0.0,
            output_channels: 2,
            output_sample_rate: 48000,
        }
    }

    fn frame_16bit(tag: &str, sample: i16) -> TaggedFrame {
        let payload: Vec<u8> = (0..CHUNK_SIZE / 2)
            .flat_map(|_| sample.to_le_bytes())
            .collect();
        TaggedFrame::new(
            SourceTag::new(tag).unwrap(),
            StreamFormat::STEREO_48K_16,
            Bytes::from(payload),
        )
        .unwrap()
    }

    async fn recv_chunk(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("output should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn matching_frames_flow_through_as_i32_chunks() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        processor.command(SourceCommand::AttachOutput(out_tx));

        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 1000))
            .await
            .unwrap();

        let chunk = recv_chunk(&mut out_rx).await;
        assert_eq!(chunk.len(), CHUNK_SIZE);
        // Identity path: each 16-bit input sample left-aligned into i32.
        let first = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        assert_eq!(first, 1000 << 16);
        assert_eq!(processor.state(), PathState::Running);

        processor.stop().await;
    }

    #[tokio::test]
    async fn non_matching_tags_are_filtered() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        processor.command(SourceCommand::AttachOutput(out_tx));

        processor
            .input_sender()
            .send(frame_16bit("10.0.0.99", 1000))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out_rx.try_recv().is_err(), "filtered frame produced output");
        assert_eq!(processor.metrics().frames_filtered, 1);
        assert_eq!(processor.state(), PathState::Idle);

        processor.stop().await;
    }

    #[tokio::test]
    async fn parameter_updates_queue_until_running() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        processor.command(SourceCommand::AttachOutput(out_tx));

        // Issued while Idle: must queue, then apply on the first frame.
        processor.command(SourceCommand::SetVolume(0.0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 12000))
            .await
            .unwrap();

        let chunk = recv_chunk(&mut out_rx).await;
        for bytes in chunk.chunks_exact(4) {
            let sample = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            // Volume zero leaves only dither-level output.
            assert!(sample.abs() <= 3 * 65536, "sample {sample} too loud");
        }

        processor.stop().await;
    }

    #[tokio::test]
    async fn header_change_rebuilds_the_kernel() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(16);
        processor.command(SourceCommand::AttachOutput(out_tx));

        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 500))
            .await
            .unwrap();
        let first = recv_chunk(&mut out_rx).await;
        assert_eq!(
            i32::from_le_bytes([first[0], first[1], first[2], first[3]]),
            500 << 16
        );

        // Same tag, new format: 32-bit samples.
        let mut format = StreamFormat::STEREO_48K_16;
        format.bit_depth = 32;
        let payload: Vec<u8> = (0..CHUNK_SIZE / 4)
            .flat_map(|_| (77i32 << 16).to_le_bytes())
            .collect();
        let frame = TaggedFrame::new(
            SourceTag::new("10.0.0.1").unwrap(),
            format,
            Bytes::from(payload),
        )
        .unwrap();
        processor.input_sender().send(frame).await.unwrap();

        let second = recv_chunk(&mut out_rx).await;
        assert_eq!(
            i32::from_le_bytes([second[0], second[1], second[2], second[3]]),
            77 << 16,
            "32-bit chunk should pass through the rebuilt kernel"
        );
        assert_eq!(processor.state(), PathState::Running);

        processor.stop().await;
    }

    #[tokio::test]
    async fn delay_postpones_playout() {
        let mut config = passthrough_config("10.0.0.1");
        config.delay_ms = 200;
        let processor = SourceInputProcessor::start("p1".into(), config, Some(7)).unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        processor.command(SourceCommand::AttachOutput(out_tx));

        let sent_at = Instant::now();
        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 100))
            .await
            .unwrap();

        let _ = recv_chunk(&mut out_rx).await;
        let elapsed = sent_at.elapsed();
        assert!(
            elapsed >= Duration::from_millis(190),
            "chunk released after {elapsed:?}, expected ~200ms"
        );

        processor.stop().await;
    }

    #[tokio::test]
    async fn detach_output_stops_emission_without_stopping_the_path() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        processor.command(SourceCommand::AttachOutput(out_tx));

        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 1))
            .await
            .unwrap();
        let _ = recv_chunk(&mut out_rx).await;

        processor.command(SourceCommand::DetachOutput);
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor
            .input_sender()
            .send(frame_16bit("10.0.0.1", 2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out_rx.try_recv().is_err());
        assert_eq!(processor.state(), PathState::Running);

        processor.stop().await;
    }

    #[tokio::test]
    async fn stop_terminates_all_tasks() {
        let processor =
            SourceInputProcessor::start("p1".into(), passthrough_config("10.0.0.1"), Some(7))
                .unwrap();
        let input = processor.input_sender();
        tokio::time::timeout(Duration::from_secs(3), processor.stop())
            .await
            .expect("stop should complete within the join timeout");
        // The input queue is gone once the producer exits.
        assert!(input.is_closed());
    }
}
