//! Component ownership and imperative engine operations.
//!
//! [`AudioManager`] owns the two ingress receivers, every source-path
//! processor, and every sink mixer, and wires queues between them. The
//! reconciler drives it exclusively through the imperative operations
//! here; nothing else creates or destroys components.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RouteError, RouteResult};
use crate::protocol_constants::PATH_OUTPUT_QUEUE_CHUNKS;
use crate::receiver::{DiscoveredSource, RtpReceiver, ScreamReceiver};
use crate::sink::SinkAudioMixer;
use crate::source::{SourceCommand, SourceInputProcessor};
use crate::state::{EngineConfig, EqualizerSettings, SinkConfig, SourceConfig};
use crate::state::SpeakerLayoutMatrix;

/// Capacity of the discovered-sources sideband.
const DISCOVERED_CHANNEL_CAPACITY: usize = 64;

/// Owns and names all active engine components.
pub struct AudioManager {
    receivers: Mutex<Option<(ScreamReceiver, RtpReceiver)>>,
    scream_addr: SocketAddr,
    rtp_addr: SocketAddr,
    sources: DashMap<String, SourceInputProcessor>,
    sinks: DashMap<String, SinkAudioMixer>,
    /// sink_id -> instance ids currently feeding it.
    connections: Mutex<HashMap<String, HashSet<String>>>,
    discovered_rx: Mutex<mpsc::Receiver<DiscoveredSource>>,
}

impl AudioManager {
    /// Binds both ingress ports and starts the receivers.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Fatal`] when either port cannot be bound; no
    /// partially initialized engine is ever exposed.
    pub async fn initialize(config: EngineConfig) -> RouteResult<Self> {
        let (discovered_tx, discovered_rx) = mpsc::channel(DISCOVERED_CHANNEL_CAPACITY);

        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let scream = ScreamReceiver::start(
            SocketAddr::new(any, config.scream_port),
            discovered_tx.clone(),
        )
        .await?;
        let rtp = match RtpReceiver::start(SocketAddr::new(any, config.rtp_port), discovered_tx)
            .await
        {
            Ok(rtp) => rtp,
            Err(e) => {
                // Roll the first listener back so no socket leaks past a
                // failed initialization.
                scream.stop().await;
                return Err(e);
            }
        };

        let scream_addr = scream.local_addr();
        let rtp_addr = rtp.local_addr();
        log::info!("[AudioManager] Initialized: scream={scream_addr}, rtp={rtp_addr}");

        Ok(Self {
            receivers: Mutex::new(Some((scream, rtp))),
            scream_addr,
            rtp_addr,
            sources: DashMap::new(),
            sinks: DashMap::new(),
            connections: Mutex::new(HashMap::new()),
            discovered_rx: Mutex::new(discovered_rx),
        })
    }

    /// Bound Scream ingress address.
    pub fn scream_addr(&self) -> SocketAddr {
        self.scream_addr
    }

    /// Bound RTP ingress address.
    pub fn rtp_addr(&self) -> SocketAddr {
        self.rtp_addr
    }

    /// Pulls the next newly discovered source, if any.
    pub fn poll_discovered_source(&self) -> Option<DiscoveredSource> {
        self.discovered_rx.lock().try_recv().ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sinks
    // ─────────────────────────────────────────────────────────────────────────

    /// Creates a sink mixer. Returns false (and logs) on failure or when the
    /// id is already taken.
    pub fn add_sink(&self, sink_id: &str, config: SinkConfig) -> bool {
        if self.sinks.contains_key(sink_id) {
            log::warn!("[AudioManager] add_sink: {sink_id} already exists");
            return false;
        }
        match SinkAudioMixer::start(sink_id.to_string(), config) {
            Ok(mixer) => {
                self.sinks.insert(sink_id.to_string(), mixer);
                self.connections
                    .lock()
                    .insert(sink_id.to_string(), HashSet::new());
                true
            }
            Err(e) => {
                log::error!("[AudioManager] add_sink {sink_id} failed: {e}");
                false
            }
        }
    }

    /// Destroys a sink, disconnecting every path feeding it first.
    pub async fn remove_sink(&self, sink_id: &str) -> bool {
        let Some((_, mixer)) = self.sinks.remove(sink_id) else {
            log::warn!("[AudioManager] remove_sink: {sink_id} not found");
            return false;
        };

        let feeding = self
            .connections
            .lock()
            .remove(sink_id)
            .unwrap_or_default();
        for instance_id in feeding {
            if let Some(source) = self.sources.get(&instance_id) {
                source.command(SourceCommand::DetachOutput);
            }
        }

        mixer.stop().await;
        true
    }

    /// Non-blocking pull from a sink's MP3 queue; empty when nothing is
    /// buffered or the sink does not exist.
    pub fn get_mp3_data(&self, sink_id: &str) -> Bytes {
        self.sinks
            .get(sink_id)
            .and_then(|mixer| mixer.mp3_feed().pull())
            .unwrap_or_default()
    }

    /// Registers an MP3 reader on a sink; encoding runs while at least one
    /// reader is registered.
    pub fn add_mp3_subscriber(&self, sink_id: &str) -> bool {
        match self.sinks.get(sink_id) {
            Some(mixer) => {
                mixer.mp3_feed().add_subscriber();
                true
            }
            None => false,
        }
    }

    /// Unregisters an MP3 reader.
    pub fn remove_mp3_subscriber(&self, sink_id: &str) -> bool {
        match self.sinks.get(sink_id) {
            Some(mixer) => {
                mixer.mp3_feed().remove_subscriber();
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Source paths
    // ─────────────────────────────────────────────────────────────────────────

    /// Instantiates a source-path processor and subscribes it to both
    /// ingress receivers. Returns the generated instance id.
    pub fn configure_source(&self, config: SourceConfig) -> RouteResult<String> {
        if self.receivers.lock().is_none() {
            return Err(RouteError::ComponentStartup(
                "engine is shutting down".into(),
            ));
        }

        let instance_id = Uuid::new_v4().to_string();
        let processor = SourceInputProcessor::start(instance_id.clone(), config, None)?;

        if let Some((scream, rtp)) = self.receivers.lock().as_ref() {
            scream.subscribe(&instance_id, processor.input_sender());
            rtp.subscribe(&instance_id, processor.input_sender());
        }

        self.sources.insert(instance_id.clone(), processor);
        Ok(instance_id)
    }

    /// Disconnects and tears down a source-path processor.
    pub async fn remove_source(&self, instance_id: &str) -> bool {
        let Some((_, processor)) = self.sources.remove(instance_id) else {
            log::warn!("[AudioManager] remove_source: {instance_id} not found");
            return false;
        };

        {
            let receivers = self.receivers.lock();
            if let Some((scream, rtp)) = receivers.as_ref() {
                scream.unsubscribe(instance_id);
                rtp.unsubscribe(instance_id);
            }
        }

        // Detach from whichever sink it feeds.
        {
            let mut connections = self.connections.lock();
            for (sink_id, feeding) in connections.iter_mut() {
                if feeding.remove(instance_id) {
                    if let Some(mixer) = self.sinks.get(sink_id) {
                        mixer.detach_input(instance_id);
                    }
                }
            }
        }

        processor.stop().await;
        true
    }

    /// Wires a path's output queue into a sink. A path feeds exactly one
    /// sink; connecting again moves it.
    pub fn connect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
        let Some(source) = self.sources.get(instance_id) else {
            log::warn!("[AudioManager] connect: source {instance_id} not found");
            return false;
        };
        let Some(mixer) = self.sinks.get(sink_id) else {
            log::warn!("[AudioManager] connect: sink {sink_id} not found");
            return false;
        };

        let mut connections = self.connections.lock();
        // Detach from a previous sink if the path was already wired.
        for (other_sink, feeding) in connections.iter_mut() {
            if other_sink != sink_id && feeding.remove(instance_id) {
                if let Some(other) = self.sinks.get(other_sink) {
                    other.detach_input(instance_id);
                }
            }
        }

        let (tx, rx) = mpsc::channel(PATH_OUTPUT_QUEUE_CHUNKS);
        if !mixer.attach_input(instance_id, rx) {
            log::error!("[AudioManager] connect: sink {sink_id} mixer is gone");
            return false;
        }
        source.command(SourceCommand::AttachOutput(tx));
        connections
            .entry(sink_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
        log::info!("[AudioManager] Connected {instance_id} -> {sink_id}");
        true
    }

    /// Unwires a path from a sink.
    pub fn disconnect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
        let mut connections = self.connections.lock();
        let removed = connections
            .get_mut(sink_id)
            .map_or(false, |feeding| feeding.remove(instance_id));
        drop(connections);
        if !removed {
            log::warn!(
                "[AudioManager] disconnect: {instance_id} is not feeding {sink_id}"
            );
            return false;
        }

        if let Some(source) = self.sources.get(instance_id) {
            source.command(SourceCommand::DetachOutput);
        }
        if let Some(mixer) = self.sinks.get(sink_id) {
            mixer.detach_input(instance_id);
        }
        log::info!("[AudioManager] Disconnected {instance_id} -> {sink_id}");
        true
    }

    fn send_source_command(&self, instance_id: &str, command: SourceCommand) -> bool {
        match self.sources.get(instance_id) {
            Some(source) => source.command(command),
            None => {
                log::warn!("[AudioManager] update: source {instance_id} not found");
                false
            }
        }
    }

    pub fn update_source_volume(&self, instance_id: &str, volume: f32) -> bool {
        self.send_source_command(instance_id, SourceCommand::SetVolume(volume))
    }

    pub fn update_source_equalizer(&self, instance_id: &str, eq: EqualizerSettings) -> bool {
        self.send_source_command(instance_id, SourceCommand::SetEqualizer(eq))
    }

    pub fn update_source_delay(&self, instance_id: &str, delay_ms: u32) -> bool {
        self.send_source_command(instance_id, SourceCommand::SetDelay(delay_ms))
    }

    pub fn update_source_timeshift(&self, instance_id: &str, backshift_sec: f32) -> bool {
        self.send_source_command(instance_id, SourceCommand::SetTimeshift(backshift_sec))
    }

    pub fn update_source_speaker_layouts_map(
        &self,
        instance_id: &str,
        layouts: std::collections::BTreeMap<u8, SpeakerLayoutMatrix>,
    ) -> bool {
        self.send_source_command(instance_id, SourceCommand::SetSpeakerLayouts(layouts))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────────────────

    /// Counter snapshot across every component, for the host to sample.
    /// Nothing in the data path logs per-packet; this is the visibility
    /// surface instead.
    pub fn diagnostics(&self) -> serde_json::Value {
        let receivers = self.receivers.lock();
        let ingress = receivers.as_ref().map(|(scream, rtp)| {
            serde_json::json!({
                "scream": scream.metrics().snapshot(),
                "rtp": rtp.metrics().snapshot(),
            })
        });
        drop(receivers);

        let sources: serde_json::Map<String, serde_json::Value> = self
            .sources
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    serde_json::json!({
                        "state": entry.value().state(),
                        "metrics": entry.value().metrics(),
                    }),
                )
            })
            .collect();
        let sinks: serde_json::Map<String, serde_json::Value> = self
            .sinks
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    serde_json::json!({ "metrics": entry.value().metrics() }),
                )
            })
            .collect();

        serde_json::json!({
            "ingress": ingress,
            "sources": sources,
            "sinks": sinks,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Two-phase shutdown: receivers first (no new input), then source
    /// processors, then sink mixers. Each join is bounded.
    pub async fn shutdown(&self) {
        log::info!("[AudioManager] Shutting down");
        if let Some((scream, rtp)) = self.receivers.lock().take() {
            // Sockets close here, unblocking the receive loops.
            scream.stop().await;
            rtp.stop().await;
        }

        let source_ids: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        for instance_id in source_ids {
            if let Some((_, processor)) = self.sources.remove(&instance_id) {
                processor.stop().await;
            }
        }

        let sink_ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for sink_id in sink_ids {
            if let Some((_, mixer)) = self.sinks.remove(&sink_id) {
                mixer.stop().await;
            }
        }
        self.connections.lock().clear();
        log::info!("[AudioManager] Shutdown complete");
    }
}
