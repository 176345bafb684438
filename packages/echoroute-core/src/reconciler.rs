//! Declarative state reconciliation.
//!
//! [`ConfigApplier`] diffs a [`DesiredEngineState`] against its shadow of
//! what is actually running and drives the engine with a minimal set of
//! imperative calls. Applying the same state twice performs zero engine
//! mutations.
//!
//! Failure policy: individual engine failures are logged with full context
//! and reflected in the shadow (a failed re-add leaves the path absent);
//! `apply_state` returns true only when nothing failed. Nothing is ever
//! rolled back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RouteResult;
use crate::manager::AudioManager;
use crate::state::{
    AppliedSinkParams, AppliedSourcePathParams, DesiredEngineState, EqualizerSettings,
    SinkConfig, SourceConfig, SpeakerLayoutMatrix,
};

/// The imperative operations the reconciler drives.
///
/// [`AudioManager`] is the production implementation; tests substitute a
/// recorder to assert exact call sequences.
#[async_trait]
pub trait EngineOps: Send + Sync {
    fn add_sink(&self, sink_id: &str, config: SinkConfig) -> bool;
    async fn remove_sink(&self, sink_id: &str) -> bool;
    fn configure_source(&self, config: SourceConfig) -> RouteResult<String>;
    async fn remove_source(&self, instance_id: &str) -> bool;
    fn connect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool;
    fn disconnect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool;
    fn update_source_volume(&self, instance_id: &str, volume: f32) -> bool;
    fn update_source_equalizer(&self, instance_id: &str, eq: EqualizerSettings) -> bool;
    fn update_source_delay(&self, instance_id: &str, delay_ms: u32) -> bool;
    fn update_source_timeshift(&self, instance_id: &str, backshift_sec: f32) -> bool;
    fn update_source_speaker_layouts_map(
        &self,
        instance_id: &str,
        layouts: BTreeMap<u8, SpeakerLayoutMatrix>,
    ) -> bool;
}

#[async_trait]
impl EngineOps for AudioManager {
    fn add_sink(&self, sink_id: &str, config: SinkConfig) -> bool {
        AudioManager::add_sink(self, sink_id, config)
    }
    async fn remove_sink(&self, sink_id: &str) -> bool {
        AudioManager::remove_sink(self, sink_id).await
    }
    fn configure_source(&self, config: SourceConfig) -> RouteResult<String> {
        AudioManager::configure_source(self, config)
    }
    async fn remove_source(&self, instance_id: &str) -> bool {
        AudioManager::remove_source(self, instance_id).await
    }
    fn connect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
        AudioManager::connect_source_sink(self, instance_id, sink_id)
    }
    fn disconnect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
        AudioManager::disconnect_source_sink(self, instance_id, sink_id)
    }
    fn update_source_volume(&self, instance_id: &str, volume: f32) -> bool {
        AudioManager::update_source_volume(self, instance_id, volume)
    }
    fn update_source_equalizer(&self, instance_id: &str, eq: EqualizerSettings) -> bool {
        AudioManager::update_source_equalizer(self, instance_id, eq)
    }
    fn update_source_delay(&self, instance_id: &str, delay_ms: u32) -> bool {
        AudioManager::update_source_delay(self, instance_id, delay_ms)
    }
    fn update_source_timeshift(&self, instance_id: &str, backshift_sec: f32) -> bool {
        AudioManager::update_source_timeshift(self, instance_id, backshift_sec)
    }
    fn update_source_speaker_layouts_map(
        &self,
        instance_id: &str,
        layouts: BTreeMap<u8, SpeakerLayoutMatrix>,
    ) -> bool {
        AudioManager::update_source_speaker_layouts_map(self, instance_id, layouts)
    }
}

/// Reconciles desired engine state against the running engine.
pub struct ConfigApplier {
    engine: Arc<dyn EngineOps>,
    active_sinks: HashMap<String, AppliedSinkParams>,
    active_source_paths: HashMap<String, AppliedSourcePathParams>,
}

impl ConfigApplier {
    pub fn new(engine: Arc<dyn EngineOps>) -> Self {
        Self {
            engine,
            active_sinks: HashMap::new(),
            active_source_paths: HashMap::new(),
        }
    }

    /// Currently applied sinks, as the reconciler believes them to be.
    pub fn active_sinks(&self) -> &HashMap<String, AppliedSinkParams> {
        &self.active_sinks
    }

    /// Currently applied paths, including their generated instance ids.
    pub fn active_source_paths(&self) -> &HashMap<String, AppliedSourcePathParams> {
        &self.active_source_paths
    }

    /// Drives the engine toward `desired`. Returns true iff every
    /// individual operation succeeded.
    pub async fn apply_state(&mut self, desired: DesiredEngineState) -> bool {
        let mut ok = true;

        let desired_sinks: HashMap<String, AppliedSinkParams> = desired
            .sinks
            .into_iter()
            .map(|sink| (sink.sink_id.clone(), sink))
            .collect();
        let desired_paths: HashMap<String, AppliedSourcePathParams> = desired
            .source_paths
            .into_iter()
            .map(|path| (path.path_id.clone(), path))
            .collect();

        // Classify paths and sinks. Sorted so the operation order (and the
        // logs) are deterministic run to run.
        let mut paths_to_remove: Vec<String> = self
            .active_source_paths
            .keys()
            .filter(|id| !desired_paths.contains_key(*id))
            .cloned()
            .collect();
        paths_to_remove.sort();
        let mut paths_to_add: Vec<String> = desired_paths
            .keys()
            .filter(|id| !self.active_source_paths.contains_key(*id))
            .cloned()
            .collect();
        paths_to_add.sort();
        let mut paths_to_update: Vec<String> = desired_paths
            .keys()
            .filter(|id| {
                self.active_source_paths
                    .get(*id)
                    .is_some_and(|active| !active.params_equal(&desired_paths[*id]))
            })
            .cloned()
            .collect();
        paths_to_update.sort();

        let mut sinks_to_remove: Vec<String> = self
            .active_sinks
            .keys()
            .filter(|id| !desired_sinks.contains_key(*id))
            .cloned()
            .collect();
        sinks_to_remove.sort();
        let mut sinks_to_add: Vec<String> = desired_sinks
            .keys()
            .filter(|id| !self.active_sinks.contains_key(*id))
            .cloned()
            .collect();
        sinks_to_add.sort();

        // 1. Remove source paths.
        for path_id in &paths_to_remove {
            ok &= self.remove_path(path_id).await;
        }

        // 2. Remove sinks.
        for sink_id in &sinks_to_remove {
            tracing::info!("[ConfigApplier] Removing sink {sink_id}");
            if !self.engine.remove_sink(sink_id).await {
                tracing::error!("[ConfigApplier] remove_sink {sink_id} failed");
                ok = false;
            }
            self.active_sinks.remove(sink_id);
        }

        // 3. Add source paths.
        for path_id in &paths_to_add {
            ok &= self.add_path(desired_paths[path_id].clone());
        }

        // 4. Add sinks and reconcile their connections.
        for sink_id in &sinks_to_add {
            let params = &desired_sinks[sink_id];
            tracing::info!("[ConfigApplier] Adding sink {sink_id}");
            if self
                .engine
                .add_sink(sink_id, params.sink_engine_config.clone())
            {
                self.active_sinks.insert(
                    sink_id.clone(),
                    AppliedSinkParams {
                        sink_id: sink_id.clone(),
                        sink_engine_config: params.sink_engine_config.clone(),
                        connected_source_path_ids: Vec::new(),
                    },
                );
                ok &= self.reconcile_connections(sink_id, &params.connected_source_path_ids);
            } else {
                tracing::error!(
                    "[ConfigApplier] add_sink {sink_id} failed: dest={}:{}",
                    params.sink_engine_config.output_ip,
                    params.sink_engine_config.output_port
                );
                ok = false;
            }
        }

        // 5. Update source paths.
        for path_id in &paths_to_update {
            ok &= self.update_path(desired_paths[path_id].clone()).await;
        }

        // 6. Update sinks: engine-config changes rebuild, connection-set
        // changes reconcile.
        let mut sink_ids: Vec<&String> = desired_sinks.keys().collect();
        sink_ids.sort();
        for sink_id in sink_ids {
            let params = &desired_sinks[sink_id];
            let Some(active) = self.active_sinks.get(sink_id) else {
                continue; // added above (or failed to add)
            };
            if active.sink_engine_config != params.sink_engine_config {
                tracing::info!("[ConfigApplier] Sink {sink_id} config changed, rebuilding");
                if !self.engine.remove_sink(sink_id).await {
                    tracing::error!("[ConfigApplier] remove_sink {sink_id} for rebuild failed");
                    ok = false;
                }
                self.active_sinks.remove(sink_id);
                if self
                    .engine
                    .add_sink(sink_id, params.sink_engine_config.clone())
                {
                    self.active_sinks.insert(
                        sink_id.clone(),
                        AppliedSinkParams {
                            sink_id: sink_id.clone(),
                            sink_engine_config: params.sink_engine_config.clone(),
                            connected_source_path_ids: Vec::new(),
                        },
                    );
                } else {
                    tracing::error!("[ConfigApplier] re-add of sink {sink_id} failed");
                    ok = false;
                    continue;
                }
            }
            ok &= self.reconcile_connections(sink_id, &params.connected_source_path_ids);
        }

        ok
    }

    /// Removes a path from the engine and the shadow.
    async fn remove_path(&mut self, path_id: &str) -> bool {
        let mut ok = true;
        if let Some(active) = self.active_source_paths.remove(path_id) {
            if let Some(instance_id) = active.generated_instance_id {
                tracing::info!("[ConfigApplier] Removing path {path_id} ({instance_id})");
                if !self.engine.remove_source(&instance_id).await {
                    tracing::error!(
                        "[ConfigApplier] remove_source failed: path={path_id}, instance={instance_id}"
                    );
                    ok = false;
                }
                // The connection died with the instance.
                for sink in self.active_sinks.values_mut() {
                    sink.connected_source_path_ids.retain(|id| id != path_id);
                }
            }
        }
        ok
    }

    /// Configures a new path instance and records it in the shadow.
    fn add_path(&mut self, mut params: AppliedSourcePathParams) -> bool {
        tracing::info!(
            "[ConfigApplier] Adding path {}: tag={}, sink={}",
            params.path_id,
            params.source_tag,
            params.target_sink_id
        );
        match self.engine.configure_source(params.to_source_config()) {
            Ok(instance_id) => {
                if !params.speaker_layouts_map.is_empty() {
                    self.engine.update_source_speaker_layouts_map(
                        &instance_id,
                        params.speaker_layouts_map.clone(),
                    );
                }
                params.generated_instance_id = Some(instance_id);
                self.active_source_paths
                    .insert(params.path_id.clone(), params);
                true
            }
            Err(e) => {
                tracing::error!(
                    "[ConfigApplier] configure_source failed: path={}, tag={}, out={}ch/{}Hz: {e}",
                    params.path_id,
                    params.source_tag,
                    params.target_output_channels,
                    params.target_output_samplerate
                );
                false
            }
        }
    }

    /// Applies a changed path: fundamental changes rebuild the instance,
    /// anything else updates it in place.
    async fn update_path(&mut self, desired: AppliedSourcePathParams) -> bool {
        let Some(active) = self.active_source_paths.get(&desired.path_id).cloned() else {
            return self.add_path(desired);
        };

        if active.is_fundamental_change(&desired) {
            tracing::info!(
                "[ConfigApplier] Path {} changed fundamentally, rebuilding",
                desired.path_id
            );
            let mut ok = self.remove_path(&desired.path_id).await;
            ok &= self.add_path(desired);
            // Connections are re-established by the sink update phase, which
            // sees the path missing from every shadow connection list.
            return ok;
        }

        let Some(instance_id) = active.generated_instance_id.clone() else {
            // Never came up; try again from scratch.
            return self.add_path(desired);
        };

        let mut ok = true;
        if !crate::state::float_params_equal(active.volume, desired.volume) {
            ok &= self.engine.update_source_volume(&instance_id, desired.volume);
        }
        if active.eq != desired.eq {
            ok &= self
                .engine
                .update_source_equalizer(&instance_id, desired.eq.clone());
        }
        if active.delay_ms != desired.delay_ms {
            ok &= self.engine.update_source_delay(&instance_id, desired.delay_ms);
        }
        if !crate::state::float_params_equal(active.timeshift_sec, desired.timeshift_sec) {
            ok &= self
                .engine
                .update_source_timeshift(&instance_id, desired.timeshift_sec);
        }
        if active.speaker_layouts_map != desired.speaker_layouts_map {
            ok &= self
                .engine
                .update_source_speaker_layouts_map(&instance_id, desired.speaker_layouts_map.clone());
        }
        if !ok {
            tracing::error!(
                "[ConfigApplier] update failed: path={}, instance={instance_id}",
                desired.path_id
            );
        }

        let mut updated = desired;
        updated.generated_instance_id = Some(instance_id);
        self.active_source_paths
            .insert(updated.path_id.clone(), updated);
        ok
    }

    /// Brings one sink's connection set in line with the desired path ids.
    fn reconcile_connections(&mut self, sink_id: &str, desired_path_ids: &[String]) -> bool {
        let Some(active) = self.active_sinks.get(sink_id) else {
            return false;
        };
        let current: HashSet<&String> = active.connected_source_path_ids.iter().collect();
        let wanted: HashSet<&String> = desired_path_ids.iter().collect();

        let mut ok = true;
        let mut connected: Vec<String> = active
            .connected_source_path_ids
            .iter()
            .filter(|id| wanted.contains(*id))
            .cloned()
            .collect();

        // Disconnect paths no longer wanted.
        for path_id in current.difference(&wanted) {
            let instance_id = self
                .active_source_paths
                .get(path_id.as_str())
                .and_then(|p| p.generated_instance_id.clone());
            if let Some(instance_id) = instance_id {
                if !self.engine.disconnect_source_sink(&instance_id, sink_id) {
                    tracing::error!(
                        "[ConfigApplier] disconnect failed: path={path_id}, sink={sink_id}"
                    );
                    ok = false;
                }
            }
        }

        // Connect newly wanted paths.
        for path_id in wanted.difference(&current) {
            let instance_id = self
                .active_source_paths
                .get(path_id.as_str())
                .and_then(|p| p.generated_instance_id.clone());
            match instance_id {
                Some(instance_id) => {
                    if self.engine.connect_source_sink(&instance_id, sink_id) {
                        connected.push((*path_id).clone());
                    } else {
                        tracing::error!(
                            "[ConfigApplier] connect failed: path={path_id}, instance={instance_id}, sink={sink_id}"
                        );
                        ok = false;
                    }
                }
                None => {
                    tracing::error!(
                        "[ConfigApplier] cannot connect {path_id} to {sink_id}: path has no instance"
                    );
                    ok = false;
                }
            }
        }

        if let Some(active) = self.active_sinks.get_mut(sink_id) {
            active.connected_source_path_ids = connected;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouteError;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every engine call so tests can assert exact sequences.
    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
        next_instance: AtomicUsize,
        fail_configure: Mutex<bool>,
    }

    impl RecordingEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn clear(&self) {
            self.calls.lock().clear();
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl EngineOps for RecordingEngine {
        fn add_sink(&self, sink_id: &str, _config: SinkConfig) -> bool {
            self.record(format!("add_sink({sink_id})"));
            true
        }
        async fn remove_sink(&self, sink_id: &str) -> bool {
            self.record(format!("remove_sink({sink_id})"));
            true
        }
        fn configure_source(&self, config: SourceConfig) -> RouteResult<String> {
            if *self.fail_configure.lock() {
                self.record("configure_source(FAIL)".into());
                return Err(RouteError::ComponentStartup("forced failure".into()));
            }
            let id = format!("id{}", self.next_instance.fetch_add(1, Ordering::SeqCst));
            self.record(format!("configure_source({}) -> {id}", config.source_tag));
            Ok(id)
        }
        async fn remove_source(&self, instance_id: &str) -> bool {
            self.record(format!("remove_source({instance_id})"));
            true
        }
        fn connect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
            self.record(format!("connect({instance_id}, {sink_id})"));
            true
        }
        fn disconnect_source_sink(&self, instance_id: &str, sink_id: &str) -> bool {
            self.record(format!("disconnect({instance_id}, {sink_id})"));
            true
        }
        fn update_source_volume(&self, instance_id: &str, volume: f32) -> bool {
            self.record(format!("update_volume({instance_id}, {volume})"));
            true
        }
        fn update_source_equalizer(&self, instance_id: &str, _eq: EqualizerSettings) -> bool {
            self.record(format!("update_eq({instance_id})"));
            true
        }
        fn update_source_delay(&self, instance_id: &str, delay_ms: u32) -> bool {
            self.record(format!("update_delay({instance_id}, {delay_ms})"));
            true
        }
        fn update_source_timeshift(&self, instance_id: &str, backshift_sec: f32) -> bool {
            self.record(format!("update_timeshift({instance_id}, {backshift_sec})"));
            true
        }
        fn update_source_speaker_layouts_map(
            &self,
            instance_id: &str,
            _layouts: BTreeMap<u8, SpeakerLayoutMatrix>,
        ) -> bool {
            self.record(format!("update_layouts({instance_id})"));
            true
        }
    }

    fn sink_params(sink_id: &str, connected: &[&str]) -> AppliedSinkParams {
        AppliedSinkParams {
            sink_id: sink_id.into(),
            sink_engine_config: SinkConfig {
                output_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                output_port: 4010,
                ..Default::default()
            },
            connected_source_path_ids: connected.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn path_params(path_id: &str, sink_id: &str, volume: f32) -> AppliedSourcePathParams {
        AppliedSourcePathParams {
            path_id: path_id.into(),
            source_tag: "192.168.1.10".into(),
            target_sink_id: sink_id.into(),
            volume,
            eq: EqualizerSettings::flat(),
            delay_ms: 0,
            timeshift_sec: 0.0,
            target_output_channels: 2,
            target_output_samplerate: 48000,
            speaker_layouts_map: BTreeMap::new(),
            generated_instance_id: None,
        }
    }

    fn one_sink_one_path(volume: f32) -> DesiredEngineState {
        DesiredEngineState {
            sinks: vec![sink_params("s1", &["p1"])],
            source_paths: vec![path_params("p1", "s1", volume)],
        }
    }

    #[tokio::test]
    async fn initial_apply_adds_configures_and_connects() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());

        assert!(applier.apply_state(one_sink_one_path(0.5)).await);
        assert_eq!(
            engine.calls(),
            vec![
                "configure_source(192.168.1.10) -> id0",
                "add_sink(s1)",
                "connect(id0, s1)",
            ]
        );
    }

    #[tokio::test]
    async fn reapplying_identical_state_is_a_no_op() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);

        engine.clear();
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);
        assert!(
            engine.calls().is_empty(),
            "second apply must not touch the engine: {:?}",
            engine.calls()
        );
    }

    #[tokio::test]
    async fn volume_change_only_updates_volume() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);

        engine.clear();
        assert!(applier.apply_state(one_sink_one_path(0.8)).await);
        assert_eq!(engine.calls(), vec!["update_volume(id0, 0.8)"]);
    }

    #[tokio::test]
    async fn applying_empty_state_tears_everything_down() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);

        engine.clear();
        assert!(applier.apply_state(DesiredEngineState::default()).await);
        assert_eq!(
            engine.calls(),
            vec!["remove_source(id0)", "remove_sink(s1)"]
        );
        assert!(applier.active_sinks().is_empty());
        assert!(applier.active_source_paths().is_empty());
    }

    #[tokio::test]
    async fn fundamental_change_rebuilds_the_path_and_reconnects() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);

        engine.clear();
        let mut desired = one_sink_one_path(0.5);
        desired.source_paths[0].target_output_samplerate = 44100;
        assert!(applier.apply_state(desired).await);
        assert_eq!(
            engine.calls(),
            vec![
                "remove_source(id0)",
                "configure_source(192.168.1.10) -> id1",
                "connect(id1, s1)",
            ]
        );
        let path = &applier.active_source_paths()["p1"];
        assert_eq!(path.generated_instance_id.as_deref(), Some("id1"));
    }

    #[tokio::test]
    async fn sink_config_change_rebuilds_sink_and_reconnects() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);

        engine.clear();
        let mut desired = one_sink_one_path(0.5);
        desired.sinks[0].sink_engine_config.output_port = 4020;
        assert!(applier.apply_state(desired).await);
        assert_eq!(
            engine.calls(),
            vec!["remove_sink(s1)", "add_sink(s1)", "connect(id0, s1)"]
        );
    }

    #[tokio::test]
    async fn connection_set_change_only_touches_connections() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());

        let mut desired = DesiredEngineState {
            sinks: vec![sink_params("s1", &["p1", "p2"])],
            source_paths: vec![
                path_params("p1", "s1", 0.5),
                path_params("p2", "s1", 0.5),
            ],
        };
        assert!(applier.apply_state(desired.clone()).await);

        engine.clear();
        desired.sinks[0].connected_source_path_ids = vec!["p1".into()];
        desired.source_paths.truncate(1);
        assert!(applier.apply_state(desired).await);
        // p2 is removed; its shadow connection disappears with it, so the
        // sink phase has nothing left to disconnect.
        assert_eq!(engine.calls(), vec!["remove_source(id1)"]);
    }

    #[tokio::test]
    async fn failed_configure_leaves_path_out_of_shadow_and_reports_failure() {
        let engine = Arc::new(RecordingEngine::default());
        *engine.fail_configure.lock() = true;
        let mut applier = ConfigApplier::new(engine.clone());

        assert!(!applier.apply_state(one_sink_one_path(0.5)).await);
        assert!(applier.active_source_paths().is_empty());
        // The sink still came up; its connection is pending the path.
        assert!(applier.active_sinks().contains_key("s1"));

        // Once configuration succeeds, a re-apply converges.
        *engine.fail_configure.lock() = false;
        engine.clear();
        assert!(applier.apply_state(one_sink_one_path(0.5)).await);
        assert_eq!(
            engine.calls(),
            vec![
                "configure_source(192.168.1.10) -> id0",
                "connect(id0, s1)",
            ]
        );
    }

    #[tokio::test]
    async fn speaker_layouts_are_applied_separately_after_configure() {
        let engine = Arc::new(RecordingEngine::default());
        let mut applier = ConfigApplier::new(engine.clone());

        let mut desired = one_sink_one_path(0.5);
        desired.source_paths[0]
            .speaker_layouts_map
            .insert(2, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(applier.apply_state(desired).await);
        assert_eq!(
            engine.calls(),
            vec![
                "configure_source(192.168.1.10) -> id0",
                "update_layouts(id0)",
                "add_sink(s1)",
                "connect(id0, s1)",
            ]
        );
    }
}
