//! Measurement orchestrator.
//!
//! [`Measurement`] owns the parameter store, the settings and the derived
//! [`MeasurementState`], and drives the engine state machine. A
//! [`MeasurementScript`] supplies the actual routine.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut measurement = Measurement::new("gate sweep", Arc::new(InMemoryMetadata::default()));
//! measurement.setup(store, SetupOptions::default())?;
//! let report = measurement.run(&Sweep1D, &HookSwitches::all_enabled()).await?;
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{BufferSettings, MeasurementSettings};
use crate::data::{Dataset, ReadoutEntry};
use crate::error::{AppResult, DaqError};
use crate::experiment::classifier::{reset_channels, MeasurementState, ParameterClassifier};
use crate::experiment::hooks::{HookChain, HookContext, HookSwitches, InstrumentationWarning};
use crate::experiment::state::EngineState;
use crate::experiment::sweep::{resolve_buffered_num_points, SweepBuilder};
use crate::hardware::RampSettings;
use crate::metadata::MetadataStore;
use crate::parameter::ParameterStore;

/// A measurement routine.
#[async_trait]
pub trait MeasurementScript: Send + Sync {
    /// Name recorded in metadata
    fn name(&self) -> &str;

    /// Whether the routine acquires through buffers
    fn buffered(&self) -> bool {
        false
    }

    /// Execute the routine on an initialized measurement.
    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>>;
}

/// Options for [`Measurement::setup`].
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Ramp timing and output naming
    pub settings: MeasurementSettings,
    /// Settings applied to every buffer
    pub buffer_settings: BufferSettings,
    /// Name of the script to record in metadata
    pub script: Option<String>,
    /// Record the script name in metadata
    pub add_script_to_metadata: bool,
    /// Record the parameter store in metadata
    pub add_parameters_to_metadata: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            settings: MeasurementSettings::default(),
            buffer_settings: BufferSettings::default(),
            script: None,
            add_script_to_metadata: true,
            add_parameters_to_metadata: true,
        }
    }
}

/// Outcome of [`Measurement::run`].
#[derive(Debug, Default)]
pub struct RunReport {
    /// One dataset per sweep, in sweep order
    pub datasets: Vec<Dataset>,
    /// Hook failures that did not stop the run
    pub warnings: Vec<InstrumentationWarning>,
}

/// A configured measurement and its engine state.
pub struct Measurement {
    name: String,
    store: ParameterStore,
    settings: MeasurementSettings,
    ramp: RampSettings,
    buffer_settings: BufferSettings,
    buffered_num_points: Option<usize>,
    buffered: bool,
    metadata: Arc<dyn MetadataStore>,
    hooks: HookChain,
    engine_state: EngineState,
    state: Option<MeasurementState>,
}

impl Measurement {
    /// An unconfigured measurement writing provenance to `metadata`.
    pub fn new(name: &str, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            name: name.to_string(),
            store: ParameterStore::new(),
            settings: MeasurementSettings::default(),
            ramp: RampSettings::default(),
            buffer_settings: BufferSettings::default(),
            buffered_num_points: None,
            buffered: false,
            metadata,
            hooks: HookChain::standard(),
            engine_state: EngineState::Uninitialized,
            state: None,
        }
    }

    /// Replace the lifecycle hook chain.
    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install parameters and settings.
    ///
    /// Resolves the buffered point count and the ramp timing up front, so an
    /// overdetermined buffer specification or an unusable ramp time is
    /// reported here. Metadata writes are best-effort.
    pub fn setup(&mut self, store: ParameterStore, options: SetupOptions) -> AppResult<()> {
        if matches!(
            self.engine_state,
            EngineState::Running | EngineState::Initializing
        ) {
            return Err(self.engine_state.invalid("setup"));
        }
        let buffered_num_points = resolve_buffered_num_points(&options.buffer_settings)?;
        let ramp = RampSettings::from_measurement(&options.settings)?;

        if options.add_script_to_metadata {
            if let Some(script) = &options.script {
                if let Err(e) = self.metadata.set_script(script) {
                    warn!(error = %e, "Could not add script to metadata");
                }
            }
        }
        if options.add_parameters_to_metadata {
            let written = store
                .to_json()
                .and_then(|settings| self.metadata.set_settings(settings));
            if let Err(e) = written {
                warn!(error = %e, "Could not add parameters to metadata");
            }
        }

        self.store = store;
        self.settings = options.settings;
        self.ramp = ramp;
        self.buffer_settings = options.buffer_settings;
        self.buffered_num_points = buffered_num_points;
        self.engine_state = EngineState::Uninitialized;
        self.state = None;
        info!(measurement = %self.name, parameters = self.store.len(), "Measurement set up");
        Ok(())
    }

    /// Measurement name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters installed by [`Measurement::setup`]
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    /// Measurement settings
    pub fn settings(&self) -> &MeasurementSettings {
        &self.settings
    }

    /// Buffer settings as given at setup
    pub fn buffer_settings(&self) -> &BufferSettings {
        &self.buffer_settings
    }

    /// Global point count for buffered sweeps, if the settings define one
    pub fn buffered_num_points(&self) -> Option<usize> {
        self.buffered_num_points
    }

    /// Select buffered or point-by-point sweeps for the next initialize.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Whether the next initialize builds buffered sweeps
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Current engine state
    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    /// Derived state, present once initialized
    pub fn state(&self) -> Option<&MeasurementState> {
        self.state.as_ref()
    }

    /// Provenance store
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Ramp limits derived from the settings at setup
    pub fn ramp_settings(&self) -> RampSettings {
        self.ramp
    }

    /// Classify parameters, position channels and collect buffers.
    ///
    /// Every configuration and capability error is raised before any channel
    /// is set or any buffer subscribed. On failure the engine returns to
    /// `Uninitialized`.
    pub async fn initialize(&mut self) -> AppResult<()> {
        if !self.engine_state.can_initialize() {
            return Err(self.engine_state.invalid("initialize"));
        }
        if let Some(previous) = self.state.as_mut() {
            previous.buffers.disarm_all().await;
        }
        self.engine_state = EngineState::Initializing;
        self.state = None;

        let result = self.classify().await;
        match result {
            Ok(state) => {
                self.state = Some(state);
                self.engine_state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.engine_state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    async fn classify(&self) -> AppResult<MeasurementState> {
        let sweeps = if self.buffered {
            SweepBuilder::buffered(self.buffered_num_points)
        } else {
            SweepBuilder::unbuffered()
        };
        let plan = ParameterClassifier::new(&self.store, sweeps).plan()?;
        plan.apply(&self.store, &self.ramp_settings()).await
    }

    /// Return static and dynamic channels to their initial values.
    ///
    /// When called from inside a running routine the engine stays `Running`.
    pub async fn reset(&mut self) -> AppResult<()> {
        if !self.engine_state.can_reset() {
            return Err(self.engine_state.invalid("reset"));
        }
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| self.engine_state.invalid("reset"))?;
        let resume = self.engine_state;
        self.engine_state = EngineState::Reset;
        let result = reset_channels(&self.store, state, &self.ramp_settings()).await;
        self.engine_state = if resume == EngineState::Running {
            EngineState::Running
        } else {
            EngineState::Ready
        };
        result
    }

    /// Set up and start every buffer.
    pub async fn ready_buffers(&mut self) -> AppResult<()> {
        let settings = self.buffer_settings_for_ready();
        let state = self.initialized_state_mut("ready buffers")?;
        state.buffers.ready_buffers(&settings).await
    }

    /// Stop every buffer and return one entry per subscribed channel.
    pub async fn readout_buffers(&mut self) -> AppResult<Vec<ReadoutEntry>> {
        let state = self.initialized_state_mut("read out buffers")?;
        state.buffers.readout_buffers().await
    }

    /// Run hooks, initialize and execute `script`.
    pub async fn run<S>(&mut self, script: &S, switches: &HookSwitches) -> AppResult<RunReport>
    where
        S: MeasurementScript + ?Sized,
    {
        if !self.engine_state.can_initialize() {
            return Err(self.engine_state.invalid("run"));
        }

        let ctx = HookContext {
            measurement_name: &self.name,
            metadata: self.metadata.as_ref(),
        };
        let warnings = self.hooks.run(&ctx, switches);

        self.buffered = script.buffered();
        self.initialize().await?;
        if !self.engine_state.can_run() {
            return Err(self.engine_state.invalid("run"));
        }

        info!(measurement = %self.name, script = script.name(), "Run started");
        self.engine_state = EngineState::Running;
        let result = script.run(self).await;
        self.engine_state = EngineState::Ready;

        match result {
            Ok(datasets) => {
                info!(measurement = %self.name, datasets = datasets.len(), "Run finished");
                Ok(RunReport { datasets, warnings })
            }
            Err(e) => {
                warn!(measurement = %self.name, error = %e, "Run failed, disarming buffers");
                if let Some(state) = self.state.as_mut() {
                    state.buffers.disarm_all().await;
                }
                Err(e)
            }
        }
    }

    /// Buffer settings handed to `ready_buffers`.
    ///
    /// A point count derived from `sampling_rate`/`burst_duration` is not
    /// copied into `num_points`; the buffer gets the rate form only.
    fn buffer_settings_for_ready(&self) -> BufferSettings {
        let mut settings = self.buffer_settings.clone();
        let rate_given =
            settings.sampling_rate.is_some() || settings.burst_duration.is_some();
        if settings.num_points.is_none() && !rate_given {
            settings.num_points = self.buffered_num_points;
        }
        settings
    }

    fn initialized_state_mut(&mut self, operation: &str) -> AppResult<&mut MeasurementState> {
        let engine_state = self.engine_state;
        self.state
            .as_mut()
            .ok_or_else(|| engine_state.invalid(operation))
    }
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Measurement")
            .field("name", &self.name)
            .field("engine_state", &self.engine_state)
            .field("buffered", &self.buffered)
            .field("parameters", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadata;

    struct Noop;

    #[async_trait]
    impl MeasurementScript for Noop {
        fn name(&self) -> &str {
            "Noop"
        }

        async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
            assert_eq!(measurement.engine_state(), EngineState::Running);
            Ok(vec![Dataset::new(measurement.name())])
        }
    }

    #[tokio::test]
    async fn run_moves_through_states() {
        let metadata = Arc::new(InMemoryMetadata::default());
        let mut measurement = Measurement::new("empty", metadata.clone());
        measurement
            .setup(ParameterStore::new(), SetupOptions::default())
            .unwrap();
        assert_eq!(measurement.engine_state(), EngineState::Uninitialized);

        let report = measurement
            .run(&Noop, &HookSwitches::all_enabled())
            .await
            .unwrap();
        assert_eq!(report.datasets.len(), 1);
        assert_eq!(measurement.engine_state(), EngineState::Ready);
        assert_eq!(metadata.save_count(), 1);
    }

    #[tokio::test]
    async fn reset_before_initialize_is_invalid() {
        let mut measurement = Measurement::new("m", Arc::new(InMemoryMetadata::default()));
        let err = measurement.reset().await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidState { .. }));
        assert!(measurement.readout_buffers().await.is_err());
    }

    #[tokio::test]
    async fn setup_rejects_overdetermined_buffer_settings() {
        let mut measurement = Measurement::new("m", Arc::new(InMemoryMetadata::default()));
        let options = SetupOptions {
            buffer_settings: BufferSettings {
                num_points: Some(5),
                sampling_rate: Some(10.0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            measurement.setup(ParameterStore::new(), options),
            Err(DaqError::OverdeterminedBufferSpec)
        ));
    }

    #[tokio::test]
    async fn setup_rejects_unrepresentable_ramp_time() {
        let mut measurement = Measurement::new("m", Arc::new(InMemoryMetadata::default()));
        let options = SetupOptions {
            settings: MeasurementSettings {
                setpoint_interval: f64::INFINITY,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            measurement.setup(ParameterStore::new(), options),
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(measurement.ramp_settings(), RampSettings::default());
    }

    #[test]
    fn rate_form_buffer_settings_are_passed_through() {
        let mut measurement = Measurement::new("m", Arc::new(InMemoryMetadata::default()));
        let options = SetupOptions {
            buffer_settings: BufferSettings {
                sampling_rate: Some(10.0),
                burst_duration: Some(0.5),
                ..Default::default()
            },
            ..Default::default()
        };
        measurement.setup(ParameterStore::new(), options).unwrap();
        assert_eq!(measurement.buffered_num_points(), Some(5));

        let ready = measurement.buffer_settings_for_ready();
        assert_eq!(ready.num_points, None);
        assert_eq!(ready.sampling_rate, Some(10.0));
    }

    #[tokio::test]
    async fn setup_writes_script_and_parameters_to_metadata() {
        let metadata = Arc::new(InMemoryMetadata::default());
        let mut measurement = Measurement::new("m", metadata.clone());
        let store = ParameterStore::from_json(&serde_json::json!({
            "G1": {"voltage": {"type": "static", "value": 0.1}}
        }))
        .unwrap();
        measurement
            .setup(
                store,
                SetupOptions {
                    script: Some("Sweep1D".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let snapshot = metadata.snapshot();
        assert_eq!(snapshot.script.as_deref(), Some("Sweep1D"));
        assert!(snapshot.settings.unwrap().get("G1").is_some());
    }
}
