//! End-to-end tests for the measurement engine with point-by-point sweeps.
//!
//! Everything runs against mock instruments; ramping is configured so every
//! move is a single set command.

use std::sync::Arc;

use gate_daq::config::MeasurementSettings;
use std::time::Duration;

use gate_daq::experiment::{
    EngineState, HookSwitches, Measurement, ParallelSweep1D, SetupOptions, Sweep1D, Timetrace,
    TIME_COLUMN,
};
use gate_daq::hardware::mock::{MockChannel, MockInstrument};
use gate_daq::hardware::Channel;
use gate_daq::metadata::InMemoryMetadata;
use gate_daq::parameter::ParameterStore;
use gate_daq::{DaqError, ErrorKind, ParameterId, ParameterValue};
use serde_json::json;

// =============================================================================
// Fixtures
// =============================================================================

fn instant_settings() -> MeasurementSettings {
    MeasurementSettings {
        setpoint_interval: 0.0,
        wait_time: 0.0,
        ..Default::default()
    }
}

struct Bench {
    sweep_gate: Arc<MockChannel>,
    bias_gate: Arc<MockChannel>,
    dmm: Arc<MockChannel>,
    store: ParameterStore,
}

/// G1 voltage swept 0..1 in five points, G2 voltage held at 0.5,
/// DMM current recorded.
fn bench(parameters: serde_json::Value) -> Bench {
    let dac = MockInstrument::new("dac");
    let sweep_gate = dac.add_channel("ch01");
    let bias_gate = dac.add_channel("ch02");
    let multimeter = MockInstrument::new("dmm");
    let dmm = multimeter.add_channel("current");

    let mut store = ParameterStore::from_json(&parameters).unwrap();
    store
        .map_channel(&ParameterId::new("G1", "voltage"), sweep_gate.as_shared())
        .unwrap();
    if store.get(&ParameterId::new("G2", "voltage")).is_some() {
        store
            .map_channel(&ParameterId::new("G2", "voltage"), bias_gate.as_shared())
            .unwrap();
    }
    store
        .map_channel(&ParameterId::new("DMM", "current"), dmm.as_shared())
        .unwrap();

    Bench {
        sweep_gate,
        bias_gate,
        dmm,
        store,
    }
}

fn standard_parameters() -> serde_json::Value {
    json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "static", "value": 0.5}},
        "DMM": {"current": {"type": "gettable"}}
    })
}

fn measurement(name: &str, store: ParameterStore) -> (Measurement, Arc<InMemoryMetadata>) {
    let metadata = Arc::new(InMemoryMetadata::default());
    let mut measurement = Measurement::new(name, metadata.clone());
    measurement
        .setup(
            store,
            SetupOptions {
                settings: instant_settings(),
                script: Some("Sweep1D".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    (measurement, metadata)
}

fn floats(values: &[ParameterValue]) -> Vec<f64> {
    values.iter().filter_map(ParameterValue::as_f64).collect()
}

// =============================================================================
// Sweep1D
// =============================================================================

#[tokio::test]
async fn sweep_records_every_setpoint() {
    let bench = bench(standard_parameters());
    bench.dmm.set_value_silently(1e-9);
    let (mut measurement, metadata) = measurement("gate sweep", bench.store);

    let report = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert!(report.warnings.is_empty());
    assert_eq!(report.datasets.len(), 1);
    let dataset = &report.datasets[0];
    assert_eq!(dataset.name, "gate sweep G1");
    assert_eq!(dataset.len(), 5);
    assert_eq!(
        floats(&dataset.column("G1 voltage").unwrap().values),
        vec![0.0, 0.25, 0.5, 0.75, 1.0]
    );
    assert_eq!(
        floats(&dataset.column("DMM current").unwrap().values),
        vec![1e-9; 5]
    );

    // Static gate held, swept gate back at its start after reset
    assert_eq!(bench.bias_gate.value(), ParameterValue::Float(0.5));
    assert_eq!(bench.sweep_gate.value(), ParameterValue::Float(0.0));
    assert_eq!(measurement.engine_state(), EngineState::Ready);

    let snapshot = metadata.snapshot();
    assert!(snapshot.datetime.is_some());
    assert_eq!(snapshot.data_records.len(), 1);
    assert_eq!(snapshot.script.as_deref(), Some("Sweep1D"));
    assert_eq!(metadata.save_count(), 1);
}

#[tokio::test]
async fn channels_are_relabelled_after_initialize() {
    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("labels", bench.store);

    measurement.initialize().await.unwrap();

    assert_eq!(bench.sweep_gate.label(), "G1 voltage");
    assert_eq!(bench.bias_gate.label(), "G2 voltage");
    assert_eq!(bench.dmm.label(), "DMM current");
}

#[tokio::test]
async fn integer_static_value_is_ramped_not_jumped() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "static", "value": 1}},
        "DMM": {"current": {"type": "gettable"}}
    }));
    let mut measurement = Measurement::new("gentle", Arc::new(InMemoryMetadata::default()));
    measurement
        .setup(
            bench.store,
            SetupOptions {
                settings: MeasurementSettings {
                    ramp_rate: 100.0,
                    setpoint_interval: 0.001,
                    ..instant_settings()
                },
                ..Default::default()
            },
        )
        .unwrap();

    measurement.initialize().await.unwrap();

    let history = bench.bias_gate.history();
    assert!(history.len() > 1, "static gate jumped: {history:?}");
    assert!(floats(&history).windows(2).all(|w| w[0] < w[1]));
    assert_eq!(bench.bias_gate.value(), ParameterValue::Float(1.0));
}

#[tokio::test]
async fn idle_dynamic_parameters_are_logged() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 3}},
        "G2": {"voltage": {"type": "dynamic", "value": 0.2, "setpoints": [0.2, 0.4]}},
        "DMM": {"current": {"type": "gettable"}}
    }));
    let (mut measurement, _) = measurement("two gates", bench.store);

    let report = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert_eq!(report.datasets.len(), 2);
    let first = &report.datasets[0];
    assert_eq!(first.name, "two gates G1");
    assert_eq!(
        floats(&first.column("G2 voltage").unwrap().values),
        vec![0.2; 3]
    );
    let second = &report.datasets[1];
    assert_eq!(second.name, "two gates G2");
    assert_eq!(
        floats(&second.column("G2 voltage").unwrap().values),
        vec![0.2, 0.4]
    );
    assert_eq!(
        floats(&second.column("G1 voltage").unwrap().values),
        vec![0.0; 2]
    );
}

#[tokio::test]
async fn break_condition_ends_sweep_early() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "DMM": {"current": {"type": "gettable", "break_conditions": ["val > 1.5"]}}
    }));
    bench.dmm.set_value_silently(2.0);
    let (mut measurement, _) = measurement("breaking", bench.store);

    let report = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap();

    let dataset = &report.datasets[0];
    assert_eq!(dataset.len(), 1);
    assert_eq!(floats(&dataset.column("G1 voltage").unwrap().values), vec![0.0]);
}

#[tokio::test]
async fn gettable_wins_over_dynamic() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "DMM": {"current": {"type": "gettable dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}}
    }));
    let (mut measurement, _) = measurement("dispatch", bench.store);

    measurement.initialize().await.unwrap();

    let state = measurement.state().unwrap();
    assert_eq!(state.sweeps.len(), 1);
    assert_eq!(state.gettable_parameters, vec![ParameterId::new("DMM", "current")]);
    assert!(bench.dmm.history().is_empty());
}

#[tokio::test]
async fn disabled_hooks_leave_metadata_untouched() {
    let bench = bench(standard_parameters());
    let (mut measurement, metadata) = measurement("quiet", bench.store);
    let switches = HookSwitches::all_enabled()
        .disable("add_datetime_to_metadata")
        .disable("insert_metadata_into_db");

    measurement.run(&Sweep1D, &switches).await.unwrap();

    let snapshot = metadata.snapshot();
    assert!(snapshot.datetime.is_none());
    assert_eq!(snapshot.data_records.len(), 1);
    assert_eq!(metadata.save_count(), 0);
}

// =============================================================================
// ParallelSweep1D
// =============================================================================

fn two_gate_parameters() -> serde_json::Value {
    json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "dynamic", "start": 1.0, "stop": 0.0, "num_points": 5}},
        "DMM": {"current": {"type": "gettable"}}
    })
}

#[tokio::test]
async fn parallel_sweep_steps_gates_together_on_first_setpoints() {
    let bench = bench(two_gate_parameters());
    bench.dmm.set_value_silently(3e-9);
    let (mut measurement, _) = measurement("parallel", bench.store);

    let report = measurement
        .run(&ParallelSweep1D::new(), &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert_eq!(report.datasets.len(), 1);
    let dataset = &report.datasets[0];
    assert_eq!(dataset.name, "parallel");
    let expected = vec![0.0, 0.25, 0.5, 0.75, 1.0];
    assert_eq!(floats(&dataset.column("G1 voltage").unwrap().values), expected);
    assert_eq!(floats(&dataset.column("G2 voltage").unwrap().values), expected);
    assert_eq!(
        floats(&dataset.column("DMM current").unwrap().values),
        vec![3e-9; 5]
    );

    // Both gates back at their start after reset
    assert_eq!(bench.sweep_gate.value(), ParameterValue::Float(0.0));
    assert_eq!(bench.bias_gate.value(), ParameterValue::Float(1.0));
}

#[tokio::test]
async fn parallel_sweep_per_channel_follows_own_setpoints() {
    let bench = bench(two_gate_parameters());
    let (mut measurement, _) = measurement("parallel", bench.store);

    let report = measurement
        .run(&ParallelSweep1D::per_channel(), &HookSwitches::all_enabled())
        .await
        .unwrap();

    let dataset = &report.datasets[0];
    assert_eq!(
        floats(&dataset.column("G2 voltage").unwrap().values),
        vec![1.0, 0.75, 0.5, 0.25, 0.0]
    );
}

#[tokio::test]
async fn parallel_sweep_per_channel_rejects_uneven_lengths() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "dynamic", "setpoints": [0.2, 0.4]}},
        "DMM": {"current": {"type": "gettable"}}
    }));
    let (mut measurement, _) = measurement("uneven", bench.store);

    let err = measurement
        .run(&ParallelSweep1D::per_channel(), &HookSwitches::all_enabled())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(measurement.engine_state(), EngineState::Ready);
}

#[tokio::test]
async fn parallel_sweep_honours_break_conditions() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "start": 0.0, "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "dynamic", "start": 1.0, "stop": 0.0, "num_points": 5}},
        "DMM": {"current": {"type": "gettable", "break_conditions": ["val > 1.5"]}}
    }));
    bench.dmm.set_value_silently(2.0);
    let (mut measurement, _) = measurement("breaking", bench.store);

    let report = measurement
        .run(&ParallelSweep1D::new(), &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert_eq!(report.datasets[0].len(), 1);
}

// =============================================================================
// Timetrace
// =============================================================================

#[tokio::test]
async fn timetrace_records_at_each_timestep() {
    let bench = bench(standard_parameters());
    bench.dmm.set_value_silently(1e-9);
    let (mut measurement, _) = measurement("trace", bench.store);
    let routine = Timetrace::new(Duration::from_millis(60), Duration::from_millis(10));

    let report = measurement
        .run(&routine, &HookSwitches::all_enabled())
        .await
        .unwrap();

    let dataset = &report.datasets[0];
    assert_eq!(dataset.name, "trace");
    let times = floats(&dataset.column(TIME_COLUMN).unwrap().values);
    assert!(times.len() >= 2, "only {} rows", times.len());
    assert!(times.len() <= 7, "{} rows in 60ms", times.len());
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(*times.last().unwrap() <= 0.06);

    let current = floats(&dataset.column("DMM current").unwrap().values);
    assert_eq!(current, vec![1e-9; times.len()]);
    // The dynamic gate is recorded but not moved
    assert_eq!(
        floats(&dataset.column("G1 voltage").unwrap().values),
        vec![0.0; times.len()]
    );
}

#[tokio::test]
async fn timetrace_rejects_zero_timestep() {
    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("trace", bench.store);

    let err = measurement
        .run(
            &Timetrace::new(Duration::from_millis(10), Duration::ZERO),
            &HookSwitches::all_enabled(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn timetrace_defaults_to_five_minutes_at_one_hertz() {
    let routine = Timetrace::default();
    assert_eq!(routine.duration, Duration::from_secs(300));
    assert_eq!(routine.timestep, Duration::from_secs(1));
}

// =============================================================================
// Errors and state machine
// =============================================================================

#[tokio::test]
async fn unbufferable_gettable_fails_before_hardware_is_touched() {
    use gate_daq::experiment::BufferedSweep1D;
    use gate_daq::config::BufferSettings;

    let bench = bench(standard_parameters());
    let mut measurement = Measurement::new("buffered", Arc::new(InMemoryMetadata::default()));
    measurement
        .setup(
            bench.store,
            SetupOptions {
                settings: instant_settings(),
                buffer_settings: BufferSettings {
                    num_points: Some(10),
                    duration: Some(0.01),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

    let err = measurement
        .run(&BufferedSweep1D::new(), &HookSwitches::all_enabled())
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::NotBufferable(_)));
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(bench.sweep_gate.history().is_empty());
    assert!(bench.bias_gate.history().is_empty());
    assert_eq!(measurement.engine_state(), EngineState::Uninitialized);
}

#[tokio::test]
async fn missing_initial_setpoint_is_a_configuration_error() {
    let bench = bench(json!({
        "G1": {"voltage": {"type": "dynamic", "stop": 1.0, "num_points": 5}},
        "G2": {"voltage": {"type": "static", "value": 0.5}},
        "DMM": {"current": {"type": "gettable"}}
    }));
    let (mut measurement, _) = measurement("no start", bench.store);

    let err = measurement.initialize().await.unwrap_err();

    assert!(matches!(err, DaqError::MissingInitialSetpoint(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(bench.bias_gate.history().is_empty());
}

#[tokio::test]
async fn failing_hook_is_reported_and_run_continues() {
    use gate_daq::experiment::{HookChain, LifecycleHook};
    use gate_daq::experiment::hooks::HookContext;

    struct Broken;

    impl LifecycleHook for Broken {
        fn switch(&self) -> &'static str {
            "broken"
        }

        fn run(&self, _ctx: &HookContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("database unreachable")
        }
    }

    let bench = bench(standard_parameters());
    let (measurement, metadata) = measurement("hooks", bench.store);
    let mut measurement = measurement.with_hooks(HookChain::standard().with(Box::new(Broken)));

    let report = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.datasets.len(), 1);
    assert_eq!(metadata.save_count(), 1);
}

#[tokio::test]
async fn failing_channel_aborts_run_and_returns_to_ready() {
    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("faulty", bench.store);
    measurement.initialize().await.unwrap();
    bench.sweep_gate.fail_sets("overvoltage");

    let err = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Instrument(_)));
    assert_eq!(measurement.engine_state(), EngineState::Uninitialized);
}

#[tokio::test]
async fn unrepresentable_wait_time_is_a_configuration_error() {
    let bench = bench(standard_parameters());
    let mut measurement = Measurement::new("forever", Arc::new(InMemoryMetadata::default()));
    measurement
        .setup(
            bench.store,
            SetupOptions {
                settings: MeasurementSettings {
                    wait_time: f64::INFINITY,
                    ..instant_settings()
                },
                ..Default::default()
            },
        )
        .unwrap();

    let err = measurement
        .run(&Sweep1D, &HookSwitches::all_enabled())
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::Configuration(_)));
    assert_eq!(measurement.engine_state(), EngineState::Ready);
}

#[tokio::test]
async fn reset_restores_initial_values() {
    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("reset", bench.store);
    measurement.initialize().await.unwrap();

    bench.sweep_gate.set(ParameterValue::Float(0.8)).await.unwrap();
    bench.bias_gate.set(ParameterValue::Float(0.1)).await.unwrap();
    measurement.reset().await.unwrap();

    assert_eq!(bench.sweep_gate.value(), ParameterValue::Float(0.0));
    assert_eq!(bench.bias_gate.value(), ParameterValue::Float(0.5));
    assert_eq!(measurement.engine_state(), EngineState::Ready);
}

#[tokio::test]
async fn reinitializing_a_ready_measurement_is_allowed() {
    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("twice", bench.store);

    measurement.initialize().await.unwrap();
    measurement.initialize().await.unwrap();

    assert_eq!(measurement.engine_state(), EngineState::Ready);
    assert_eq!(measurement.state().unwrap().sweeps.len(), 1);
}

#[tokio::test]
async fn initialize_is_refused_while_running() {
    use async_trait::async_trait;
    use gate_daq::data::Dataset;
    use gate_daq::experiment::MeasurementScript;
    use gate_daq::AppResult;

    struct Reentrant;

    #[async_trait]
    impl MeasurementScript for Reentrant {
        fn name(&self) -> &str {
            "Reentrant"
        }

        async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
            let err = measurement.initialize().await.unwrap_err();
            assert!(matches!(err, DaqError::InvalidState { .. }));
            assert_eq!(err.kind(), ErrorKind::State);

            // Resetting mid-run keeps the engine running
            measurement.reset().await?;
            assert_eq!(measurement.engine_state(), EngineState::Running);
            Ok(Vec::new())
        }
    }

    let bench = bench(standard_parameters());
    let (mut measurement, _) = measurement("reentrant", bench.store);

    let report = measurement
        .run(&Reentrant, &HookSwitches::all_enabled())
        .await
        .unwrap();

    assert!(report.datasets.is_empty());
    assert_eq!(measurement.engine_state(), EngineState::Ready);
}
