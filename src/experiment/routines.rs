//! Ready-made measurement routines.
//!
//! - [`Sweep1D`]: sweep each dynamic parameter in turn, point by point,
//!   recording every gettable channel at each setpoint.
//! - [`ParallelSweep1D`]: step every dynamic parameter together and record
//!   one dataset.
//! - [`Timetrace`]: record the gettables at a fixed timestep for a fixed
//!   duration without moving anything.
//! - [`BufferedSweep1D`]: sweep each dynamic parameter as one continuous
//!   ramp while the buffers record, then read the buffers out.
//! - [`BufferedHysteresisSweep1D`]: buffered sweeps that ramp forward and
//!   back several times and concatenate the readouts.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{seconds, TriggerType};
use crate::core::ParameterValue;
use crate::data::{Dataset, ReadoutEntry};
use crate::error::{AppResult, DaqError};
use crate::experiment::measurement::{Measurement, MeasurementScript};
use crate::experiment::sweep::Sweep;
use crate::hardware::{ramp_or_set, RampHandle, TriggerSignal};

/// Column holding the elapsed time of a [`Timetrace`], in seconds.
pub const TIME_COLUMN: &str = "time";

fn dataset_name(measurement: &Measurement, sweep: &Sweep) -> String {
    if measurement.settings().include_gate_name {
        format!("{} {}", measurement.name(), sweep.parameter.gate)
    } else {
        measurement.name().to_string()
    }
}

fn wait_time(measurement: &Measurement) -> AppResult<Duration> {
    seconds("wait_time", measurement.settings().wait_time)
}

/// Point-by-point 1D sweeps of every dynamic parameter.
///
/// Dynamic parameters that are not being swept stay at their initial value
/// and, with `log_idle_params`, are recorded alongside the gettables. A sweep
/// ends early once any break condition holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sweep1D;

#[async_trait]
impl MeasurementScript for Sweep1D {
    fn name(&self) -> &str {
        "Sweep1D"
    }

    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
        let ramp = measurement.ramp_settings();
        let wait_time = wait_time(measurement)?;
        let log_idle = measurement.settings().log_idle_params;
        let state = measurement
            .state()
            .ok_or_else(|| measurement.engine_state().invalid("run Sweep1D"))?;
        let sweeps = state.sweeps.clone();
        let gettables = state.gettable_channel_handles();
        let dynamics = state.dynamic_channel_handles();

        let mut datasets = Vec::with_capacity(sweeps.len());
        for sweep in &sweeps {
            let Some(first) = sweep.setpoints.first() else {
                continue;
            };
            let mut dataset = Dataset::new(dataset_name(measurement, sweep));
            let recorded: Vec<_> = gettables
                .iter()
                .chain(
                    dynamics
                        .iter()
                        .filter(|c| log_idle && c.id() != sweep.channel.id()),
                )
                .cloned()
                .collect();

            ramp_or_set(sweep.channel.as_ref(), &ParameterValue::Float(*first), &ramp).await?;
            tokio::time::sleep(wait_time).await;

            for (index, setpoint) in sweep.setpoints.iter().enumerate() {
                sweep.channel.set(ParameterValue::Float(*setpoint)).await?;
                tokio::time::sleep(sweep.delay).await;
                sweep.run_post_actions(index, *setpoint).await?;

                let mut row = vec![(sweep.channel.label(), ParameterValue::Float(*setpoint))];
                for channel in &recorded {
                    row.push((channel.label(), channel.get().await?));
                }
                dataset.add_result(row);

                let state = measurement
                    .state()
                    .ok_or_else(|| measurement.engine_state().invalid("run Sweep1D"))?;
                if let Some(hit) = state.triggered_break().await? {
                    info!(sweep = %sweep.parameter, condition = ?hit, point = index, "Break condition met");
                    break;
                }
            }

            datasets.push(dataset);
            measurement.reset().await?;
        }
        Ok(datasets)
    }
}

/// Point-by-point sweep of all dynamic parameters at once.
///
/// By default every channel steps through the setpoints of the first sweep.
/// With [`ParallelSweep1D::per_channel`] each channel follows its own
/// setpoints instead; those must all have the same length. The first sweep's
/// delay applies after every point. The result is a single dataset named
/// after the measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelSweep1D {
    /// Step each channel through its own setpoints
    pub per_channel_setpoints: bool,
}

impl ParallelSweep1D {
    /// Every channel follows the first sweep's setpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every channel follows its own setpoints.
    pub fn per_channel() -> Self {
        Self {
            per_channel_setpoints: true,
        }
    }

    fn trajectories(&self, sweeps: &[Sweep]) -> AppResult<Vec<Vec<f64>>> {
        let Some(lead) = sweeps.first() else {
            return Ok(Vec::new());
        };
        let trajectories: Vec<Vec<f64>> = sweeps
            .iter()
            .map(|sweep| {
                if self.per_channel_setpoints {
                    sweep.setpoints.clone()
                } else {
                    lead.setpoints.clone()
                }
            })
            .collect();
        let points = lead.setpoints.len();
        if let Some((sweep, setpoints)) = sweeps
            .iter()
            .zip(&trajectories)
            .find(|(_, setpoints)| setpoints.len() != points)
        {
            return Err(DaqError::Configuration(format!(
                "Parallel sweep of '{}' has {} setpoints, expected {points}",
                sweep.parameter,
                setpoints.len()
            )));
        }
        Ok(trajectories)
    }
}

#[async_trait]
impl MeasurementScript for ParallelSweep1D {
    fn name(&self) -> &str {
        "ParallelSweep1D"
    }

    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
        let ramp = measurement.ramp_settings();
        let wait_time = wait_time(measurement)?;
        let state = measurement
            .state()
            .ok_or_else(|| measurement.engine_state().invalid("run ParallelSweep1D"))?;
        let sweeps = state.sweeps.clone();
        let gettables = state.gettable_channel_handles();
        let trajectories = self.trajectories(&sweeps)?;
        let (Some(lead), Some(points)) = (sweeps.first(), trajectories.first().map(Vec::len))
        else {
            return Ok(Vec::new());
        };

        for (sweep, setpoints) in sweeps.iter().zip(&trajectories) {
            if let Some(first) = setpoints.first() {
                ramp_or_set(sweep.channel.as_ref(), &ParameterValue::Float(*first), &ramp).await?;
            }
        }
        tokio::time::sleep(wait_time).await;

        let mut dataset = Dataset::new(measurement.name());
        for index in 0..points {
            for (sweep, setpoints) in sweeps.iter().zip(&trajectories) {
                sweep.channel.set(ParameterValue::Float(setpoints[index])).await?;
            }
            tokio::time::sleep(lead.delay).await;
            for (sweep, setpoints) in sweeps.iter().zip(&trajectories) {
                sweep.run_post_actions(index, setpoints[index]).await?;
            }

            let mut row: Vec<(String, ParameterValue)> = sweeps
                .iter()
                .zip(&trajectories)
                .map(|(sweep, setpoints)| {
                    (sweep.channel.label(), ParameterValue::Float(setpoints[index]))
                })
                .collect();
            for channel in &gettables {
                row.push((channel.label(), channel.get().await?));
            }
            dataset.add_result(row);

            let state = measurement
                .state()
                .ok_or_else(|| measurement.engine_state().invalid("run ParallelSweep1D"))?;
            if let Some(hit) = state.triggered_break().await? {
                info!(condition = ?hit, point = index, "Break condition met");
                break;
            }
        }

        measurement.reset().await?;
        Ok(vec![dataset])
    }
}

/// Record gettables and dynamic channels over time.
///
/// Nothing is swept. A row is taken every `timestep` until `duration` has
/// elapsed or a break condition holds; the first column is the elapsed time
/// in seconds. Rows that would fall behind schedule are skipped, not
/// bunched up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timetrace {
    /// Total recording time
    pub duration: Duration,
    /// Interval between rows
    pub timestep: Duration,
}

impl Timetrace {
    /// Record for `duration`, one row every `timestep`.
    pub fn new(duration: Duration, timestep: Duration) -> Self {
        Self { duration, timestep }
    }
}

impl Default for Timetrace {
    /// Five minutes at one row per second.
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(1))
    }
}

#[async_trait]
impl MeasurementScript for Timetrace {
    fn name(&self) -> &str {
        "Timetrace"
    }

    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
        if self.timestep.is_zero() {
            return Err(DaqError::Configuration(
                "Timetrace timestep must be positive".to_string(),
            ));
        }
        let state = measurement
            .state()
            .ok_or_else(|| measurement.engine_state().invalid("run Timetrace"))?;
        let recorded: Vec<_> = state
            .gettable_channel_handles()
            .into_iter()
            .chain(state.dynamic_channel_handles())
            .collect();

        let mut dataset = Dataset::new(measurement.name());
        let mut ticker = tokio::time::interval(self.timestep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let start = Instant::now();
        loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            if elapsed > self.duration {
                break;
            }

            let mut row = vec![(
                TIME_COLUMN.to_string(),
                ParameterValue::Float(elapsed.as_secs_f64()),
            )];
            for channel in &recorded {
                row.push((channel.label(), channel.get().await?));
            }
            dataset.add_result(row);

            let state = measurement
                .state()
                .ok_or_else(|| measurement.engine_state().invalid("run Timetrace"))?;
            if let Some(hit) = state.triggered_break().await? {
                info!(condition = ?hit, ?elapsed, "Break condition met");
                break;
            }
        }
        debug!(rows = dataset.len(), "Timetrace finished");
        Ok(vec![dataset])
    }
}

// =============================================================================
// Buffered routines
// =============================================================================

/// Timing shared by the buffered routines.
struct BufferedTiming {
    wait_time: Duration,
    poll_interval: Duration,
    duration: Duration,
    trigger_type: TriggerType,
}

impl BufferedTiming {
    fn from_measurement(measurement: &Measurement) -> AppResult<Self> {
        let buffer_settings = measurement.buffer_settings();
        let duration = buffer_settings.duration.ok_or_else(|| {
            DaqError::Configuration("Buffered sweep needs a buffer duration".to_string())
        })?;
        Ok(Self {
            wait_time: wait_time(measurement)?,
            poll_interval: seconds("poll_interval", measurement.settings().poll_interval)?,
            duration: seconds("duration", duration)?,
            trigger_type: buffer_settings.trigger_type.unwrap_or(TriggerType::Software),
        })
    }
}

/// Arm the buffers, ramp `sweep` through `setpoints` over the buffer
/// duration and read the buffers out.
async fn acquire_during_ramp(
    measurement: &mut Measurement,
    sweep: &Sweep,
    setpoints: Vec<f64>,
    timing: &BufferedTiming,
    manual_trigger: Option<&TriggerSignal>,
) -> AppResult<Vec<ReadoutEntry>> {
    measurement.ready_buffers().await?;

    let ramp_trigger = match timing.trigger_type {
        TriggerType::Software => None,
        TriggerType::Hardware => Some(TriggerSignal::new()),
        TriggerType::Manual => manual_trigger.cloned(),
    };
    let handle = RampHandle::spawn_over(
        sweep.channel.clone(),
        setpoints,
        timing.duration,
        ramp_trigger.clone(),
    );
    debug!(sweep = %sweep.parameter, trigger_type = %timing.trigger_type, "Buffered ramp launched");

    let started = match timing.trigger_type {
        TriggerType::Software => match measurement.state() {
            Some(state) => state.buffers.force_trigger_all().await,
            None => Ok(()),
        },
        TriggerType::Hardware => {
            if let Some(signal) = &ramp_trigger {
                signal.fire();
            }
            Ok(())
        }
        TriggerType::Manual => Ok(()),
    };
    if let Err(e) = started {
        handle.cancel();
        let _ = handle.join().await;
        return Err(e);
    }

    handle.join().await?;
    if let Some(state) = measurement.state() {
        state.buffers.wait_finished(timing.poll_interval).await?;
    }
    measurement.readout_buffers().await
}

fn buffered_sweeps(measurement: &Measurement, routine: &str) -> AppResult<Vec<Sweep>> {
    Ok(measurement
        .state()
        .ok_or_else(|| measurement.engine_state().invalid(&format!("run {routine}")))?
        .sweeps
        .clone())
}

/// Buffered 1D sweeps of every dynamic parameter.
///
/// For each sweep the buffers are armed, the channel is ramped over the
/// configured `duration` on a background task and acquisition is started
/// according to the buffer `trigger_type`:
/// - `software` (default): every buffer is force-triggered
/// - `hardware`: the ramp waits for a trigger signal that the routine fires
///   once the buffers are armed
/// - `manual`: the ramp waits for [`BufferedSweep1D::trigger`] if one is
///   given and the operator fires it; without one the ramp starts immediately
///
/// The routine then waits for every buffer to finish. That wait has no
/// timeout.
#[derive(Debug, Clone, Default)]
pub struct BufferedSweep1D {
    /// Operator trigger for `manual` acquisition
    pub trigger: Option<TriggerSignal>,
}

impl BufferedSweep1D {
    /// Software-triggered unless the buffer settings say otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `trigger` to start `manual` acquisition.
    pub fn with_trigger(trigger: TriggerSignal) -> Self {
        Self {
            trigger: Some(trigger),
        }
    }
}

#[async_trait]
impl MeasurementScript for BufferedSweep1D {
    fn name(&self) -> &str {
        "BufferedSweep1D"
    }

    fn buffered(&self) -> bool {
        true
    }

    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
        let ramp = measurement.ramp_settings();
        let timing = BufferedTiming::from_measurement(measurement)?;
        let sweeps = buffered_sweeps(measurement, self.name())?;

        let mut datasets = Vec::with_capacity(sweeps.len());
        for sweep in &sweeps {
            let Some(first) = sweep.setpoints.first() else {
                continue;
            };
            ramp_or_set(sweep.channel.as_ref(), &ParameterValue::Float(*first), &ramp).await?;
            tokio::time::sleep(timing.wait_time).await;

            let entries = acquire_during_ramp(
                measurement,
                sweep,
                sweep.setpoints.clone(),
                &timing,
                self.trigger.as_ref(),
            )
            .await?;

            let mut dataset = Dataset::new(dataset_name(measurement, sweep));
            dataset.add_readout(
                (sweep.channel.label().as_str(), sweep.setpoints.as_slice()),
                &entries,
            );
            datasets.push(dataset);

            measurement.reset().await?;
        }
        Ok(datasets)
    }
}

/// Buffered sweeps that ramp back and forth.
///
/// Even iterations ramp from the first setpoint to the last, odd iterations
/// ramp back. Every iteration arms and reads the buffers once; the readouts
/// and the matching setpoints are appended to one dataset per sweep.
/// Triggering follows [`BufferedSweep1D`].
#[derive(Debug, Clone)]
pub struct BufferedHysteresisSweep1D {
    /// Number of one-way passes, at least 1
    pub iterations: usize,
    /// Operator trigger for `manual` acquisition; once fired it releases
    /// every later pass as well
    pub trigger: Option<TriggerSignal>,
}

impl BufferedHysteresisSweep1D {
    /// Hysteresis sweep with `iterations` one-way passes.
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            trigger: None,
        }
    }

    /// Use `trigger` to start `manual` acquisition.
    pub fn with_trigger(mut self, trigger: TriggerSignal) -> Self {
        self.trigger = Some(trigger);
        self
    }
}

impl Default for BufferedHysteresisSweep1D {
    /// One pass up and one pass down.
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl MeasurementScript for BufferedHysteresisSweep1D {
    fn name(&self) -> &str {
        "BufferedHysteresisSweep1D"
    }

    fn buffered(&self) -> bool {
        true
    }

    async fn run(&self, measurement: &mut Measurement) -> AppResult<Vec<Dataset>> {
        if self.iterations == 0 {
            return Err(DaqError::Configuration(
                "Hysteresis sweep needs at least one iteration".to_string(),
            ));
        }
        let ramp = measurement.ramp_settings();
        let timing = BufferedTiming::from_measurement(measurement)?;
        let sweeps = buffered_sweeps(measurement, self.name())?;

        let mut datasets = Vec::with_capacity(sweeps.len());
        for sweep in &sweeps {
            let Some(first) = sweep.setpoints.first() else {
                continue;
            };
            let forward = sweep.setpoints.clone();
            let backward: Vec<f64> = forward.iter().rev().copied().collect();

            ramp_or_set(sweep.channel.as_ref(), &ParameterValue::Float(*first), &ramp).await?;
            tokio::time::sleep(timing.wait_time).await;

            let mut dataset = Dataset::new(dataset_name(measurement, sweep));
            for iteration in 0..self.iterations {
                let setpoints = if iteration % 2 == 0 { &forward } else { &backward };
                debug!(sweep = %sweep.parameter, iteration, "Hysteresis pass");
                let entries = acquire_during_ramp(
                    measurement,
                    sweep,
                    setpoints.clone(),
                    &timing,
                    self.trigger.as_ref(),
                )
                .await?;
                dataset.add_readout(
                    (sweep.channel.label().as_str(), setpoints.as_slice()),
                    &entries,
                );
            }
            datasets.push(dataset);

            measurement.reset().await?;
        }
        Ok(datasets)
    }
}
