//! Ramping channels to setpoints.
//!
//! Gate voltages must not jump. [`ramp_or_set`] walks a numeric channel to
//! its target in small steps at a bounded rate; anything that is not a
//! number is simply set.
//!
//! [`RampHandle`] runs a trajectory on a background tokio task so buffered
//! sweeps can ramp several channels at once while the buffers record. The
//! handle can be joined or cancelled; cancellation is cooperative and is
//! checked between steps and while waiting for a trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{seconds, MeasurementSettings};
use crate::core::ParameterValue;
use crate::error::{AppResult, DaqError};
use crate::experiment::sweep::linspace;
use crate::hardware::capabilities::{Channel, SharedChannel};

/// Rate limits applied while ramping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSettings {
    /// Channel units per second
    pub rate: f64,
    /// A ramp never takes longer than this
    pub max_duration: Duration,
    /// Delay between consecutive set commands
    pub interval: Duration,
}

impl RampSettings {
    /// Ramp limits from measurement settings.
    ///
    /// Fails if `ramp_time` or `setpoint_interval` does not fit a [`Duration`].
    pub fn from_measurement(settings: &MeasurementSettings) -> AppResult<Self> {
        Ok(Self {
            rate: settings.ramp_rate,
            max_duration: seconds("ramp_time", settings.ramp_time)?,
            interval: seconds("setpoint_interval", settings.setpoint_interval)?,
        })
    }

    /// Intermediate setpoints from `current` to `target`, excluding `current`.
    pub fn schedule(&self, current: f64, target: f64) -> Vec<f64> {
        let distance = (target - current).abs();
        if distance == 0.0 {
            return vec![target];
        }
        let interval = self.interval.as_secs_f64();
        let duration = if self.rate > 0.0 {
            (distance / self.rate).min(self.max_duration.as_secs_f64())
        } else {
            self.max_duration.as_secs_f64()
        };
        let steps = if interval > 0.0 {
            ((duration / interval).ceil() as usize).max(1)
        } else {
            1
        };
        linspace(current, target, steps + 1).into_iter().skip(1).collect()
    }
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            rate: 0.3,
            max_duration: Duration::from_secs(5),
            interval: Duration::from_millis(100),
        }
    }
}

fn numeric(value: &ParameterValue) -> Option<f64> {
    match value {
        ParameterValue::Float(f) => Some(*f),
        ParameterValue::Int(i) => Some(*i as f64),
        _ => None,
    }
}

/// Ramp a numeric channel to `target`, or set it directly otherwise.
///
/// Integer targets and readings count as numeric; the ramp writes floats,
/// so the channel ends at the target as a float.
pub async fn ramp_or_set(
    channel: &dyn Channel,
    target: &ParameterValue,
    settings: &RampSettings,
) -> AppResult<()> {
    let Some(target_value) = numeric(target) else {
        return channel.set(target.clone()).await;
    };
    let Some(current) = numeric(&channel.get().await?) else {
        return channel.set(target.clone()).await;
    };

    let schedule = settings.schedule(current, target_value);
    debug!(
        channel = channel.id(),
        from = current,
        to = target_value,
        steps = schedule.len(),
        "Ramping"
    );
    let last = schedule.len().saturating_sub(1);
    for (i, value) in schedule.into_iter().enumerate() {
        channel.set(ParameterValue::Float(value)).await?;
        if i < last {
            tokio::time::sleep(settings.interval).await;
        }
    }
    Ok(())
}

/// A one-shot start signal shared by any number of background ramps.
#[derive(Debug, Clone)]
pub struct TriggerSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl TriggerSignal {
    /// An unfired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Release every ramp waiting on this signal, including later ones.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for TriggerSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How a background ramp ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampOutcome {
    /// Every setpoint was written
    Completed,
    /// Stopped by [`RampHandle::cancel`] or a dropped trigger
    Cancelled,
}

/// Handle to a ramp running on a background task.
///
/// Dropping the handle cancels the ramp.
pub struct RampHandle {
    channel_id: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<AppResult<RampOutcome>>,
}

impl RampHandle {
    /// Step `channel` through `setpoints`, waiting `step_delay` after each.
    ///
    /// With a trigger the ramp waits for it before the first step. There is
    /// no timeout on that wait; use [`RampHandle::cancel`] to abandon it.
    pub fn spawn(
        channel: SharedChannel,
        setpoints: Vec<f64>,
        step_delay: Duration,
        trigger: Option<TriggerSignal>,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let channel_id = channel.id().to_string();
        let task = tokio::spawn(run_ramp(
            channel,
            setpoints,
            step_delay,
            trigger,
            cancel_rx,
        ));
        Self {
            channel_id,
            cancel,
            task,
        }
    }

    /// Ramp over `duration` in equal steps, as a buffered sweep does.
    pub fn spawn_over(
        channel: SharedChannel,
        setpoints: Vec<f64>,
        duration: Duration,
        trigger: Option<TriggerSignal>,
    ) -> Self {
        let step_delay = if setpoints.is_empty() {
            Duration::ZERO
        } else {
            duration / setpoints.len() as u32
        };
        Self::spawn(channel, setpoints, step_delay, trigger)
    }

    /// Id of the channel being ramped.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Ask the ramp to stop at the next step boundary.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the ramp task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the ramp to end.
    pub async fn join(self) -> AppResult<RampOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DaqError::Instrument(format!(
                "Ramp task for '{}' failed: {}",
                self.channel_id, e
            ))),
        }
    }
}

async fn run_ramp(
    channel: SharedChannel,
    setpoints: Vec<f64>,
    step_delay: Duration,
    trigger: Option<TriggerSignal>,
    mut cancel: watch::Receiver<bool>,
) -> AppResult<RampOutcome> {
    if let Some(signal) = trigger {
        let mut fired_rx = signal.subscribe();
        tokio::select! {
            fired = fired_rx.wait_for(|fired| *fired) => {
                if fired.is_err() {
                    warn!(channel = channel.id(), "Trigger dropped before firing");
                    return Ok(RampOutcome::Cancelled);
                }
            }
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                return Ok(RampOutcome::Cancelled);
            }
        }
    }

    for value in setpoints {
        if *cancel.borrow() {
            return Ok(RampOutcome::Cancelled);
        }
        channel.set(ParameterValue::Float(value)).await?;
        tokio::select! {
            _ = tokio::time::sleep(step_delay) => {}
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                return Ok(RampOutcome::Cancelled);
            }
        }
    }
    Ok(RampOutcome::Completed)
}
