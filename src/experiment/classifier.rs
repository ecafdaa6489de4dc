//! Parameter classification.
//!
//! Classification turns the declared gate parameters into the derived
//! measurement state: which channels are held static, which are swept and
//! which are recorded, the sweep trajectories, and the buffers to arm.
//!
//! It runs in two passes. [`ParameterClassifier::plan`] touches no hardware
//! and fails on every configuration or capability problem it can detect.
//! [`ClassificationPlan::apply`] then moves channels to their initial values,
//! subscribes gettable channels to their buffers and relabels channels. A
//! bad configuration therefore never leaves hardware half-positioned.
//!
//! Role dispatch per parameter, in declaration order:
//! - `static` is checked on its own: the channel goes to `value`
//! - `gettable` is checked next and wins over `dynamic`
//! - otherwise `dynamic`: the channel goes to its initial setpoint
//!   (`value`, else `start`, else `setpoints[0]`) and a sweep is built

use std::fmt;
use tracing::{debug, info};

use crate::core::{ParameterId, ParameterValue};
use crate::error::{AppResult, DaqError};
use crate::experiment::buffers::BufferCoordinator;
use crate::experiment::sweep::{Sweep, SweepBuilder};
use crate::hardware::{ramp_or_set, RampSettings, SharedChannel};
use crate::parameter::{BreakCondition, GateParameter, ParameterStore, Role};

/// A break condition bound to the channel it watches.
#[derive(Clone)]
pub struct ChannelBreak {
    /// The gettable parameter the condition belongs to
    pub parameter: ParameterId,
    /// Channel read to evaluate the condition
    pub channel: SharedChannel,
    /// Parsed condition
    pub condition: BreakCondition,
}

impl fmt::Debug for ChannelBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.parameter, self.channel.id(), self.condition)
    }
}

/// Derived state of an initialized measurement.
#[derive(Debug, Default)]
pub struct MeasurementState {
    /// Parameters set once and held
    pub static_parameters: Vec<ParameterId>,
    /// Parameters swept by the routine
    pub dynamic_parameters: Vec<ParameterId>,
    /// Parameters recorded at every point
    pub gettable_parameters: Vec<ParameterId>,
    /// Dynamic channels with their parameters
    pub dynamic_channels: Vec<SharedChannelRef>,
    /// Gettable channels with their parameters
    pub gettable_channels: Vec<SharedChannelRef>,
    /// Break conditions of every gettable
    pub break_conditions: Vec<ChannelBreak>,
    /// One trajectory per dynamic parameter
    pub sweeps: Vec<Sweep>,
    /// Buffers behind the gettable channels
    pub buffers: BufferCoordinator,
}

/// A channel together with the parameter it was classified under.
#[derive(Clone)]
pub struct SharedChannelRef {
    /// Parameter the channel was classified under
    pub parameter: ParameterId,
    /// The mapped channel
    pub channel: SharedChannel,
}

impl fmt::Debug for SharedChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.parameter, self.channel.id())
    }
}

impl MeasurementState {
    /// Channels of the gettable parameters, in classification order.
    pub fn gettable_channel_handles(&self) -> Vec<SharedChannel> {
        self.gettable_channels.iter().map(|c| c.channel.clone()).collect()
    }

    /// Channels of the dynamic parameters, in classification order.
    pub fn dynamic_channel_handles(&self) -> Vec<SharedChannel> {
        self.dynamic_channels.iter().map(|c| c.channel.clone()).collect()
    }

    /// Evaluate every break condition against its channel's current value.
    ///
    /// Returns the first condition that holds.
    pub async fn triggered_break(&self) -> AppResult<Option<&ChannelBreak>> {
        for entry in &self.break_conditions {
            let value = entry.channel.get().await?;
            if let Some(v) = value.as_f64() {
                if entry.condition.is_met(v) {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }
}

#[derive(Clone)]
struct Positioning {
    parameter: ParameterId,
    channel: SharedChannel,
    target: ParameterValue,
}

/// Result of the planning pass; nothing has been sent to hardware yet.
pub struct ClassificationPlan {
    state: MeasurementState,
    positioning: Vec<Positioning>,
    buffered: bool,
}

impl ClassificationPlan {
    /// Derived state the plan will produce.
    pub fn state(&self) -> &MeasurementState {
        &self.state
    }

    /// Position channels, subscribe gettables (buffered mode) and relabel.
    pub async fn apply(
        mut self,
        store: &ParameterStore,
        ramp: &RampSettings,
    ) -> AppResult<MeasurementState> {
        for step in &self.positioning {
            debug!(parameter = %step.parameter, target = %step.target, "Positioning");
            ramp_or_set(step.channel.as_ref(), &step.target, ramp).await?;
        }

        relabel(store);

        let gettables = self.state.gettable_channel_handles();
        if self.buffered {
            self.state.buffers.subscribe(&gettables).await?;
        } else {
            self.state.buffers.refresh_labels(&gettables);
        }

        info!(
            statics = self.state.static_parameters.len(),
            dynamics = self.state.dynamic_parameters.len(),
            gettables = self.state.gettable_parameters.len(),
            buffers = self.state.buffers.len(),
            "Measurement initialized"
        );
        Ok(self.state)
    }
}

/// Plans classification of a parameter store.
pub struct ParameterClassifier<'a> {
    store: &'a ParameterStore,
    sweeps: SweepBuilder,
}

impl<'a> ParameterClassifier<'a> {
    /// Classifier over `store`, building trajectories with `sweeps`.
    pub fn new(store: &'a ParameterStore, sweeps: SweepBuilder) -> Self {
        Self { store, sweeps }
    }

    /// Classify every parameter without touching hardware.
    pub fn plan(&self) -> AppResult<ClassificationPlan> {
        let mut state = MeasurementState::default();
        let mut positioning = Vec::new();

        for parameter in self.store.iter() {
            let channel = bound_channel(parameter)?;
            let spec = &parameter.spec;
            let id = &parameter.id;

            if spec.is(Role::Static) {
                positioning.push(Positioning {
                    parameter: id.clone(),
                    channel: channel.clone(),
                    target: static_value(parameter)?,
                });
                state.static_parameters.push(id.clone());
            }

            if spec.is(Role::Gettable) {
                state.gettable_parameters.push(id.clone());
                state.gettable_channels.push(SharedChannelRef {
                    parameter: id.clone(),
                    channel: channel.clone(),
                });
                state
                    .break_conditions
                    .extend(spec.break_conditions.iter().map(|condition| ChannelBreak {
                        parameter: id.clone(),
                        channel: channel.clone(),
                        condition: condition.clone(),
                    }));
            } else if spec.is(Role::Dynamic) {
                let target = spec
                    .initial_setpoint()
                    .ok_or_else(|| DaqError::MissingInitialSetpoint(id.to_string()))?;
                positioning.push(Positioning {
                    parameter: id.clone(),
                    channel: channel.clone(),
                    target,
                });
                state.dynamic_parameters.push(id.clone());
                state.dynamic_channels.push(SharedChannelRef {
                    parameter: id.clone(),
                    channel: channel.clone(),
                });
                state.sweeps.push(self.sweeps.build(id, spec, channel)?);
            }
        }

        if self.sweeps.is_buffered() {
            state.buffers = BufferCoordinator::collect(&state.gettable_channel_handles())?;
        }

        Ok(ClassificationPlan {
            state,
            positioning,
            buffered: self.sweeps.is_buffered(),
        })
    }
}

/// Move static and dynamic channels back to their initial values.
///
/// Uses the partitions of an existing state; nothing is re-classified and no
/// subscriptions change.
pub async fn reset_channels(
    store: &ParameterStore,
    state: &MeasurementState,
    ramp: &RampSettings,
) -> AppResult<()> {
    for parameter in store.iter() {
        let id = &parameter.id;
        if state.static_parameters.contains(id) {
            ramp_or_set(bound_channel(parameter)?.as_ref(), &static_value(parameter)?, ramp).await?;
        }
        if state.dynamic_parameters.contains(id) {
            let target = parameter
                .spec
                .initial_setpoint()
                .ok_or_else(|| DaqError::MissingInitialSetpoint(id.to_string()))?;
            ramp_or_set(bound_channel(parameter)?.as_ref(), &target, ramp).await?;
        }
    }
    Ok(())
}

/// Label every mapped channel `"{gate} {parameter}"`.
pub fn relabel(store: &ParameterStore) {
    for parameter in store.iter() {
        if let Some(channel) = &parameter.channel {
            channel.set_label(&parameter.id.to_string());
        }
    }
}

fn bound_channel(parameter: &GateParameter) -> AppResult<SharedChannel> {
    parameter.channel.clone().ok_or_else(|| {
        DaqError::MalformedGateMapping(format!("'{}' is not mapped to a channel", parameter.id))
    })
}

fn static_value(parameter: &GateParameter) -> AppResult<ParameterValue> {
    parameter.spec.value.clone().ok_or_else(|| {
        DaqError::Configuration(format!(
            "Static parameter '{}' has no value",
            parameter.id
        ))
    })
}
