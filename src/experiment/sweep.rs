//! Sweep trajectories.
//!
//! Every dynamic parameter is turned into a [`Sweep`]: an ordered list of
//! setpoints for one channel plus the delay to wait after each point.
//!
//! In buffered mode every sweep must line up with the buffer samples, so all
//! of them use the same global point count resolved from the buffer
//! settings by [`resolve_buffered_num_points`]. In unbuffered mode each
//! parameter brings its own `num_points` or explicit setpoints.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BufferSettings;
use crate::core::ParameterId;
use crate::error::{AppResult, DaqError};
use crate::hardware::SharedChannel;
use crate::parameter::PropertySpec;

/// `n` evenly spaced values from `start` to `stop`, both included.
///
/// ```
/// use gate_daq::experiment::sweep::linspace;
///
/// assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
/// assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
/// ```
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i == n - 1 {
                        stop
                    } else {
                        start + step * i as f64
                    }
                })
                .collect()
        }
    }
}

/// Number of points every buffered sweep must have.
///
/// - `num_points` with `sampling_rate` or `burst_duration`:
///   [`DaqError::OverdeterminedBufferSpec`]
/// - `num_points` alone: that count
/// - `sampling_rate` and `burst_duration`: `ceil(sampling_rate * burst_duration)`
/// - anything else: `None`; building a buffered sweep then fails
pub fn resolve_buffered_num_points(settings: &BufferSettings) -> AppResult<Option<usize>> {
    match (
        settings.num_points,
        settings.sampling_rate,
        settings.burst_duration,
    ) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(DaqError::OverdeterminedBufferSpec),
        (Some(0), None, None) => Err(DaqError::Configuration(
            "Buffer num_points must be at least 1".to_string(),
        )),
        (Some(n), None, None) => Ok(Some(n)),
        (None, Some(rate), Some(duration)) => {
            let points = (rate * duration).ceil();
            if !points.is_finite() || points < 1.0 {
                return Err(DaqError::Configuration(format!(
                    "sampling_rate {rate} and burst_duration {duration} give no samples"
                )));
            }
            Ok(Some(points as usize))
        }
        (None, _, _) => Ok(None),
    }
}

/// Async action run after every setpoint of a sweep.
pub type PostAction = Arc<dyn Fn(usize, f64) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// One dynamic parameter's trajectory.
#[derive(Clone)]
pub struct Sweep {
    /// Swept parameter
    pub parameter: ParameterId,
    /// Channel the setpoints are written to
    pub channel: SharedChannel,
    /// Setpoints in sweep order
    pub setpoints: Vec<f64>,
    /// Wait after each setpoint
    pub delay: Duration,
    /// Run after each setpoint, in order
    pub post_actions: Vec<PostAction>,
}

impl Sweep {
    /// Number of setpoints.
    pub fn num_points(&self) -> usize {
        self.setpoints.len()
    }

    /// Run `action(index, setpoint)` after each point.
    pub fn with_post_action(mut self, action: PostAction) -> Self {
        self.post_actions.push(action);
        self
    }

    /// Run every post-action for point `index`.
    pub async fn run_post_actions(&self, index: usize, setpoint: f64) -> AppResult<()> {
        for action in &self.post_actions {
            action(index, setpoint).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweep")
            .field("parameter", &self.parameter)
            .field("channel", &self.channel.id())
            .field("setpoints", &self.setpoints)
            .field("delay", &self.delay)
            .field("post_actions", &self.post_actions.len())
            .finish()
    }
}

/// Builds sweeps for one measurement.
#[derive(Debug, Clone, Copy)]
pub struct SweepBuilder {
    buffered: bool,
    buffered_num_points: Option<usize>,
}

impl SweepBuilder {
    /// Point-by-point sweeps with per-parameter point counts.
    pub fn unbuffered() -> Self {
        Self {
            buffered: false,
            buffered_num_points: None,
        }
    }

    /// Buffered sweeps use `num_points` from [`resolve_buffered_num_points`].
    pub fn buffered(num_points: Option<usize>) -> Self {
        Self {
            buffered: true,
            buffered_num_points: num_points,
        }
    }

    /// Whether buffered trajectories are built.
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Trajectory for `parameter`, written to `channel`.
    pub fn build(
        &self,
        parameter: &ParameterId,
        spec: &PropertySpec,
        channel: SharedChannel,
    ) -> AppResult<Sweep> {
        let (setpoints, delay) = if self.buffered {
            (self.buffered_setpoints(parameter, spec)?, spec.delay.unwrap_or(0.0))
        } else {
            Self::unbuffered_setpoints(parameter, spec)?
        };
        let delay = Duration::try_from_secs_f64(delay).map_err(|_| {
            DaqError::Configuration(format!("Invalid delay {delay} for '{parameter}'"))
        })?;

        Ok(Sweep {
            parameter: parameter.clone(),
            channel,
            setpoints,
            delay,
            post_actions: Vec::new(),
        })
    }

    fn buffered_setpoints(&self, parameter: &ParameterId, spec: &PropertySpec) -> AppResult<Vec<f64>> {
        let num_points = self
            .buffered_num_points
            .ok_or(DaqError::UnderdeterminedBufferSpec)?;
        let endpoints = match (spec.start, spec.stop, spec.setpoints.as_deref()) {
            (Some(start), Some(stop), _) => Some((start, stop)),
            (_, _, Some([first, .., last])) => Some((*first, *last)),
            (_, _, Some([only])) => Some((*only, *only)),
            _ => None,
        };
        let (start, stop) = endpoints.ok_or_else(|| {
            DaqError::Configuration(format!(
                "Buffered sweep of '{parameter}' needs start/stop or setpoints"
            ))
        })?;
        Ok(linspace(start, stop, num_points))
    }

    fn unbuffered_setpoints(parameter: &ParameterId, spec: &PropertySpec) -> AppResult<(Vec<f64>, f64)> {
        match (spec.start, spec.stop, spec.num_points, spec.setpoints.as_ref()) {
            (Some(start), Some(stop), Some(n), _) if n > 0 => {
                Ok((linspace(start, stop, n), spec.delay.unwrap_or(0.0)))
            }
            (_, _, _, Some(setpoints)) if !setpoints.is_empty() => {
                Ok((setpoints.clone(), spec.delay.unwrap_or(0.0)))
            }
            _ => Err(DaqError::Configuration(format!(
                "Sweep of '{parameter}' needs start, stop and num_points, or setpoints"
            ))),
        }
    }
}
