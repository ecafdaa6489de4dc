//! Measurement orchestration.
//!
//! - [`classifier`]: role dispatch and initial positioning
//! - [`sweep`]: setpoint trajectories and buffered point counts
//! - [`buffers`]: arming and reading out acquisition buffers
//! - [`hooks`]: provenance hooks run before a routine
//! - [`measurement`]: the orchestrator and the script trait
//! - [`routines`]: ready-made sweep and timetrace routines
//! - [`state`]: the engine state machine

pub mod buffers;
pub mod classifier;
pub mod hooks;
pub mod measurement;
pub mod routines;
pub mod state;
pub mod sweep;

pub use buffers::BufferCoordinator;
pub use classifier::{ClassificationPlan, MeasurementState, ParameterClassifier};
pub use hooks::{HookChain, HookSwitches, InstrumentationWarning, LifecycleHook};
pub use measurement::{Measurement, MeasurementScript, RunReport, SetupOptions};
pub use routines::{
    BufferedHysteresisSweep1D, BufferedSweep1D, ParallelSweep1D, Sweep1D, Timetrace, TIME_COLUMN,
};
pub use state::EngineState;
pub use sweep::{linspace, resolve_buffered_num_points, Sweep, SweepBuilder};
