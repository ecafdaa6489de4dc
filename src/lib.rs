//! # gate_daq
//!
//! Measurement orchestration for gate-based instrumentation. The crate maps
//! experiment gates onto instrument channels, decides which channels are
//! held, swept or recorded, builds the sweep trajectories and coordinates
//! hardware acquisition buffers so a triggered run yields one aligned result
//! set.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based engine configuration, measurement and buffer
//!   settings.
//! - **`core`**: `ParameterValue` and `ParameterId`.
//! - **`data`**: buffer payloads, readout flattening and result datasets.
//! - **`error`**: the `DaqError` enum and `AppResult` alias.
//! - **`experiment`**: classification, sweeps, buffer coordination,
//!   lifecycle hooks, the `Measurement` orchestrator and run routines.
//! - **`hardware`**: `Channel`, `Instrument` and `Buffer` capability traits,
//!   ramping, and mock devices.
//! - **`logging`**: tracing subscriber setup.
//! - **`metadata`**: provenance records and the `MetadataStore` interface.
//! - **`parameter`**: gate parameters, roles and the `ParameterStore`.

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod metadata;
pub mod parameter;

pub use crate::core::{ParameterId, ParameterValue};
pub use crate::error::{AppResult, DaqError, ErrorKind};
