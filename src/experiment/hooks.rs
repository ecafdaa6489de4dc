//! Lifecycle hooks run before a measurement routine.
//!
//! Hooks record provenance. They are allowed to fail: a failure is logged
//! and reported as an [`InstrumentationWarning`], and the remaining hooks and
//! the routine itself still run.
//!
//! The standard chain runs, in order:
//! 1. `add_datetime_to_metadata`: stamp the measurement datetime if unset
//! 2. `add_data_to_metadata`: register the measurement's data record
//! 3. `insert_metadata_into_db`: persist the metadata
//!
//! Persisting runs last so the stored metadata includes the first two.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::metadata::{DataRecord, MetadataStore};

/// What a hook gets to see.
pub struct HookContext<'a> {
    /// Name of the measurement being run
    pub measurement_name: &'a str,
    /// Store the hooks write provenance into
    pub metadata: &'a dyn MetadataStore,
}

/// One step of the lifecycle chain.
pub trait LifecycleHook: Send + Sync {
    /// Name of the switch that enables this hook
    fn switch(&self) -> &'static str;

    /// Apply the hook. Errors are reported as warnings, never raised.
    fn run(&self, ctx: &HookContext<'_>) -> anyhow::Result<()>;
}

/// Sets the metadata datetime unless one is present.
pub struct AddDatetime;

impl LifecycleHook for AddDatetime {
    fn switch(&self) -> &'static str {
        "add_datetime_to_metadata"
    }

    fn run(&self, ctx: &HookContext<'_>) -> anyhow::Result<()> {
        if !ctx.metadata.set_datetime_if_absent(Utc::now())? {
            debug!("Metadata datetime already set");
        }
        Ok(())
    }
}

/// Adds a data record named after the measurement.
pub struct AddDataRecord;

impl LifecycleHook for AddDataRecord {
    fn switch(&self) -> &'static str {
        "add_data_to_metadata"
    }

    fn run(&self, ctx: &HookContext<'_>) -> anyhow::Result<()> {
        ctx.metadata.add_data_record(DataRecord {
            name: ctx.measurement_name.to_string(),
            created: Utc::now(),
            notes: String::new(),
        })?;
        Ok(())
    }
}

/// Persists the metadata.
pub struct PersistMetadata;

impl LifecycleHook for PersistMetadata {
    fn switch(&self) -> &'static str {
        "insert_metadata_into_db"
    }

    fn run(&self, ctx: &HookContext<'_>) -> anyhow::Result<()> {
        ctx.metadata.save_to_db()?;
        Ok(())
    }
}

/// Per-hook enable switches, all on unless turned off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookSwitches {
    disabled: HashMap<String, bool>,
}

impl HookSwitches {
    /// Every hook enabled.
    pub fn all_enabled() -> Self {
        Self::default()
    }

    /// Enable or disable the hook behind `switch`.
    pub fn set(mut self, switch: &str, enabled: bool) -> Self {
        self.disabled.insert(switch.to_string(), !enabled);
        self
    }

    /// Disable the hook behind `switch`.
    pub fn disable(self, switch: &str) -> Self {
        self.set(switch, false)
    }

    /// Hooks without an explicit switch are enabled.
    pub fn is_enabled(&self, switch: &str) -> bool {
        !self.disabled.get(switch).copied().unwrap_or(false)
    }
}

/// A hook failure that was swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationWarning {
    /// Switch name of the failing hook
    pub hook: String,
    /// Error message
    pub message: String,
}

/// Ordered list of lifecycle hooks.
pub struct HookChain {
    hooks: Vec<Box<dyn LifecycleHook>>,
}

impl HookChain {
    /// A chain without hooks.
    pub fn empty() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Datetime, data record, then persistence.
    pub fn standard() -> Self {
        Self::empty()
            .with(Box::new(AddDatetime))
            .with(Box::new(AddDataRecord))
            .with(Box::new(PersistMetadata))
    }

    /// Append `hook`; hooks run in insertion order.
    pub fn with(mut self, hook: Box<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Switch names of the hooks, in run order.
    pub fn switches(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.switch()).collect()
    }

    /// Run every enabled hook in order, collecting failures.
    pub fn run(&self, ctx: &HookContext<'_>, switches: &HookSwitches) -> Vec<InstrumentationWarning> {
        let mut warnings = Vec::new();
        for hook in &self.hooks {
            let name = hook.switch();
            if !switches.is_enabled(name) {
                debug!(hook = name, "Hook disabled");
                continue;
            }
            if let Err(e) = hook.run(ctx) {
                warn!(hook = name, error = %e, "Lifecycle hook failed");
                warnings.push(InstrumentationWarning {
                    hook: name.to_string(),
                    message: e.to_string(),
                });
            }
        }
        warnings
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::standard()
    }
}
