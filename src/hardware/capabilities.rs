//! Hardware Capabilities
//!
//! The engine never talks to a driver directly. It sees three small
//! capabilities that any instrument stack can implement:
//!
//! - [`Channel`]: a single gettable/settable quantity (a gate voltage, a
//!   lock-in X component).
//! - [`Instrument`]: the owner of channels, which may expose a buffer.
//! - [`Buffer`]: a hardware acquisition buffer that records subscribed
//!   channels on a trigger and hands the samples back in one batch.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async where it performs I/O (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; implementations use interior mutability for state
//! - Reports failures as [`DaqError`]
//!
//! Channels hold a back-reference to their instrument so the engine can find
//! the buffer behind a gettable channel. Buffers refer to subscribed channels
//! by id only, so no reference cycle forms between buffer and channel.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn armed_readout(buffer: &dyn Buffer, settings: &BufferSettings) -> AppResult<BufferReading> {
//!     buffer.setup_buffer(settings).await?;
//!     buffer.start().await?;
//!     // ... ramp, trigger ...
//!     buffer.stop().await?;
//!     buffer.read().await
//! }
//! ```

use crate::config::BufferSettings;
use crate::core::ParameterValue;
use crate::data::BufferReading;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shared handle to a channel
pub type SharedChannel = Arc<dyn Channel>;
/// Shared handle to an instrument
pub type SharedInstrument = Arc<dyn Instrument>;
/// Shared handle to a buffer
pub type SharedBuffer = Arc<dyn Buffer>;

/// Capability: Channel access
///
/// # Contract
/// - `id` is unique across all instruments and stable for the channel's life
/// - `name` is the short, instrument-local name (e.g. `"X"`)
/// - `label` is free text; the engine relabels channels to `"{gate} {parameter}"`
#[async_trait]
pub trait Channel: Send + Sync {
    /// Globally unique channel identifier
    fn id(&self) -> &str;

    /// Instrument-local channel name
    fn name(&self) -> &str;

    /// Current human-readable label
    fn label(&self) -> String;

    /// Replace the display label.
    fn set_label(&self, label: &str);

    /// The instrument this channel belongs to, if still alive
    fn instrument(&self) -> Option<SharedInstrument>;

    /// Read the current value from hardware
    async fn get(&self) -> AppResult<ParameterValue>;

    /// Write a value to hardware
    async fn set(&self, value: ParameterValue) -> AppResult<()>;
}

/// Capability: Instrument identity and buffering
pub trait Instrument: Send + Sync {
    /// Unique instrument id
    fn id(&self) -> &str;

    /// The instrument's acquisition buffer, `None` if it is not bufferable
    fn buffer(&self) -> Option<SharedBuffer>;
}

/// Source that starts a buffer's acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    /// External trigger input
    External,
    /// Started by [`Buffer::force_trigger`]
    Software,
    /// Level trigger on a named input channel
    Channel(String),
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::External => write!(f, "external"),
            TriggerSource::Software => write!(f, "software"),
            TriggerSource::Channel(name) => write!(f, "channel:{name}"),
        }
    }
}

/// Capability: Buffered acquisition
///
/// # Contract
/// - `setup_buffer` is idempotent and may be called on every `ready`
/// - A buffer has a fixed number of slots; each slot holds at most one
///   subscribed channel. Subscribing a channel to an occupied slot evicts the
///   previous occupant (last write wins)
/// - `read` is only valid after `stop`; reading an armed buffer is an
///   acquisition error
/// - The reading carries one entry per subscribed channel id plus the
///   [`crate::data::TIMESTAMPS_KEY`] entry
///
/// # Thread Safety
/// The engine never issues concurrent calls against one buffer.
#[async_trait]
pub trait Buffer: Send + Sync {
    /// Unique buffer id
    fn id(&self) -> &str;

    /// Apply acquisition settings
    async fn setup_buffer(&self, settings: &BufferSettings) -> AppResult<()>;

    /// Currently bound trigger source
    fn trigger(&self) -> Option<TriggerSource>;

    /// Bind a trigger source; unsupported sources are rejected with
    /// [`DaqError::UnsupportedTrigger`]
    async fn set_trigger(&self, trigger: Option<TriggerSource>) -> AppResult<()>;

    /// Subscribe channels to this buffer's slots
    async fn subscribe(&self, channels: &[SharedChannel]) -> AppResult<()>;

    /// Remove `channels` from the acquisition.
    async fn unsubscribe(&self, channels: &[SharedChannel]) -> AppResult<()>;

    /// Whether `channel` is currently acquired.
    fn is_subscribed(&self, channel: &dyn Channel) -> bool;

    /// Ids of the subscribed channels in subscription order
    fn subscribed(&self) -> Vec<String>;

    /// Arm the buffer
    async fn start(&self) -> AppResult<()>;

    /// Disarm the buffer
    async fn stop(&self) -> AppResult<()>;

    /// Read all recorded samples
    async fn read(&self) -> AppResult<BufferReading>;

    /// Vendor payload as received, for diagnostics
    async fn read_raw(&self) -> AppResult<serde_json::Value>;

    /// Start acquisition from software
    async fn force_trigger(&self) -> AppResult<()> {
        Err(DaqError::Capability(format!(
            "Buffer '{}' cannot be triggered from software",
            self.id()
        )))
    }

    /// Whether the current acquisition has completed
    async fn is_finished(&self) -> AppResult<bool> {
        Ok(true)
    }
}

/// The buffer behind a channel, if its instrument is bufferable.
pub fn buffer_of(channel: &dyn Channel) -> AppResult<SharedBuffer> {
    channel
        .instrument()
        .and_then(|instrument| instrument.buffer())
        .ok_or_else(|| DaqError::NotBufferable(channel.id().to_string()))
}
