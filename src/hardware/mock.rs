//! Mock Hardware Implementations
//!
//! Provides simulated instruments, channels and buffers for testing without
//! physical hardware. All state sits behind `parking_lot` locks that are never
//! held across an `.await`.
//!
//! # Available Mocks
//!
//! - `MockInstrument` - owner of channels, optionally bufferable
//! - `MockChannel` - settable/gettable value that records every `set`
//! - `MockBuffer` - slot-based acquisition buffer with trigger whitelist and
//!   fault injection
//!
//! # Example
//!
//! ```rust,ignore
//! let dac = MockInstrument::new("dac");
//! let gate = dac.add_channel("ch01");
//! let lockin = MockInstrument::with_buffer(
//!     "lockin",
//!     MockBuffer::new("lockin_buffer").with_slot(&["X", "R"]).with_slot(&["Y", "P"]),
//! );
//! let x = lockin.add_channel("X");
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::config::{BufferSettings, TriggerType};
use crate::core::ParameterValue;
use crate::data::{BufferReading, Payload, TIMESTAMPS_KEY};
use crate::error::{AppResult, DaqError};
use crate::experiment::sweep::resolve_buffered_num_points;
use crate::hardware::capabilities::{
    Buffer, Channel, Instrument, SharedBuffer, SharedChannel, SharedInstrument, TriggerSource,
};

// =============================================================================
// MockInstrument
// =============================================================================

/// Mock instrument owning a set of channels and an optional buffer.
pub struct MockInstrument {
    id: String,
    channels: RwLock<Vec<Arc<MockChannel>>>,
    buffer: Option<Arc<MockBuffer>>,
}

impl MockInstrument {
    /// Instrument without a buffer
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            channels: RwLock::new(Vec::new()),
            buffer: None,
        })
    }

    /// Bufferable instrument
    pub fn with_buffer(id: &str, buffer: MockBuffer) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            channels: RwLock::new(Vec::new()),
            buffer: Some(Arc::new(buffer)),
        })
    }

    /// Add a channel named `name`, with id `"{instrument}.{name}"` and value 0.0
    pub fn add_channel(self: &Arc<Self>, name: &str) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel {
            id: format!("{}.{}", self.id, name),
            name: name.to_string(),
            label: RwLock::new(name.to_string()),
            value: RwLock::new(ParameterValue::Float(0.0)),
            history: Mutex::new(Vec::new()),
            fail_set: RwLock::new(None),
            instrument: Arc::downgrade(self),
        });
        self.channels.write().push(channel.clone());
        channel
    }

    /// Channel previously added under `name`.
    pub fn channel(&self, name: &str) -> Option<Arc<MockChannel>> {
        self.channels.read().iter().find(|c| c.name == name).cloned()
    }

    /// Concrete handle to the buffer, for inspection in tests
    pub fn mock_buffer(&self) -> Option<Arc<MockBuffer>> {
        self.buffer.clone()
    }
}

impl Instrument for MockInstrument {
    fn id(&self) -> &str {
        &self.id
    }

    fn buffer(&self) -> Option<SharedBuffer> {
        self.buffer.clone().map(|b| b as SharedBuffer)
    }
}

// =============================================================================
// MockChannel
// =============================================================================

/// Mock channel that stores its value and records every `set`.
pub struct MockChannel {
    id: String,
    name: String,
    label: RwLock<String>,
    value: RwLock<ParameterValue>,
    history: Mutex<Vec<ParameterValue>>,
    fail_set: RwLock<Option<String>>,
    instrument: Weak<MockInstrument>,
}

impl MockChannel {
    /// Current value without going through `get`
    pub fn value(&self) -> ParameterValue {
        self.value.read().clone()
    }

    /// Change the value without recording a `set` (simulates a measured quantity)
    pub fn set_value_silently(&self, value: impl Into<ParameterValue>) {
        *self.value.write() = value.into();
    }

    /// Every value written with `set`, oldest first
    pub fn history(&self) -> Vec<ParameterValue> {
        self.history.lock().clone()
    }

    /// Forget recorded sets.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Make every following `set` fail with `message`
    pub fn fail_sets(&self, message: &str) {
        *self.fail_set.write() = Some(message.to_string());
    }

    /// This channel as a [`SharedChannel`].
    pub fn as_shared(self: &Arc<Self>) -> SharedChannel {
        self.clone()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> String {
        self.label.read().clone()
    }

    fn set_label(&self, label: &str) {
        *self.label.write() = label.to_string();
    }

    fn instrument(&self) -> Option<SharedInstrument> {
        self.instrument
            .upgrade()
            .map(|instrument| instrument as SharedInstrument)
    }

    async fn get(&self) -> AppResult<ParameterValue> {
        Ok(self.value())
    }

    async fn set(&self, value: ParameterValue) -> AppResult<()> {
        if let Some(message) = self.fail_set.read().clone() {
            return Err(DaqError::Instrument(format!("{}: {}", self.id, message)));
        }
        debug!(channel = %self.id, %value, "MockChannel set");
        *self.value.write() = value.clone();
        self.history.lock().push(value);
        Ok(())
    }
}

// =============================================================================
// MockBuffer
// =============================================================================

#[derive(Default)]
struct MockBufferState {
    /// (slot index, channel id) in subscription order
    subscriptions: Vec<(usize, String)>,
    /// channel id -> slot key for slot-less buffers
    free_slots: HashMap<String, usize>,
    trigger: Option<TriggerSource>,
    settings: Option<BufferSettings>,
    armed: bool,
    has_recording: bool,
    software_triggered: bool,
    pending_polls: usize,
    payloads: HashMap<String, Payload>,
    fail_setup: Option<String>,
    fail_read: Option<String>,
    setup_count: usize,
    start_count: usize,
    stop_count: usize,
    calls: Vec<&'static str>,
}

/// Mock acquisition buffer.
///
/// Slots are declared with [`MockBuffer::with_slot`], each listing the
/// channel names it can record (like a lock-in whose display 1 shows X or R).
/// A buffer without declared slots gives every channel its own slot.
pub struct MockBuffer {
    id: String,
    slots: Vec<Vec<String>>,
    supported_triggers: Vec<TriggerSource>,
    state: Mutex<MockBufferState>,
}

impl MockBuffer {
    /// Buffer supporting external and software triggers
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            slots: Vec::new(),
            supported_triggers: vec![TriggerSource::External, TriggerSource::Software],
            state: Mutex::new(MockBufferState::default()),
        }
    }

    /// Declare a slot that accepts the given channel names
    pub fn with_slot(mut self, names: &[&str]) -> Self {
        self.slots
            .push(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Replace the trigger whitelist
    pub fn with_supported_triggers(mut self, triggers: Vec<TriggerSource>) -> Self {
        self.supported_triggers = triggers;
        self
    }

    /// Preset the payload returned for a channel id
    pub fn set_payload(&self, channel_id: &str, payload: Payload) {
        self.state
            .lock()
            .payloads
            .insert(channel_id.to_string(), payload);
    }

    /// Make every following `setup_buffer` fail with `message`
    pub fn fail_setup(&self, message: &str) {
        self.state.lock().fail_setup = Some(message.to_string());
    }

    /// Make every following `read` fail with `message`
    pub fn fail_read(&self, message: &str) {
        self.state.lock().fail_read = Some(message.to_string());
    }

    /// Report unfinished for the next `polls` calls of `is_finished`
    pub fn finish_after(&self, polls: usize) {
        self.state.lock().pending_polls = polls;
    }

    /// Whether the buffer is started and not stopped
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Number of `setup_buffer` calls
    pub fn setup_count(&self) -> usize {
        self.state.lock().setup_count
    }

    /// Number of `start` calls
    pub fn start_count(&self) -> usize {
        self.state.lock().start_count
    }

    /// Number of `stop` calls
    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }

    /// Whether `force_trigger` was called since the last start
    pub fn was_software_triggered(&self) -> bool {
        self.state.lock().software_triggered
    }

    /// Settings passed to the last `setup_buffer`
    pub fn settings(&self) -> Option<BufferSettings> {
        self.state.lock().settings.clone()
    }

    /// Names of the buffer operations called so far, oldest first
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    fn slot_for(&self, state: &mut MockBufferState, channel: &dyn Channel) -> AppResult<usize> {
        if self.slots.is_empty() {
            let next = state.free_slots.len();
            return Ok(*state
                .free_slots
                .entry(channel.id().to_string())
                .or_insert(next));
        }
        self.slots
            .iter()
            .position(|names| names.iter().any(|n| n == channel.name()))
            .ok_or_else(|| {
                DaqError::Capability(format!(
                    "Channel '{}' cannot be recorded by buffer '{}'",
                    channel.id(),
                    self.id
                ))
            })
    }

    fn check_trigger(&self, trigger: &TriggerSource) -> AppResult<()> {
        if self.supported_triggers.contains(trigger) {
            Ok(())
        } else {
            Err(DaqError::UnsupportedTrigger {
                buffer: self.id.clone(),
                trigger: trigger.to_string(),
            })
        }
    }

    fn default_payload(settings: Option<&BufferSettings>, seed: usize) -> Payload {
        let points = settings
            .and_then(|s| resolve_buffered_num_points(s).ok().flatten())
            .unwrap_or(0);
        Payload::from(
            (0..points)
                .map(|i| vec![seed as f64 + i as f64])
                .collect::<Vec<_>>(),
        )
    }
}

#[async_trait]
impl Buffer for MockBuffer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup_buffer(&self, settings: &BufferSettings) -> AppResult<()> {
        let trigger = match settings.trigger_type {
            Some(TriggerType::Hardware) => Some(TriggerSource::External),
            Some(TriggerType::Software) => Some(TriggerSource::Software),
            Some(TriggerType::Manual) | None => None,
        };
        if let Some(trigger) = &trigger {
            self.check_trigger(trigger)?;
        }

        let mut state = self.state.lock();
        state.calls.push("setup");
        if let Some(message) = state.fail_setup.clone() {
            return Err(DaqError::Instrument(format!("{}: {}", self.id, message)));
        }
        if trigger.is_some() {
            state.trigger = trigger;
        }
        state.settings = Some(settings.clone());
        state.setup_count += 1;
        Ok(())
    }

    fn trigger(&self) -> Option<TriggerSource> {
        self.state.lock().trigger.clone()
    }

    async fn set_trigger(&self, trigger: Option<TriggerSource>) -> AppResult<()> {
        if let Some(trigger) = &trigger {
            self.check_trigger(trigger)?;
        }
        self.state.lock().trigger = trigger;
        Ok(())
    }

    async fn subscribe(&self, channels: &[SharedChannel]) -> AppResult<()> {
        let mut state = self.state.lock();
        for channel in channels {
            let slot = self.slot_for(&mut state, channel.as_ref())?;
            if let Some(pos) = state.subscriptions.iter().position(|(s, _)| *s == slot) {
                let (_, evicted) = state.subscriptions.remove(pos);
                if evicted != channel.id() {
                    debug!(buffer = %self.id, %evicted, slot, "Evicting subscription");
                }
            }
            state.subscriptions.push((slot, channel.id().to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, channels: &[SharedChannel]) -> AppResult<()> {
        let mut state = self.state.lock();
        for channel in channels {
            state.subscriptions.retain(|(_, id)| id != channel.id());
        }
        Ok(())
    }

    fn is_subscribed(&self, channel: &dyn Channel) -> bool {
        self.state
            .lock()
            .subscriptions
            .iter()
            .any(|(_, id)| id == channel.id())
    }

    fn subscribed(&self) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    async fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push("start");
        state.armed = true;
        state.software_triggered = false;
        state.start_count += 1;
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push("stop");
        if state.armed {
            state.has_recording = true;
        }
        state.armed = false;
        state.stop_count += 1;
        Ok(())
    }

    async fn read(&self) -> AppResult<BufferReading> {
        let mut state = self.state.lock();
        state.calls.push("read");
        if state.armed {
            return Err(DaqError::acquisition(&self.id, "read while buffer is armed"));
        }
        if let Some(message) = state.fail_read.clone() {
            return Err(DaqError::acquisition(&self.id, message));
        }
        if !state.has_recording {
            return Err(DaqError::acquisition(&self.id, "no acquisition recorded"));
        }

        let sampling_rate = state
            .settings
            .as_ref()
            .and_then(|s| s.sampling_rate)
            .unwrap_or(1.0);
        let mut reading = BufferReading::new();
        for (index, (_, channel_id)) in state.subscriptions.iter().enumerate() {
            let payload = state
                .payloads
                .get(channel_id)
                .cloned()
                .unwrap_or_else(|| Self::default_payload(state.settings.as_ref(), index));
            if reading.timestamps().is_none() {
                let times: Vec<f64> = (0..payload.len())
                    .map(|i| i as f64 / sampling_rate)
                    .collect();
                reading.insert(TIMESTAMPS_KEY, Payload::from(times));
            }
            reading.insert(channel_id.clone(), payload);
        }
        Ok(reading)
    }

    async fn read_raw(&self) -> AppResult<serde_json::Value> {
        let reading = self.read().await?;
        Ok(serde_json::to_value(&reading.entries)?)
    }

    async fn force_trigger(&self) -> AppResult<()> {
        self.check_trigger(&TriggerSource::Software)?;
        let mut state = self.state.lock();
        state.calls.push("force_trigger");
        state.software_triggered = true;
        Ok(())
    }

    async fn is_finished(&self) -> AppResult<bool> {
        let mut state = self.state.lock();
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_back_reference_reaches_buffer() {
        let lockin = MockInstrument::with_buffer("lockin", MockBuffer::new("lockin_buffer"));
        let x = lockin.add_channel("X");

        let instrument = x.instrument().unwrap();
        assert_eq!(instrument.id(), "lockin");
        assert_eq!(instrument.buffer().unwrap().id(), "lockin_buffer");
        assert_eq!(x.id(), "lockin.X");
    }

    #[tokio::test]
    async fn channel_records_sets() {
        let dac = MockInstrument::new("dac");
        let ch = dac.add_channel("ch01");
        ch.set(ParameterValue::Float(0.1)).await.unwrap();
        ch.set(ParameterValue::Float(0.2)).await.unwrap();
        assert_eq!(ch.history().len(), 2);
        assert_eq!(ch.get().await.unwrap(), ParameterValue::Float(0.2));
        assert!(dac.buffer().is_none());
    }

    #[tokio::test]
    async fn subscribing_to_occupied_slot_evicts_previous_channel() {
        let lockin = MockInstrument::with_buffer(
            "lockin",
            MockBuffer::new("buf").with_slot(&["X", "R"]).with_slot(&["Y", "P"]),
        );
        let x = lockin.add_channel("X");
        let r = lockin.add_channel("R");
        let y = lockin.add_channel("Y");
        let buffer = lockin.mock_buffer().unwrap();

        buffer.subscribe(&[x.as_shared(), y.as_shared()]).await.unwrap();
        buffer.subscribe(&[r.as_shared()]).await.unwrap();

        assert!(!buffer.is_subscribed(x.as_ref()));
        assert!(buffer.is_subscribed(r.as_ref()));
        assert!(buffer.is_subscribed(y.as_ref()));
        assert_eq!(buffer.subscribed(), vec!["lockin.Y", "lockin.R"]);
    }

    #[tokio::test]
    async fn channel_without_slot_is_rejected() {
        let lockin =
            MockInstrument::with_buffer("lockin", MockBuffer::new("buf").with_slot(&["X"]));
        let aux = lockin.add_channel("AUX");
        let buffer = lockin.mock_buffer().unwrap();

        let err = buffer.subscribe(&[aux.as_shared()]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Capability);
    }

    #[tokio::test]
    async fn unsupported_trigger_is_rejected() {
        let buffer = MockBuffer::new("buf").with_supported_triggers(vec![TriggerSource::External]);
        let err = buffer
            .set_trigger(Some(TriggerSource::Software))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedTrigger { .. }));
        assert!(buffer.force_trigger().await.is_err());

        buffer.set_trigger(Some(TriggerSource::External)).await.unwrap();
        assert_eq!(buffer.trigger(), Some(TriggerSource::External));
    }

    #[tokio::test]
    async fn read_requires_stop() {
        let lockin = MockInstrument::with_buffer("lockin", MockBuffer::new("buf"));
        let x = lockin.add_channel("X");
        let buffer = lockin.mock_buffer().unwrap();
        let settings = BufferSettings {
            num_points: Some(4),
            ..Default::default()
        };

        buffer.subscribe(&[x.as_shared()]).await.unwrap();
        buffer.setup_buffer(&settings).await.unwrap();
        buffer.start().await.unwrap();
        assert!(buffer.read().await.is_err());

        buffer.stop().await.unwrap();
        let reading = buffer.read().await.unwrap();
        assert_eq!(reading.get("lockin.X").unwrap().len(), 4);
        assert_eq!(reading.timestamps().unwrap().len(), 4);

        let raw = buffer.read_raw().await.unwrap();
        assert!(raw.get(TIMESTAMPS_KEY).is_some());
    }
}
