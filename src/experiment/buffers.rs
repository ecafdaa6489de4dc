//! Buffer coordination.
//!
//! A measurement may record through several buffers on different
//! instruments. [`BufferCoordinator`] keeps the distinct set of buffers behind
//! the gettable channels, arms them together and reads them back as a single
//! list of [`ReadoutEntry`] values.

use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::BufferSettings;
use crate::data::ReadoutEntry;
use crate::error::{AppResult, DaqError};
use crate::hardware::{buffer_of, Channel, SharedBuffer, SharedChannel};

struct TrackedBuffer {
    buffer: SharedBuffer,
    armed: bool,
}

/// The distinct buffers of a measurement and their armed state.
#[derive(Default)]
pub struct BufferCoordinator {
    buffers: Vec<TrackedBuffer>,
    labels: Vec<(String, String)>,
}

impl fmt::Debug for BufferCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.buffers.iter().map(|b| (b.buffer.id(), b.armed)))
            .finish()
    }
}

impl BufferCoordinator {
    /// A coordinator with no buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the buffers behind `channels`, one entry per buffer id.
    ///
    /// Fails with [`DaqError::NotBufferable`] if any channel's instrument has
    /// no buffer.
    pub fn collect(channels: &[SharedChannel]) -> AppResult<Self> {
        let mut coordinator = Self::new();
        let mut seen = HashSet::new();
        for channel in channels {
            let buffer = buffer_of(channel.as_ref())?;
            if seen.insert(buffer.id().to_string()) {
                coordinator.buffers.push(TrackedBuffer {
                    buffer,
                    armed: false,
                });
            }
        }
        Ok(coordinator)
    }

    /// Subscribe each channel to its buffer and remember its label for readout.
    pub async fn subscribe(&mut self, channels: &[SharedChannel]) -> AppResult<()> {
        for channel in channels {
            let buffer = buffer_of(channel.as_ref())?;
            buffer.subscribe(std::slice::from_ref(channel)).await?;
            debug!(channel = channel.id(), buffer = buffer.id(), "Subscribed");
        }
        self.refresh_labels(channels);
        Ok(())
    }

    /// Record the current labels of `channels`, used to name readout entries.
    pub fn refresh_labels(&mut self, channels: &[SharedChannel]) {
        self.labels = channels
            .iter()
            .map(|c| (c.id().to_string(), c.label()))
            .collect();
    }

    /// Number of distinct buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer is tracked.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Every tracked buffer, in collection order.
    pub fn buffers(&self) -> impl Iterator<Item = &SharedBuffer> {
        self.buffers.iter().map(|b| &b.buffer)
    }

    /// Whether `buffer_id` has been started and not yet read out.
    pub fn is_armed(&self, buffer_id: &str) -> bool {
        self.buffers
            .iter()
            .any(|b| b.armed && b.buffer.id() == buffer_id)
    }

    /// Whether any buffer is still armed.
    pub fn any_armed(&self) -> bool {
        self.buffers.iter().any(|b| b.armed)
    }

    /// Set up and start every buffer.
    ///
    /// Buffers are readied concurrently; within one buffer `setup_buffer`
    /// always precedes `start`. A buffer that is already armed is only set up
    /// again. Every buffer is attempted and the first error is returned.
    pub async fn ready_buffers(&mut self, settings: &BufferSettings) -> AppResult<()> {
        let results = join_all(self.buffers.iter().map(|tracked| {
            let buffer = tracked.buffer.clone();
            let armed = tracked.armed;
            async move {
                buffer.setup_buffer(settings).await?;
                if armed {
                    warn!(buffer = buffer.id(), "Buffer already armed, not starting again");
                } else {
                    buffer.start().await?;
                }
                Ok::<_, DaqError>(())
            }
        }))
        .await;

        let mut first_error = None;
        for (tracked, result) in self.buffers.iter_mut().zip(results) {
            match result {
                Ok(()) => tracked.armed = true,
                Err(e) => {
                    warn!(buffer = tracked.buffer.id(), error = %e, "Failed to ready buffer");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(count = self.buffers.len(), "Buffers armed");
                Ok(())
            }
        }
    }

    /// Stop every buffer and read out all subscribed channels.
    ///
    /// The first failing read aborts the readout with an acquisition error
    /// naming the buffer; all buffers are disarmed before returning.
    pub async fn readout_buffers(&mut self) -> AppResult<Vec<ReadoutEntry>> {
        let mut results = Vec::new();
        for index in 0..self.buffers.len() {
            if let Err(e) = self.readout_one(index, &mut results).await {
                self.disarm_all().await;
                return Err(e);
            }
        }
        Ok(results)
    }

    async fn readout_one(&mut self, index: usize, results: &mut Vec<ReadoutEntry>) -> AppResult<()> {
        let tracked = &mut self.buffers[index];
        let buffer = tracked.buffer.clone();
        if tracked.armed {
            buffer
                .stop()
                .await
                .map_err(|e| DaqError::acquisition(buffer.id(), e))?;
            tracked.armed = false;
        }

        let reading = buffer.read().await.map_err(|e| match e {
            DaqError::Acquisition { .. } => e,
            other => DaqError::acquisition(buffer.id(), other),
        })?;
        for channel_id in buffer.subscribed() {
            let payload = reading.get(&channel_id).ok_or_else(|| {
                DaqError::acquisition(
                    buffer.id(),
                    format!("no data for subscribed channel '{channel_id}'"),
                )
            })?;
            let label = self
                .labels
                .iter()
                .find(|(id, _)| id == &channel_id)
                .map(|(_, label)| label.clone())
                .unwrap_or_else(|| channel_id.clone());
            results.push(ReadoutEntry {
                channel: channel_id,
                label,
                samples: payload.flatten(),
            });
        }
        Ok(())
    }

    /// Best-effort stop of every armed buffer.
    pub async fn disarm_all(&mut self) {
        for tracked in self.buffers.iter_mut().filter(|b| b.armed) {
            match tracked.buffer.stop().await {
                Ok(()) => tracked.armed = false,
                Err(e) => warn!(buffer = tracked.buffer.id(), error = %e, "Failed to stop buffer"),
            }
        }
    }

    /// Force-trigger every buffer.
    pub async fn force_trigger_all(&self) -> AppResult<()> {
        for tracked in &self.buffers {
            tracked.buffer.force_trigger().await?;
        }
        Ok(())
    }

    /// Wait until every buffer reports its acquisition finished.
    ///
    /// Polls every `poll_interval` with no upper bound.
    pub async fn wait_finished(&self, poll_interval: std::time::Duration) -> AppResult<()> {
        for tracked in &self.buffers {
            while !tracked.buffer.is_finished().await? {
                tokio::time::sleep(poll_interval).await;
            }
        }
        Ok(())
    }
}

/// Whether `channel` is subscribed to the buffer of its instrument.
pub fn is_channel_subscribed(channel: &dyn Channel) -> bool {
    buffer_of(channel)
        .map(|buffer| buffer.is_subscribed(channel))
        .unwrap_or(false)
}
