//! Buffer payload shapes and readout flattening.
//!
//! Vendors disagree on how they hand back samples: some return a flat list,
//! some wrap every sample in its own single-element list, and some return
//! multi-valued samples (e.g. an X/Y pair per trigger). [`Payload`] models
//! all of these, and [`Payload::flatten`] normalises the single-element case
//! while leaving real multi-valued samples intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key under which a [`BufferReading`] carries its sample timestamps.
pub const TIMESTAMPS_KEY: &str = "timestamps";

/// A recursive vendor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A single sample
    Value(f64),
    /// Nested samples, as instruments return them
    List(Vec<Payload>),
}

impl Payload {
    /// Flatten one readout sequence.
    ///
    /// Each element that is a single-element list is unwrapped (repeatedly,
    /// so `[[[1]]]` also becomes `1`); inner lists with more than one element
    /// are kept as they are. A bare value becomes a one-element sequence.
    ///
    /// ```
    /// use gate_daq::data::Payload;
    ///
    /// let nested = Payload::from(vec![vec![1.0], vec![2.0]]);
    /// assert_eq!(nested.flatten(), vec![Payload::Value(1.0), Payload::Value(2.0)]);
    /// ```
    pub fn flatten(&self) -> Vec<Payload> {
        match self {
            Payload::Value(v) => vec![Payload::Value(*v)],
            Payload::List(items) => items.iter().map(unwrap_single).collect(),
        }
    }

    /// Scalar samples of a flattened sequence, `None` if any sample is multi-valued.
    pub fn as_scalars(samples: &[Payload]) -> Option<Vec<f64>> {
        samples
            .iter()
            .map(|s| match s {
                Payload::Value(v) => Some(*v),
                Payload::List(_) => None,
            })
            .collect()
    }

    /// Number of top-level samples.
    pub fn len(&self) -> usize {
        match self {
            Payload::Value(_) => 1,
            Payload::List(items) => items.len(),
        }
    }

    /// Whether the payload holds no sample.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unwrap_single(entry: &Payload) -> Payload {
    let mut current = entry;
    while let Payload::List(inner) = current {
        if inner.len() != 1 {
            break;
        }
        current = &inner[0];
    }
    current.clone()
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Value(value)
    }
}

impl From<Vec<f64>> for Payload {
    fn from(values: Vec<f64>) -> Self {
        Payload::List(values.into_iter().map(Payload::Value).collect())
    }
}

impl From<Vec<Vec<f64>>> for Payload {
    fn from(values: Vec<Vec<f64>>) -> Self {
        Payload::List(values.into_iter().map(Payload::from).collect())
    }
}

/// Everything one buffer returned from a single `read`.
///
/// Keyed by channel id, plus the [`TIMESTAMPS_KEY`] entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferReading {
    /// Payloads by channel id
    pub entries: BTreeMap<String, Payload>,
}

impl BufferReading {
    /// An empty reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the payload under `key`.
    pub fn insert(&mut self, key: impl Into<String>, payload: Payload) {
        self.entries.insert(key.into(), payload);
    }

    /// Payload stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.entries.get(key)
    }

    /// Timestamps, if the buffer returned any.
    pub fn timestamps(&self) -> Option<&Payload> {
        self.entries.get(TIMESTAMPS_KEY)
    }
}

/// One subscribed channel's flattened samples after readout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadoutEntry {
    /// Id of the channel the samples belong to
    pub channel: String,
    /// Channel label at readout time (`"{gate} {parameter}"` after initialize)
    pub label: String,
    /// Flattened samples, one per point
    pub samples: Vec<Payload>,
}
