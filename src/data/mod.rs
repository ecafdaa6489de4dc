//! Acquired data: vendor payloads and result tables.
pub mod dataset;
pub mod payload;

pub use dataset::{Column, Dataset};
pub use payload::{BufferReading, Payload, ReadoutEntry, TIMESTAMPS_KEY};
