//! Hardware abstraction: capability traits, ramping and mock devices.

pub mod capabilities;
pub mod mock;
pub mod ramp;

pub use capabilities::{
    buffer_of, Buffer, Channel, Instrument, SharedBuffer, SharedChannel, SharedInstrument,
    TriggerSource,
};
pub use ramp::{ramp_or_set, RampHandle, RampOutcome, RampSettings, TriggerSignal};
