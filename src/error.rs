//! Custom error types for the measurement engine.
//!
//! `DaqError` is the single error type returned by every fallible engine
//! operation. Variants fall into four families, reported by [`DaqError::kind`]:
//!
//! - **Configuration**: the parameter or buffer settings are unusable as
//!   written (unknown parameter names, overdetermined buffer point counts,
//!   missing setpoints). Raised before any hardware is touched.
//! - **Capability**: the hardware cannot do what the configuration asks, such
//!   as a gettable channel without a buffer or an unsupported trigger source.
//! - **Acquisition**: a buffer failed while it was being read out.
//! - **State**: an operation was called in the wrong engine state.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying library
//! errors, so `?` works across figment, serde_json and I/O calls.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration cannot be turned into a measurement plan.
    Configuration,
    /// An instrument or buffer lacks a required capability.
    Capability,
    /// A buffer failed during readout.
    Acquisition,
    /// The engine was driven out of order.
    State,
    /// Driver, I/O and serialization failures.
    Other,
}

/// Errors raised by the measurement engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A setting or parameter specification is unusable
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Both a point count and a sampling rate were given
    #[error("Buffer settings specify num_points together with sampling_rate/burst_duration")]
    OverdeterminedBufferSpec,

    /// No point count can be derived
    #[error("Buffered sweep requested but no point count could be derived from the buffer settings")]
    UnderdeterminedBufferSpec,

    /// The parameter name is not a known one
    #[error("Unknown parameter name '{0}'")]
    UnknownParameterName(String),

    /// The same parameter was added twice
    #[error("Gate '{gate}' already defines parameter '{parameter}'")]
    DuplicateParameter {
        /// Gate name
        gate: String,
        /// Parameter name
        parameter: String,
    },

    /// The gate mapping is not an object of objects
    #[error("Malformed gate mapping: {0}")]
    MalformedGateMapping(String),

    /// A dynamic parameter has no value, start or setpoints
    #[error("No initial setpoint for dynamic parameter '{0}' (need value, start or setpoints)")]
    MissingInitialSetpoint(String),

    /// A break condition could not be parsed
    #[error("Invalid break condition '{0}'")]
    InvalidBreakCondition(String),

    /// A gettable channel has no buffer to acquire through
    #[error("Channel '{0}' is not attached to a bufferable instrument")]
    NotBufferable(String),

    /// The buffer cannot use the requested trigger source
    #[error("Buffer '{buffer}' does not support trigger source '{trigger}'")]
    UnsupportedTrigger {
        /// Buffer id
        buffer: String,
        /// Requested trigger source
        trigger: String,
    },

    /// An instrument lacks a required capability
    #[error("Capability error: {0}")]
    Capability(String),

    /// A buffer failed while acquiring or reading out
    #[error("Acquisition failed on buffer '{buffer}': {message}")]
    Acquisition {
        /// Buffer id
        buffer: String,
        /// Driver message
        message: String,
    },

    /// An operation was attempted in the wrong engine state
    #[error("Cannot {operation} while engine is {state}")]
    InvalidState {
        /// Operation that was refused
        operation: String,
        /// Engine state at the time
        state: String,
    },

    /// A driver call failed
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// File access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaqError {
    /// Which error family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::OverdeterminedBufferSpec
            | DaqError::UnderdeterminedBufferSpec
            | DaqError::UnknownParameterName(_)
            | DaqError::DuplicateParameter { .. }
            | DaqError::MalformedGateMapping(_)
            | DaqError::MissingInitialSetpoint(_)
            | DaqError::InvalidBreakCondition(_) => ErrorKind::Configuration,
            DaqError::NotBufferable(_)
            | DaqError::UnsupportedTrigger { .. }
            | DaqError::Capability(_) => ErrorKind::Capability,
            DaqError::Acquisition { .. } => ErrorKind::Acquisition,
            DaqError::InvalidState { .. } => ErrorKind::State,
            DaqError::Instrument(_) | DaqError::Io(_) | DaqError::Json(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn acquisition(buffer: impl Into<String>, message: impl ToString) -> Self {
        DaqError::Acquisition {
            buffer: buffer.into(),
            message: message.to_string(),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_buffer_spec_errors_as_configuration() {
        assert_eq!(
            DaqError::OverdeterminedBufferSpec.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            DaqError::UnderdeterminedBufferSpec.kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn acquisition_error_names_buffer() {
        let err = DaqError::acquisition("lockin_1", "timeout");
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        assert!(err.to_string().contains("lockin_1"));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn converts_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DaqError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
