//! Engine lifecycle state.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized ──initialize──> Initializing ──ok──> Ready ──run──> Running
//!       ▲                            │                 ▲  ▲            │
//!       └────────────error───────────┘                 │  └──finish────┘
//!                                                      │               │
//!                                                      └──── Reset <───┘
//!                                                            (reset)
//! ```
//!
//! `initialize` may be called again from `Ready` or `Reset`; it always
//! recomputes the derived measurement state from scratch.

use serde::{Deserialize, Serialize};

use crate::error::DaqError;

/// Lifecycle state of a [`crate::experiment::Measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No derived state yet
    Uninitialized,
    /// Classifying parameters and positioning channels
    Initializing,
    /// Channels positioned, buffers known
    Ready,
    /// A run routine is executing
    Running,
    /// Static and dynamic channels are being returned to their initial values
    Reset,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "Uninitialized"),
            EngineState::Initializing => write!(f, "Initializing"),
            EngineState::Ready => write!(f, "Ready"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Reset => write!(f, "Reset"),
        }
    }
}

impl EngineState {
    /// Check if the state allows (re-)initialization.
    pub fn can_initialize(&self) -> bool {
        matches!(
            self,
            EngineState::Uninitialized | EngineState::Ready | EngineState::Reset
        )
    }

    /// Check if the state allows a reset.
    pub fn can_reset(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Running)
    }

    /// Check if the state allows starting a run routine.
    pub fn can_run(&self) -> bool {
        matches!(self, EngineState::Ready)
    }

    /// Error for `operation` attempted in this state.
    pub fn invalid(&self, operation: &str) -> DaqError {
        DaqError::InvalidState {
            operation: operation.to_string(),
            state: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_refused_while_running() {
        assert!(EngineState::Uninitialized.can_initialize());
        assert!(EngineState::Ready.can_initialize());
        assert!(EngineState::Reset.can_initialize());
        assert!(!EngineState::Running.can_initialize());
        assert!(!EngineState::Initializing.can_initialize());
    }

    #[test]
    fn reset_requires_initialized_engine() {
        assert!(!EngineState::Uninitialized.can_reset());
        assert!(EngineState::Ready.can_reset());
        assert!(EngineState::Running.can_reset());
    }

    #[test]
    fn run_requires_ready_engine() {
        assert!(EngineState::Ready.can_run());
        assert!(!EngineState::Running.can_run());
        assert!(!EngineState::Uninitialized.can_run());
        assert!(!EngineState::Reset.can_run());
    }

    #[test]
    fn invalid_state_error_names_operation() {
        let err = EngineState::Running.invalid("initialize");
        assert_eq!(err.to_string(), "Cannot initialize while engine is Running");
    }
}
