//! Unified error handling for MROS
//!
//! A single error type is shared by every component of the core so that
//! failures can be propagated with `?` from the bus up to the host process.

use crate::event::Event;
use crate::message::MessageId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for MROS operations
#[derive(Debug, Error)]
pub enum MrosError {
    /// I/O related errors (configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bus arena has no free slot left
    #[error("Message bus full: capacity of {capacity} messages reached")]
    BusFull { capacity: usize },

    /// A message id that is not (or no longer) held by the bus
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// Registering another subscriber would overflow the acknowledgement bitset
    #[error("Subscriber limit reached: at most {limit} subscribers may be registered")]
    SubscriberLimit { limit: usize },

    /// Unknown behaviour handle
    #[error("Unknown behaviour: {0}")]
    UnknownBehaviour(usize),

    /// Event name or code that does not map to a known event
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Illegal lifecycle transition of the scheduler clock
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    /// A behaviour returned an error or panicked while handling a message
    #[error("Behaviour '{behaviour}' failed: {message}")]
    BehaviourFailure { behaviour: String, message: String },

    /// A dire system event was dispatched and the configuration requests exit
    #[error("Dire system event dispatched: {event}")]
    DireSystemEvent { event: Event },

    /// The external clock stopped delivering ticks
    #[error("Clock source lost: no tick received within {waited:?}")]
    ClockSourceLoss { waited: Duration },
}

impl MrosError {
    /// Whether this error ends the control loop rather than being contained.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            MrosError::DireSystemEvent { .. } | MrosError::ClockSourceLoss { .. }
        )
    }

    /// Convenience constructor for behaviour failures.
    pub fn behaviour(behaviour: impl Into<String>, message: impl Into<String>) -> Self {
        MrosError::BehaviourFailure {
            behaviour: behaviour.into(),
            message: message.into(),
        }
    }
}

/// Convenience type alias for MROS results
pub type MrosResult<T> = Result<T, MrosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_kinds() {
        assert!(MrosError::DireSystemEvent {
            event: Event::BatteryLow
        }
        .is_escalation());
        assert!(MrosError::ClockSourceLoss {
            waited: Duration::from_millis(500)
        }
        .is_escalation());
        assert!(!MrosError::behaviour("avoid", "boom").is_escalation());
        assert!(!MrosError::Config("bad".into()).is_escalation());
    }

    #[test]
    fn test_display() {
        let err = MrosError::behaviour("roam", "motor offline");
        assert_eq!(err.to_string(), "Behaviour 'roam' failed: motor offline");
    }
}
