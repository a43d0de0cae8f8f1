//! Error types for the messenger core
//!
//! Argument and state errors are local and never change messenger state;
//! library errors are translated at the seam. Per-message outcomes
//! (`SendResult`) are not errors — they travel through completion
//! callbacks instead.

use crate::amqp::AmqpError;
use crate::messenger::MessengerState;
use thiserror::Error;

/// Main error type for messenger operations.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not allowed in state {state:?}")]
    WrongState { state: MessengerState },

    #[error("already subscribed for messages")]
    AlreadySubscribed,

    #[error("not subscribed for messages")]
    NotSubscribed,

    #[error("send queue is full")]
    QueueFull,

    #[error("no message receiver (check if the messenger is subscribed)")]
    NoReceiver,

    #[error("in-flight items could not be returned to the pending queue")]
    MoveBackFailed,

    #[error("unrecognized option '{0}'")]
    UnknownOption(String),

    #[error("failed setting option '{name}': {reason}")]
    SetOptionFailed { name: String, reason: String },

    #[error("failed serializing options")]
    SerializationFailed(#[source] serde_json::Error),

    #[error("AMQP library error: {0}")]
    Amqp(#[from] AmqpError),
}

/// Result type for messenger operations.
pub type MessengerResult<T> = Result<T, MessengerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_non_empty() {
        let errors = vec![
            MessengerError::InvalidConfig("device_id is empty".to_string()),
            MessengerError::WrongState {
                state: MessengerState::Starting,
            },
            MessengerError::AlreadySubscribed,
            MessengerError::NotSubscribed,
            MessengerError::QueueFull,
            MessengerError::NoReceiver,
            MessengerError::MoveBackFailed,
            MessengerError::UnknownOption("bogus".to_string()),
            MessengerError::SetOptionFailed {
                name: "amqp_event_send_timeout_secs".to_string(),
                reason: "not an integer".to_string(),
            },
            MessengerError::Amqp(AmqpError::Link("detached".to_string())),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_amqp_error_converts() {
        fn fails() -> MessengerResult<()> {
            Err(AmqpError::Send("link closed".to_string()))?;
            Ok(())
        }

        assert!(matches!(fails(), Err(MessengerError::Amqp(_))));
    }
}
