//! SFU controller error types.
//!
//! Every error maps onto one of four handling classes (see [`ErrorClass`]).
//! Internal details are logged server-side but never sent to clients.

use thiserror::Error;

/// How a failure is treated once it reaches an event handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected rejection (unauthorized produce, incompatible consume).
    /// Answered with a null result or ignored; not an operational fault.
    RejectedByPolicy,
    /// An engine, store or channel call failed. Logged, never retried
    /// server-side; the client may re-request.
    Transient,
    /// The event referenced state that does not exist or is in the wrong
    /// phase. Logged as an assertion failure; only that event is aborted.
    InvariantViolation,
    /// Unrecoverable for the whole process.
    Fatal,
}

impl ErrorClass {
    /// Returns the class as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RejectedByPolicy => "rejected_by_policy",
            ErrorClass::Transient => "transient",
            ErrorClass::InvariantViolation => "invariant_violation",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// SFU controller error type.
///
/// `Clone` so one creation failure can be delivered to every waiter.
#[derive(Debug, Clone, Error)]
pub enum SfuError {
    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Media engine call failed.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Signaling channel failure (closed channel, malformed frame).
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session token did not resolve to an identity.
    #[error("Unauthorized")]
    Unauthorized,

    /// Request denied by the authorization gate.
    #[error("Rejected by policy: {0}")]
    PolicyRejected(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Room was closed while the request was in flight.
    #[error("Room is closed")]
    RoomClosed,

    /// Participant not found in the room.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Transport id not owned by the requesting participant.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// Producer id not owned by the requesting participant.
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Consumer id not owned by the requesting participant.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Event arrived in a session state that does not accept it.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Worker pool is empty.
    #[error("No media workers available")]
    NoWorkers,

    /// A media worker terminated unexpectedly.
    #[error("Media worker {index} died: {reason}")]
    WorkerDied { index: usize, reason: String },

    /// Service is shutting down and not accepting new rooms.
    #[error("Service is draining")]
    Draining,

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the handling class for this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            SfuError::Unauthorized | SfuError::PolicyRejected(_) => ErrorClass::RejectedByPolicy,
            SfuError::Redis(_)
            | SfuError::Engine(_)
            | SfuError::Signaling(_)
            | SfuError::RoomNotFound(_)
            | SfuError::RoomClosed
            | SfuError::Draining
            | SfuError::Internal(_) => ErrorClass::Transient,
            SfuError::ParticipantNotFound(_)
            | SfuError::UnknownTransport(_)
            | SfuError::UnknownProducer(_)
            | SfuError::UnknownConsumer(_)
            | SfuError::InvalidState(_) => ErrorClass::InvariantViolation,
            SfuError::Config(_) | SfuError::NoWorkers | SfuError::WorkerDied { .. } => {
                ErrorClass::Fatal
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    ///
    /// Used as the WebSocket close reason when admission fails.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Unauthorized => "Invalid or expired session".to_string(),
            SfuError::PolicyRejected(_) => "Not permitted".to_string(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::RoomClosed => "Room closed, please reconnect".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::NoWorkers | SfuError::WorkerDied { .. } => {
                "Media service unavailable".to_string()
            }
            SfuError::Redis(_)
            | SfuError::Engine(_)
            | SfuError::Signaling(_)
            | SfuError::Config(_)
            | SfuError::ParticipantNotFound(_)
            | SfuError::UnknownTransport(_)
            | SfuError::UnknownProducer(_)
            | SfuError::UnknownConsumer(_)
            | SfuError::InvalidState(_)
            | SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        assert_eq!(SfuError::Unauthorized.class(), ErrorClass::RejectedByPolicy);
        assert_eq!(
            SfuError::PolicyRejected("speak".to_string()).class(),
            ErrorClass::RejectedByPolicy
        );

        assert_eq!(
            SfuError::Engine("consume failed".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SfuError::Redis("timeout".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(SfuError::RoomClosed.class(), ErrorClass::Transient);

        assert_eq!(
            SfuError::UnknownConsumer("c-1".to_string()).class(),
            ErrorClass::InvariantViolation
        );
        assert_eq!(
            SfuError::InvalidState("config twice".to_string()).class(),
            ErrorClass::InvariantViolation
        );

        assert_eq!(
            SfuError::WorkerDied {
                index: 0,
                reason: "SIGSEGV".to_string()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(SfuError::NoWorkers.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let redis_err = SfuError::Redis("connection refused at 10.0.0.7:6379".to_string());
        assert!(!redis_err.client_message().contains("10.0.0.7"));
        assert_eq!(redis_err.client_message(), "An internal error occurred");

        let engine_err = SfuError::Engine("router 3f2a closed".to_string());
        assert!(!engine_err.client_message().contains("3f2a"));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SfuError::UnknownTransport("t-9".to_string())),
            "Unknown transport: t-9"
        );
        assert_eq!(
            format!(
                "{}",
                SfuError::WorkerDied {
                    index: 2,
                    reason: "exit code 1".to_string()
                }
            ),
            "Media worker 2 died: exit code 1"
        );
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(ErrorClass::Transient.as_str(), "transient");
        assert_eq!(
            ErrorClass::InvariantViolation.as_str(),
            "invariant_violation"
        );
    }
}
