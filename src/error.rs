//! Error taxonomy for the sync engine.
//!
//! DESIGN
//! ======
//! Four classes, each with its own propagation rule:
//! - `Connection` (transient) drives the reconnect backoff and only shows up
//!   in the UI as a non-fatal status flag.
//! - `Subscription` (permanent, e.g. access denied) tears the room down.
//! - `BroadcastFailure` is logged and never retried.
//! - `ChangeDecode` skips the single offending event.
//!
//! All variants carry owned strings so one error can be handed to every
//! waiting subscriber.

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Failures reported by a transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport timed out")]
    Timeout,
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("access denied: {0}")]
    Denied(String),
    #[error("channel closed")]
    Closed,
}

impl TransportError {
    /// A denial is permanent; everything else is worth a retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

// =============================================================================
// CHANGE DECODE
// =============================================================================

/// A change-feed payload that could not be turned into a `ChangeEvent`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed change payload on {syscall}: {reason}")]
pub struct ChangeDecodeError {
    pub syscall: String,
    pub reason: String,
}

impl ChangeDecodeError {
    pub fn new(syscall: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { syscall: syscall.into(), reason: reason.into() }
    }
}

// =============================================================================
// SYNC ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("connection error in room {room_id}: {reason}")]
    Connection { room_id: String, reason: String },
    #[error("subscription to room {room_id} rejected: {reason}")]
    Subscription { room_id: String, reason: String },
    #[error("broadcast on topic {topic} dropped: {reason}")]
    BroadcastFailure { topic: String, reason: String },
    #[error(transparent)]
    ChangeDecode(#[from] ChangeDecodeError),
    #[error("subscription to room {0} is no longer active")]
    Inactive(String),
}

impl SyncError {
    /// Map a transport failure onto the taxonomy for a given room.
    #[must_use]
    pub fn from_transport(room_id: &str, err: &TransportError) -> Self {
        if err.is_fatal() {
            Self::Subscription { room_id: room_id.to_owned(), reason: err.to_string() }
        } else {
            Self::Connection { room_id: room_id.to_owned(), reason: err.to_string() }
        }
    }

    /// Fatal errors require an explicit re-subscribe by the caller.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Subscription { .. } | Self::Inactive(_))
    }
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "E_CONNECTION",
            Self::Subscription { .. } => "E_SUBSCRIPTION_DENIED",
            Self::BroadcastFailure { .. } => "E_BROADCAST_DROPPED",
            Self::ChangeDecode(_) => "E_CHANGE_DECODE",
            Self::Inactive(_) => "E_HANDLE_INACTIVE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_maps_to_subscription_error() {
        let err = SyncError::from_transport("roof-1", &TransportError::Denied("no access".into()));
        assert!(matches!(err, SyncError::Subscription { .. }));
        assert!(err.is_fatal());
        assert!(!err.retryable());
        assert_eq!(err.error_code(), "E_SUBSCRIPTION_DENIED");
    }

    #[test]
    fn timeout_maps_to_retryable_connection_error() {
        let err = SyncError::from_transport("roof-1", &TransportError::Timeout);
        assert!(matches!(err, SyncError::Connection { .. }));
        assert!(!err.is_fatal());
        assert!(err.retryable());
        assert_eq!(err.error_code(), "E_CONNECTION");
    }

    #[test]
    fn decode_error_converts_and_keeps_message() {
        let err: SyncError = ChangeDecodeError::new("change:pin", "missing after").into();
        assert_eq!(err.error_code(), "E_CHANGE_DECODE");
        assert_eq!(err.to_string(), "malformed change payload on change:pin: missing after");
    }
}
