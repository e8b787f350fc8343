//! Error types for the broker-client contract.

use thiserror::Error;

/// Errors surfaced by send calls.
///
/// The transient/fatal split is the contract the engine's failure supervisor
/// classifies on: backends must map their native error codes onto it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The broker is momentarily unavailable (network blip, queue full,
    /// per-call timeout expired). Worth retrying.
    #[error("transient send failure: {reason}")]
    Transient { reason: String },

    /// The send can never succeed as issued (invalid destination, auth
    /// failure, protocol violation). Not worth retrying.
    #[error("fatal send failure: {reason}")]
    Fatal { reason: String },

    /// The producer, its session, or its connection was closed before the
    /// call. Misuse after teardown.
    #[error("producer used after close")]
    Closed,
}

impl SendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        SendError::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        SendError::Fatal {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced while establishing connections, sessions, or producers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The endpoint was unreachable but may come back; worth retrying with
    /// backoff.
    #[error("transient connect failure to {endpoint}: {reason}")]
    Transient { endpoint: String, reason: String },

    /// Connecting can never succeed as configured (bad credentials,
    /// unsupported scheme).
    #[error("fatal connect failure to {endpoint}: {reason}")]
    Fatal { endpoint: String, reason: String },

    /// The parent connection or session was already closed.
    #[error("connection used after close")]
    Closed,
}

impl ConnectError {
    pub fn transient(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError::Transient {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError::Fatal {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_display() {
        let err = SendError::transient("broker away");
        assert_eq!(err.to_string(), "transient send failure: broker away");
        assert_eq!(SendError::Closed.to_string(), "producer used after close");
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::fatal("kafka://x:9092", "auth rejected");
        assert_eq!(
            err.to_string(),
            "fatal connect failure to kafka://x:9092: auth rejected"
        );
    }
}
