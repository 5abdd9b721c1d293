//! # Error Taxonomy
//!
//! Failures inside a run fall into four classes, and the class decides what
//! happens next:
//!
//! - **Auth**: login/registration failed. The agent stops.
//! - **Room**: a REST room call failed. The agent stops (room-info excepted),
//!   and the failure never reaches the backpressure governor.
//! - **Connection**: the event transport could not be opened or the room
//!   could not be joined over it. The agent stops and the governor hears
//!   about it.
//! - **Message**: a send or an inbound error event during messaging. Logged
//!   and counted; the agent keeps going while its transport is open.
//!
//! Errors are converted to counter increments inside the agent that hit them.
//! The only run-wide escalation is the governor's trip limit.

use thiserror::Error;

/// Failure reported by a REST call against the system under test.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The server answered with a non-success status code.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The request did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The request could not be sent or the response could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// True when the server does not know the account (login falls back to
    /// registration on these).
    pub fn is_unknown_account(&self) -> bool {
        matches!(self, ApiError::Status { status: 401 | 404, .. })
    }
}

/// Failure on the duplex event transport.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The server rejected the handshake (`connect_error`).
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// The handshake did not finish within the connect timeout.
    #[error("connection timed out")]
    Timeout,

    /// Low-level socket failure while connecting or talking.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The channel was already closed when an emit was attempted.
    #[error("channel closed")]
    Closed,

    /// The outbound queue was full; the transport is not draining it.
    #[error("outbound queue full")]
    Backlogged,
}

/// The four failure classes an agent can hit.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("authentication failed: {0}")]
    Auth(#[source] ApiError),

    #[error("room operation failed: {0}")]
    Room(#[source] ApiError),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("message failed: {0}")]
    Message(String),
}

/// Counter bucket an error is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Auth,
    Room,
    Connection,
    Message,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Auth(_) => ErrorKind::Auth,
            AgentError::Room(_) => ErrorKind::Room,
            AgentError::Connection(_) => ErrorKind::Connection,
            AgentError::Message(_) => ErrorKind::Message,
        }
    }

    /// Whether this failure is evidence of transport overload.
    pub fn feeds_backpressure(&self) -> bool {
        matches!(self, AgentError::Connection(_))
    }
}

impl From<ChannelError> for AgentError {
    fn from(err: ChannelError) -> Self {
        AgentError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_account_statuses() {
        let not_found = ApiError::Status {
            status: 404,
            message: "no such user".into(),
        };
        let unauthorized = ApiError::Status {
            status: 401,
            message: "bad credentials".into(),
        };
        let server = ApiError::Status {
            status: 500,
            message: "boom".into(),
        };

        assert!(not_found.is_unknown_account());
        assert!(unauthorized.is_unknown_account());
        assert!(!server.is_unknown_account());
        assert!(!ApiError::Timeout.is_unknown_account());
    }

    #[test]
    fn test_only_connection_errors_feed_backpressure() {
        assert!(AgentError::Connection("refused".into()).feeds_backpressure());
        assert!(!AgentError::Room(ApiError::Timeout).feeds_backpressure());
        assert!(!AgentError::Auth(ApiError::Timeout).feeds_backpressure());
        assert!(!AgentError::Message("rejected".into()).feeds_backpressure());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AgentError::Auth(ApiError::Timeout).kind(), ErrorKind::Auth);
        assert_eq!(
            AgentError::from(ChannelError::Timeout).kind(),
            ErrorKind::Connection
        );
    }
}
