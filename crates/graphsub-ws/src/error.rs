//! Error types for the WebSocket transport.

use std::fmt;
use thiserror::Error;

/// Result type for transport operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur while exchanging messages on a connection.
#[derive(Debug, Error)]
pub enum WsError {
    /// The peer closed the connection normally (or without a status code).
    #[error("websocket connection closed")]
    ConnClosed,

    /// An inbound frame was not well-formed JSON or did not carry a
    /// recognised message type.
    #[error("invalid message received")]
    InvalidMessage,

    /// A read did not complete within its deadline.
    #[error("read timeout")]
    ReadTimeout,

    /// The peer closed the connection with a non-normal close code.
    #[error("connection closed by peer: {code} {reason}")]
    CloseFrame {
        /// The close code from the peer's close frame.
        code: u16,
        /// The close reason from the peer's close frame.
        reason: String,
    },

    /// The upgrade negotiated a subprotocol this transport does not speak.
    #[error("unsupported negotiated subprotocol {0}")]
    UnsupportedSubprotocol(String),

    /// A message could not be encoded for the negotiated dialect.
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    /// The HTTP request was not a valid WebSocket upgrade request.
    #[error("not a websocket upgrade request: {0}")]
    NotWebsocketRequest(String),

    /// An underlying socket-level failure.
    #[error("websocket transport error: {0}")]
    Tungstenite(#[from] tungstenite::Error),
}

impl WsError {
    /// Whether this is the normalised "connection closed" error.
    pub fn is_conn_closed(&self) -> bool {
        matches!(self, Self::ConnClosed)
    }

    /// The close code carried by a passed-through close frame.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::CloseFrame { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A read- or write-side fault reported to the error hook.
#[derive(Debug)]
pub struct WebsocketError {
    /// The underlying transport error.
    pub error: WsError,
    /// Whether the fault occurred on the read side of the socket.
    pub is_read_error: bool,
}

impl fmt::Display for WebsocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_read_error {
            write!(f, "websocket read: {}", self.error)
        } else {
            write!(f, "websocket write: {}", self.error)
        }
    }
}

impl std::error::Error for WebsocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Close code for WebSocket close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Internal error (1011).
    InternalError = 1011,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1011 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_roundtrip() {
        assert_eq!(CloseCode::from_u16(1000), Some(CloseCode::Normal));
        assert_eq!(CloseCode::from_u16(1002), Some(CloseCode::Protocol));
        assert_eq!(CloseCode::from_u16(4400), None);
        assert_eq!(CloseCode::Abnormal.as_u16(), 1006);
    }

    #[test]
    fn test_websocket_error_display_read() {
        let err = WebsocketError {
            error: WsError::ReadTimeout,
            is_read_error: true,
        };
        assert_eq!(err.to_string(), "websocket read: read timeout");
    }

    #[test]
    fn test_websocket_error_display_write() {
        let err = WebsocketError {
            error: WsError::EncodeFailed("bad frame".into()),
            is_read_error: false,
        };
        assert_eq!(
            err.to_string(),
            "websocket write: failed to encode message: bad frame"
        );
    }

    #[test]
    fn test_close_code_accessor() {
        let err = WsError::CloseFrame {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(err.close_code(), Some(1006));
        assert_eq!(WsError::ConnClosed.close_code(), None);
        assert!(WsError::ConnClosed.is_conn_closed());
    }
}
