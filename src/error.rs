//! Error types for the WebSocket core

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Invalid WebSocket frame
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in text message
    InvalidUtf8,
    /// Protocol violation
    Protocol(&'static str),
    /// Connection closed
    ConnectionClosed,
    /// Assembled message exceeds the configured maximum
    MessageTooLarge,
    /// Single frame exceeds the configured maximum
    FrameTooLarge,
    /// Invalid HTTP request or response
    InvalidHttp(&'static str),
    /// Opening handshake failed
    HandshakeFailed(&'static str),
    /// Operation is illegal in the current connection state
    InvalidState(&'static str),
    /// Invalid close code received on the wire
    InvalidCloseCode(u16),
    /// No processor is available for the requested protocol version
    UnsupportedVersion,
    /// Handshake timed out
    HandshakeTimeout,
}

/// Close frame code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (never sent on the wire)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (never sent on the wire)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a close code may legally appear on the wire
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Error {
    /// Map remote protocol errors to the RFC 6455 close code that reports them
    ///
    /// Returns `None` for errors that are not a remote protocol violation
    /// (transport errors, state errors), which terminate without a closing
    /// handshake.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::InvalidFrame(_) | Error::Protocol(_) | Error::InvalidCloseCode(_) => {
                Some(CloseReason::PROTOCOL_ERROR)
            }
            Error::InvalidUtf8 => Some(CloseReason::INVALID_PAYLOAD),
            Error::MessageTooLarge | Error::FrameTooLarge => Some(CloseReason::TOO_BIG),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::UnsupportedVersion => write!(f, "Unsupported WebSocket version"),
            Error::HandshakeTimeout => write!(f, "Handshake timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(1011));
        assert!(CloseReason::is_valid_code(3000));
        assert!(CloseReason::is_valid_code(4999));
        assert!(!CloseReason::is_valid_code(0));
        assert!(!CloseReason::is_valid_code(1004));
        assert!(!CloseReason::is_valid_code(1005));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(2999));
        assert!(!CloseReason::is_valid_code(5000));
    }

    #[test]
    fn protocol_errors_map_to_close_codes() {
        assert_eq!(Error::InvalidUtf8.close_code(), Some(1007));
        assert_eq!(Error::MessageTooLarge.close_code(), Some(1009));
        assert_eq!(Error::Protocol("x").close_code(), Some(1002));
        assert_eq!(Error::InvalidCloseCode(5000).close_code(), Some(1002));
        assert_eq!(Error::ConnectionClosed.close_code(), None);
    }
}
