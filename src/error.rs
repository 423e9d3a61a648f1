//! Error types for the WebSocket server

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error for everything that can go wrong on a connection.
///
/// Two kinds flow through the core: transport errors (an errno from the
/// socket layer) and protocol errors bound to a wire-level reply. The
/// single catch site in the client inspects [`Error::close_code`] and
/// [`Error::http_status`] to decide what, if anything, goes on the wire
/// before teardown.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket, errno included
    Io(io::Error),
    /// Protocol violation, echoed to the peer as a CLOSE frame
    Ws {
        /// RFC 6455 close code (>= 1000)
        code: u16,
        /// Human-readable reason, also sent as the close reason
        reason: &'static str,
    },
    /// Handshake failure, echoed to the peer as an HTTP status line
    Http {
        /// HTTP status code
        status: u16,
        /// Which handshake check failed
        reason: &'static str,
    },
    /// Programmer error; never turns into wire traffic
    InvalidUsage(&'static str),
}

impl Error {
    /// Protocol violation bound to an RFC 6455 close code
    #[inline]
    pub fn ws(code: u16, reason: &'static str) -> Self {
        Error::Ws { code, reason }
    }

    /// Handshake failure bound to an HTTP status
    #[inline]
    pub fn http(status: u16, reason: &'static str) -> Self {
        Error::Http { status, reason }
    }

    /// The close code to echo on the wire, if this error carries one
    #[inline]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Ws { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The HTTP status to echo during the handshake, if any
    #[inline]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The reason text that accompanies a wire-level reply
    pub fn reason(&self) -> &str {
        match self {
            Error::Io(_) => "",
            Error::Ws { reason, .. } => reason,
            Error::Http { reason, .. } => reason,
            Error::InvalidUsage(msg) => msg,
        }
    }
}

/// Close frame reason: a code plus optional text
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
    /// Endpoint is going away
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Data type the endpoint does not handle
    pub const UNHANDLED_DATA: u16 = 1003;
    /// Payload inconsistent with message type (bad UTF-8)
    pub const BAD_DATA: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Frame or message too large
    pub const TOO_LARGE: u16 = 1009;
    /// Missing expected extension
    pub const EXPECTATION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a code received on the wire is permitted by RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Ws { code, reason } => write!(f, "protocol error {}: {}", code, reason),
            Error::Http { status, reason } => write!(f, "handshake error {}: {}", status, reason),
            Error::InvalidUsage(msg) => write!(f, "invalid usage: {}", msg),
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
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_extraction() {
        let err = Error::ws(CloseReason::TOO_LARGE, "frame too large");
        assert_eq!(err.close_code(), Some(1009));
        assert_eq!(err.http_status(), None);

        let err = Error::http(413, "handshake too large");
        assert_eq!(err.close_code(), None);
        assert_eq!(err.http_status(), Some(413));

        let err = Error::from(io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.close_code(), None);
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_valid_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(1011));
        assert!(CloseReason::is_valid_code(3000));
        assert!(CloseReason::is_valid_code(4999));
        assert!(!CloseReason::is_valid_code(999));
        assert!(!CloseReason::is_valid_code(1004));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(5000));
    }
}
