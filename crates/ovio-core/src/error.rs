//! Error types for the ovio completion engine.
//!
//! Every failure surfaces as one [`OvioError`]. Each variant carries a
//! human-readable message (its `Display`) and a numeric code from
//! [`OvioError::code`]: the OS errno for native failures, a stable value
//! from [`codes`] for everything the crate detects itself.

use thiserror::Error;

/// Result type for ovio operations
pub type Result<T> = std::result::Result<T, OvioError>;

/// Crate-defined numeric codes for errors that have no errno.
pub mod codes {
    pub const PROTOCOL: i32 = 6001;
    pub const REDIRECTED: i32 = 6002;
    pub const INVALID_STATE: i32 = 6003;
    pub const CAPACITY: i32 = 6004;
    pub const VALIDATION: i32 = 6005;
    pub const CHANNEL_BUSY: i32 = 6006;
    pub const BROKEN_CHANNEL: i32 = 6007;
    pub const ACCESS_DENIED: i32 = 6008;
    pub const TIMEOUT: i32 = 6009;
    pub const ABORTED: i32 = 6010;
    pub const UNSUPPORTED: i32 = 6011;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OvioError {
    /// A system call failed with `code` (errno).
    #[error("{context} failed (os error {code})")]
    Native { context: String, code: i32 },

    /// The peer violated the wire protocol (bad status, unknown frame).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The upgrade request was answered with a redirect.
    #[error("redirected with HTTP status {status}")]
    Redirected { status: u16 },

    /// Operation requested in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Message or resource exceeds the configured capacity.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Argument rejected before any side effect happened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Every instance of the channel is occupied.
    #[error("channel busy: {0}")]
    ChannelBusy(String),

    /// Peer went away mid-operation.
    #[error("broken channel: {0}")]
    BrokenChannel(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled or severed by a close.
    #[error("operation aborted")]
    Aborted,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl OvioError {
    /// Classify an errno returned by `context` into an error kind.
    pub fn from_errno(context: impl Into<String>, errno: i32) -> Self {
        let context = context.into();
        match errno {
            libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN | libc::ESHUTDOWN => {
                OvioError::BrokenChannel(format!("{}: {}", context, describe_errno(errno)))
            }
            libc::EACCES | libc::EPERM => {
                OvioError::AccessDenied(format!("{}: {}", context, describe_errno(errno)))
            }
            libc::EMSGSIZE => {
                OvioError::Capacity(format!("{}: {}", context, describe_errno(errno)))
            }
            libc::ETIMEDOUT => OvioError::Timeout(context),
            libc::ECANCELED => OvioError::Aborted,
            code => OvioError::Native { context, code },
        }
    }

    /// Capture `errno` of the calling thread for the failed `context`.
    pub fn last_os_error(context: impl Into<String>) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::from_errno(context, errno)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        OvioError::InvalidState(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        OvioError::Validation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        OvioError::Protocol(msg.into())
    }

    /// Numeric code for diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            OvioError::Native { code, .. } => *code,
            OvioError::Protocol(_) => codes::PROTOCOL,
            OvioError::Redirected { .. } => codes::REDIRECTED,
            OvioError::InvalidState(_) => codes::INVALID_STATE,
            OvioError::Capacity(_) => codes::CAPACITY,
            OvioError::Validation(_) => codes::VALIDATION,
            OvioError::ChannelBusy(_) => codes::CHANNEL_BUSY,
            OvioError::BrokenChannel(_) => codes::BROKEN_CHANNEL,
            OvioError::AccessDenied(_) => codes::ACCESS_DENIED,
            OvioError::Timeout(_) => codes::TIMEOUT,
            OvioError::Aborted => codes::ABORTED,
            OvioError::Unsupported(_) => codes::UNSUPPORTED,
        }
    }

    /// Errors a caller may reasonably retry after waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OvioError::ChannelBusy(_) | OvioError::Timeout(_))
    }
}

impl From<std::io::Error> for OvioError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => OvioError::from_errno("io", errno),
            None => match err.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    OvioError::BrokenChannel("unexpected end of stream".into())
                }
                std::io::ErrorKind::TimedOut => OvioError::Timeout(err.to_string()),
                std::io::ErrorKind::InvalidData => OvioError::Protocol(err.to_string()),
                _ => OvioError::Native { context: err.to_string(), code: libc::EIO },
            },
        }
    }
}

fn describe_errno(code: i32) -> String {
    std::io::Error::from_raw_os_error(code).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        assert!(matches!(OvioError::from_errno("send", libc::EPIPE), OvioError::BrokenChannel(_)));
        assert!(matches!(OvioError::from_errno("connect", libc::EACCES), OvioError::AccessDenied(_)));
        assert!(matches!(OvioError::from_errno("send", libc::EMSGSIZE), OvioError::Capacity(_)));
        assert_eq!(OvioError::from_errno("x", libc::ECANCELED), OvioError::Aborted);

        let err = OvioError::from_errno("bind", libc::EADDRINUSE);
        assert_eq!(err.code(), libc::EADDRINUSE);
        assert!(err.to_string().starts_with("bind failed"));
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            OvioError::protocol("p"),
            OvioError::Redirected { status: 302 },
            OvioError::invalid_state("s"),
            OvioError::Capacity("c".into()),
            OvioError::validation("v"),
            OvioError::ChannelBusy("b".into()),
            OvioError::BrokenChannel("x".into()),
            OvioError::AccessDenied("a".into()),
            OvioError::Timeout("t".into()),
            OvioError::Aborted,
            OvioError::Unsupported("u".into()),
        ];
        let mut seen: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), errors.len());
    }

    #[test]
    fn test_retryable() {
        assert!(OvioError::ChannelBusy("pipe".into()).is_retryable());
        assert!(!OvioError::AccessDenied("pipe".into()).is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let err: OvioError = std::io::Error::from_raw_os_error(libc::ECONNRESET).into();
        assert!(matches!(err, OvioError::BrokenChannel(_)));

        let err: OvioError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, OvioError::BrokenChannel(_)));
    }
}
