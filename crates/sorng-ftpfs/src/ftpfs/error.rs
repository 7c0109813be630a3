//! FTP file system error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised FTP error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Remote path the failed operation was addressing.
    pub path: Option<String>,
    /// Second path for two-path operations (copy, move, rename).
    pub other_path: Option<String>,
    /// Secondary failures collected while tearing down sessions.
    #[serde(default)]
    pub suppressed: Vec<FtpError>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// No entry exists at the path.
    NotFound,
    /// An entry already exists at the path.
    AlreadyExists,
    /// The path exists but is not a directory.
    NotDirectory,
    /// The path exists but is not a symbolic link.
    NotLink,
    /// A directory was given where a file was expected.
    IsDirectory,
    /// Directory could not be removed because it has children.
    DirectoryNotEmpty,
    /// Permission denied on the server.
    AccessDenied,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Transfer aborted, incomplete, or finalization failed.
    TransferFailed,
    /// No pooled session became available within the wait timeout.
    PoolTimeout,
    /// A blocked acquisition was interrupted.
    Interrupted,
    /// The pool (or file system) has been closed.
    PoolClosed,
    /// API misuse, e.g. a dialect used before initialization.
    IllegalState,
    /// Option not supported by this file system.
    UnsupportedOption,
    /// Invalid or conflicting arguments.
    IllegalArgument,
    /// A path from a different kind of file system was supplied.
    ProviderMismatch,
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// AUTH TLS / TLS handshake failure.
    TlsFailed,
    /// Wrong username/password.
    AuthFailed,
    /// Data channel could not be established (PASV/PORT failed).
    DataChannelFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// Session is disconnected / dropped.
    Disconnected,
    /// Operation timed out.
    Timeout,
    /// Local I/O error.
    Io,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Catch-all.
    Unknown,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            path: None,
            other_path: None,
            suppressed: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_other_path(mut self, path: impl Into<String>) -> Self {
        self.other_path = Some(path.into());
        self
    }

    /// Attach a secondary error that must not mask this one.
    pub fn add_suppressed(&mut self, other: FtpError) {
        self.suppressed.push(other);
    }

    pub fn with_suppressed(mut self, other: FtpError) -> Self {
        self.add_suppressed(other);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn not_found(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::NotFound, format!("No such file or directory: {}", path))
            .with_path(path)
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::AlreadyExists, format!("File already exists: {}", path))
            .with_path(path)
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::NotDirectory, format!("Not a directory: {}", path)).with_path(path)
    }

    pub fn not_link(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::NotLink, format!("Not a symbolic link: {}", path)).with_path(path)
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::IsDirectory, format!("Is a directory: {}", path)).with_path(path)
    }

    pub fn access_denied(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(FtpErrorKind::AccessDenied, format!("Access denied: {}", path)).with_path(path)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn pool_timeout(waited_ms: u64) -> Self {
        Self::new(
            FtpErrorKind::PoolTimeout,
            format!("No FTP connection became available within {} ms", waited_ms),
        )
    }

    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Interrupted, msg)
    }

    pub fn pool_closed() -> Self {
        Self::new(FtpErrorKind::PoolClosed, "FTP connection pool is closed")
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IllegalState, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::UnsupportedOption, msg)
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IllegalArgument, msg)
    }

    pub fn provider_mismatch(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProviderMismatch, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Io, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Classify a login / session-level reply code. Path-level replies go
    /// through the `ErrorMapper` instead.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 | 532 => FtpErrorKind::AuthFailed,
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            _ if code >= 400 => FtpErrorKind::CommandRejected,
            _ => FtpErrorKind::Unknown,
        };
        Self::new(kind, text).with_code(code)
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)?;
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)?;
        }
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::Interrupted => Self::interrupted(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<FtpError> for std::io::Error {
    fn from(e: FtpError) -> Self {
        let kind = match e.kind {
            FtpErrorKind::NotFound => std::io::ErrorKind::NotFound,
            FtpErrorKind::AlreadyExists => std::io::ErrorKind::AlreadyExists,
            FtpErrorKind::AccessDenied => std::io::ErrorKind::PermissionDenied,
            FtpErrorKind::Timeout | FtpErrorKind::PoolTimeout => std::io::ErrorKind::TimedOut,
            FtpErrorKind::Interrupted => std::io::ErrorKind::Interrupted,
            FtpErrorKind::UnsupportedOption => std::io::ErrorKind::Unsupported,
            FtpErrorKind::IllegalArgument => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.message
    }
}

impl From<rustls::Error> for FtpError {
    fn from(e: rustls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_suppressed() {
        let err = FtpError::command_rejected(550, "nope")
            .with_suppressed(FtpError::disconnected("gone"));
        assert_eq!(err.to_string(), "[FTP CommandRejected 550] nope (1 suppressed)");
    }

    #[test]
    fn reply_classification() {
        assert_eq!(FtpError::from_reply(530, "Login incorrect").kind, FtpErrorKind::AuthFailed);
        assert_eq!(FtpError::from_reply(421, "bye").kind, FtpErrorKind::Disconnected);
        assert_eq!(FtpError::from_reply(426, "aborted").kind, FtpErrorKind::DataChannelFailed);
        assert_eq!(FtpError::from_reply(500, "?").kind, FtpErrorKind::CommandRejected);
    }

    #[test]
    fn io_round_trip_keeps_kind() {
        let io: std::io::Error = FtpError::not_found("/a").into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
        let back: FtpError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(back.kind, FtpErrorKind::Timeout);
    }
}
