//! Translation of refused FTP commands into typed errors.

use crate::ftpfs::error::{FtpError, FtpErrorKind};
use crate::ftpfs::types::FtpReply;

/// Turns a `(path, reply)` pair from a refused command into an `FtpError`.
/// One method per operation family so a server-specific mapping can be
/// plugged in.
pub trait ErrorMapper: Send + Sync {
    /// Directory listing / entry lookup.
    fn get_file(&self, path: &str, reply: &FtpReply) -> FtpError;
    fn create_directory(&self, path: &str, reply: &FtpReply) -> FtpError;
    fn delete(&self, path: &str, reply: &FtpReply, is_directory: bool) -> FtpError;
    fn open_read(&self, path: &str, reply: &FtpReply) -> FtpError;
    fn open_write(&self, path: &str, reply: &FtpReply) -> FtpError;
    fn copy(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError;
    fn rename(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError;
    fn move_path(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError;
}

/// Classifies by reply code and text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorMapper;

fn is_access_denied(reply: &FtpReply) -> bool {
    if matches!(reply.code, 530 | 532) {
        return true;
    }
    let text = reply.text().to_lowercase();
    text.contains("permission") || text.contains("denied")
}

fn is_missing(reply: &FtpReply) -> bool {
    matches!(reply.code, 450 | 550)
}

fn rejected(path: &str, reply: &FtpReply) -> FtpError {
    FtpError::command_rejected(reply.code, reply.text()).with_path(path)
}

fn classify(kind: FtpErrorKind, path: &str, reply: &FtpReply) -> FtpError {
    FtpError::new(kind, reply.text())
        .with_code(reply.code)
        .with_path(path)
}

impl ErrorMapper for DefaultErrorMapper {
    fn get_file(&self, path: &str, reply: &FtpReply) -> FtpError {
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, path, reply)
        } else if is_missing(reply) {
            classify(FtpErrorKind::NotFound, path, reply)
        } else {
            rejected(path, reply)
        }
    }

    fn create_directory(&self, path: &str, reply: &FtpReply) -> FtpError {
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, path, reply)
        } else if reply.text().to_lowercase().contains("exist") {
            classify(FtpErrorKind::AlreadyExists, path, reply)
        } else {
            rejected(path, reply)
        }
    }

    fn delete(&self, path: &str, reply: &FtpReply, is_directory: bool) -> FtpError {
        let text = reply.text().to_lowercase();
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, path, reply)
        } else if is_directory && text.contains("not empty") {
            classify(FtpErrorKind::DirectoryNotEmpty, path, reply)
        } else {
            rejected(path, reply)
        }
    }

    fn open_read(&self, path: &str, reply: &FtpReply) -> FtpError {
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, path, reply)
        } else if is_missing(reply) {
            classify(FtpErrorKind::NotFound, path, reply)
        } else {
            rejected(path, reply)
        }
    }

    fn open_write(&self, path: &str, reply: &FtpReply) -> FtpError {
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, path, reply)
        } else {
            rejected(path, reply)
        }
    }

    fn copy(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError {
        rejected(source, reply).with_other_path(target)
    }

    fn rename(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError {
        if is_access_denied(reply) {
            classify(FtpErrorKind::AccessDenied, source, reply).with_other_path(target)
        } else {
            rejected(source, reply).with_other_path(target)
        }
    }

    fn move_path(&self, source: &str, target: &str, reply: &FtpReply) -> FtpError {
        self.rename(source, target, reply)
    }
}
