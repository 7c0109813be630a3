//! Capability contract of one FTP session.
//!
//! The pool and the file system only talk to the server through these
//! traits; `client::FtpWireClient` is the network implementation and
//! `simulated::SimulatedWireClient` the in-memory one.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::types::{FileStructure, FileTransferMode, FileType, FtpEntry, FtpFileSystemConfig, FtpReply};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

/// Incoming data channel of a `RETR`.
pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;
/// Outgoing data channel of a `STOR` / `APPE`.
pub type DataWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One authenticated session.
///
/// Transport failures are `Err`. A command the server refused is an `Ok`
/// reply with a 4xx/5xx code; operations that return data wrap the
/// refusal as `Ok(Err(reply))`.
#[async_trait]
pub trait WireClient: Send {
    async fn file_type(&mut self, file_type: FileType) -> FtpResult<FtpReply>;
    async fn file_structure(&mut self, structure: FileStructure) -> FtpResult<FtpReply>;
    async fn transfer_mode(&mut self, mode: FileTransferMode) -> FtpResult<FtpReply>;
    async fn noop(&mut self) -> FtpResult<FtpReply>;
    async fn pwd(&mut self) -> FtpResult<FtpReply>;
    async fn make_directory(&mut self, path: &str) -> FtpResult<FtpReply>;
    async fn remove_file(&mut self, path: &str) -> FtpResult<FtpReply>;
    async fn remove_directory(&mut self, path: &str) -> FtpResult<FtpReply>;
    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<FtpReply>;
    /// `MDTM`.
    async fn modification_time(&mut self, path: &str) -> FtpResult<FtpReply>;
    async fn retrieve(&mut self, path: &str) -> FtpResult<Result<DataReader, FtpReply>>;
    async fn store(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>>;
    async fn append(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>>;
    /// Read the completion reply of the last data transfer. Must be called
    /// once after the data channel of `retrieve`/`store`/`append` closed.
    async fn complete_pending_command(&mut self) -> FtpResult<FtpReply>;
    /// Raw listing of `path`, `.` and `..` rows included when the server
    /// reports them.
    async fn list(&mut self, path: &str) -> FtpResult<Result<Vec<FtpEntry>, FtpReply>>;
    /// `QUIT` and close the control connection.
    async fn disconnect(&mut self) -> FtpResult<()>;
}

/// Creates authenticated sessions for the pool.
#[async_trait]
pub trait WireClientFactory: Send + Sync {
    async fn connect(&self, config: &FtpFileSystemConfig) -> FtpResult<Box<dyn WireClient>>;
}

/// Extract the quoted directory of a `257 "/path" ...` reply. Embedded
/// quotes are doubled.
pub fn parse_quoted_path(reply: &FtpReply) -> FtpResult<String> {
    let text = reply.text();
    let start = text
        .find('"')
        .ok_or_else(|| FtpError::protocol_error(format!("No quoted path in reply: {}", text)))?;
    let mut out = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Ok(out);
            }
        } else {
            out.push(c);
        }
    }
    Err(FtpError::protocol_error(format!("Unterminated quoted path in reply: {}", text)))
}

/// Parse an `MDTM` reply (`213 YYYYMMDDHHMMSS[.sss]`).
pub fn parse_mdtm(reply: &FtpReply) -> Option<DateTime<Utc>> {
    let text = reply.text();
    let value = text.get(4..)?.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (value, None),
    };
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;
    let mut dt = Utc.from_utc_datetime(&naive);
    if let Some(fraction) = fraction {
        let digits: String = fraction.chars().take(3).collect();
        let millis: i64 = format!("{:0<3}", digits).parse().ok()?;
        dt += chrono::Duration::milliseconds(millis);
    }
    Some(dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn quoted_path() {
        let reply = FtpReply::new(257, "\"/home/user\" is the current directory");
        assert_eq!(parse_quoted_path(&reply).unwrap(), "/home/user");
        let reply = FtpReply::new(257, "\"/a \"\"b\"\"\" created");
        assert_eq!(parse_quoted_path(&reply).unwrap(), "/a \"b\"");
        assert!(parse_quoted_path(&FtpReply::new(257, "no quotes")).is_err());
    }

    #[test]
    fn mdtm_reply() {
        let dt = parse_mdtm(&FtpReply::new(213, "20240315123045")).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2024, 3, 15));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (12, 30, 45));
        let dt = parse_mdtm(&FtpReply::new(213, "20240315123045.25")).unwrap();
        assert_eq!(dt.timestamp_subsec_millis(), 250);
        assert!(parse_mdtm(&FtpReply::new(213, "garbage")).is_none());
    }
}
