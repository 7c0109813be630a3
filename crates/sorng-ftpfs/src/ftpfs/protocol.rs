//! Control-channel codec (RFC 959 §4).
//!
//! Sends CRLF-terminated commands and reads single- and multi-line
//! replies, over plain TCP or a TLS session.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::types::FtpReply;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Read half of the control connection.
pub enum ReadHalf {
    Plain(BufReader<OwnedReadHalf>),
    Tls(BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>),
}

/// Write half of the control connection.
pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

pub struct FtpCodec {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
    /// Socket addresses of the control connection, used to pick data
    /// channel endpoints.
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (rd, wr) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(BufReader::new(rd)),
            writer: WriteHalf::Plain(wr),
            local_addr,
            peer_addr,
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>) -> Self {
        let local_addr = stream.get_ref().0.local_addr().ok();
        let peer_addr = stream.get_ref().0.peer_addr().ok();
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: ReadHalf::Tls(BufReader::new(rd)),
            writer: WriteHalf::Tls(wr),
            local_addr,
            peer_addr,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.writer, WriteHalf::Tls(_))
    }

    /// Send one command; CRLF is appended here.
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.writer {
            WriteHalf::Plain(w) => w.write_all(line.as_bytes()).await?,
            WriteHalf::Tls(w) => {
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    /// Read one complete reply, following `NNN-` continuation lines up to
    /// the closing `NNN ` line.
    pub async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let reply = match &mut self.reader {
            ReadHalf::Plain(r) => read_reply_from(r).await?,
            ReadHalf::Tls(r) => read_reply_from(r).await?,
        };
        log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or_default());
        Ok(reply)
    }

    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.send_command(cmd).await?;
        self.read_reply().await
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        let reply = self.execute(cmd).await?;
        if !reply.is_completion() {
            return Err(FtpError::from_reply(reply.code, &reply.text()));
        }
        Ok(reply)
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> FtpResult<String> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(FtpError::disconnected("Server closed the control connection"));
    }
    let len = line.trim_end_matches(|c| c == '\r' || c == '\n').len();
    line.truncate(len);
    Ok(line)
}

async fn read_reply_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> FtpResult<FtpReply> {
    let first = next_line(reader).await?;
    let code = parse_code(&first)?;
    let multi_line = first.as_bytes().get(3) == Some(&b'-');
    let mut lines = vec![first];
    if multi_line {
        let closing = format!("{} ", code);
        let bare = code.to_string();
        loop {
            let line = next_line(reader).await?;
            let done = line.starts_with(&closing) || line == bare;
            lines.push(line);
            if done {
                break;
            }
        }
    }
    Ok(FtpReply { code, lines })
}

fn parse_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes() {
        assert_eq!(parse_code("220 ready").unwrap(), 220);
        assert_eq!(parse_code("150-opening").unwrap(), 150);
        assert!(parse_code("22").is_err());
        assert!(parse_code("abc def").is_err());
    }

    #[tokio::test]
    async fn multi_line_reply_runs_to_closing_code() {
        let mut wire: &[u8] = b"211-Features:\r\n MLSD\r\n 211-ish line\r\n211 End\r\n200 next\r\n";
        let reply = read_reply_from(&mut wire).await.unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.lines[3], "211 End");
        let next = read_reply_from(&mut wire).await.unwrap();
        assert_eq!(next.code, 200);
    }

    #[tokio::test]
    async fn eof_is_a_disconnect() {
        let mut wire: &[u8] = b"";
        let err = read_reply_from(&mut wire).await.unwrap_err();
        assert_eq!(err.kind, crate::ftpfs::error::FtpErrorKind::Disconnected);
    }
}
