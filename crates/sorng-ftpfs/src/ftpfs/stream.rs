//! Streams and channels over one data transfer.
//!
//! Closing a stream always runs, in order: close the data channel, read
//! the completion reply, delete the file if requested (only after a
//! successful completion), release the connection. The first failure is
//! returned and later ones are attached to it. A stream dropped without
//! `close` is finalized in the background.

use crate::ftpfs::connection::{Connection, Lease};
use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::wire::{DataReader, DataWriter};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

enum DataChannel {
    Reader(DataReader),
    Writer(DataWriter),
}

/// The part of a stream that owns the connection reference.
struct Transfer {
    lease: Option<Lease>,
    path: String,
    delete_on_close: bool,
}

fn record(first: &mut Option<FtpError>, result: FtpResult<()>) {
    if let Err(e) = result {
        match first {
            None => *first = Some(e),
            Some(primary) => primary.add_suppressed(e),
        }
    }
}

async fn complete(conn: &Arc<Connection>, path: &str) -> FtpResult<()> {
    let mut session = conn.session.lock().await;
    session.transfer_open = false;
    match session.client.complete_pending_command().await {
        Ok(reply) if reply.is_completion() => Ok(()),
        Ok(reply) => Err(FtpError::transfer_failed(format!(
            "Transfer of {} was not completed: {}",
            path,
            reply.text()
        ))
        .with_code(reply.code)
        .with_path(path)),
        Err(e) => {
            conn.mark_broken();
            Err(e.with_path(path))
        }
    }
}

async fn delete_file(lease: &Lease, path: &str) -> FtpResult<()> {
    let mut session = lease.connection().session.lock().await;
    let reply = session.client.remove_file(path).await?;
    if !reply.is_success() {
        return Err(lease.pool().mapper.delete(path, &reply, false));
    }
    log::debug!("Deleted {} on close", path);
    Ok(())
}

impl Transfer {
    fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    async fn finish(&mut self, channel: Option<DataChannel>) -> FtpResult<()> {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return Ok(()),
        };
        let mut first = None;

        match channel {
            Some(DataChannel::Writer(mut writer)) => {
                if let Err(e) = writer.shutdown().await {
                    record(&mut first, Err(FtpError::from(e).with_path(self.path.as_str())));
                }
            }
            Some(DataChannel::Reader(reader)) => drop(reader),
            None => {}
        }

        let completed = complete(lease.connection(), &self.path).await;
        let completed_ok = completed.is_ok();
        record(&mut first, completed);

        if completed_ok && self.delete_on_close {
            record(&mut first, delete_file(&lease, &self.path).await);
        }

        record(&mut first, lease.release().await);
        match first {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Drop path. Without a runtime the connection can only be flagged so
    /// the pool replaces it instead of reusing a session stuck mid-transfer.
    fn abandon(&mut self, channel: Option<DataChannel>) {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => return,
        };
        log::warn!("FTP stream for {} dropped without close", self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut transfer = Transfer {
                    lease: Some(lease),
                    path: self.path.clone(),
                    delete_on_close: self.delete_on_close,
                };
                handle.spawn(async move {
                    if let Err(e) = transfer.finish(channel).await {
                        log::warn!("Background finalization of {} failed: {}", transfer.path, e);
                    }
                });
            }
            Err(_) => {
                lease.connection().mark_broken();
                drop(channel);
                drop(lease);
            }
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "FTP stream is closed")
}

// ─── Read stream ─────────────────────────────────────────────────────

/// Incoming data of one `RETR`.
pub struct FtpReadStream {
    data: Option<DataReader>,
    transfer: Transfer,
}

impl FtpReadStream {
    pub(crate) fn new(lease: Lease, path: String, data: DataReader, delete_on_close: bool) -> Self {
        Self {
            data: Some(data),
            transfer: Transfer {
                lease: Some(lease),
                path,
                delete_on_close,
            },
        }
    }

    pub fn path(&self) -> &str {
        &self.transfer.path
    }

    pub fn is_open(&self) -> bool {
        self.transfer.is_open()
    }

    /// Finalize the transfer. Calling it again does nothing.
    pub async fn close(&mut self) -> FtpResult<()> {
        let channel = self.data.take().map(DataChannel::Reader);
        self.transfer.finish(channel).await
    }
}

impl AsyncRead for FtpReadStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.data.as_mut() {
            Some(data) => Pin::new(data).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl Drop for FtpReadStream {
    fn drop(&mut self) {
        let channel = self.data.take().map(DataChannel::Reader);
        self.transfer.abandon(channel);
    }
}

// ─── Write stream ────────────────────────────────────────────────────

/// Outgoing data of one `STOR` / `APPE`.
///
/// `shutdown` only flushes; the data channel is closed by `close`.
pub struct FtpWriteStream {
    data: Option<DataWriter>,
    transfer: Transfer,
}

impl FtpWriteStream {
    pub(crate) fn new(lease: Lease, path: String, data: DataWriter, delete_on_close: bool) -> Self {
        Self {
            data: Some(data),
            transfer: Transfer {
                lease: Some(lease),
                path,
                delete_on_close,
            },
        }
    }

    pub fn path(&self) -> &str {
        &self.transfer.path
    }

    pub fn is_open(&self) -> bool {
        self.transfer.is_open()
    }

    /// Finalize the transfer. Calling it again does nothing.
    pub async fn close(&mut self) -> FtpResult<()> {
        let channel = self.data.take().map(DataChannel::Writer);
        self.transfer.finish(channel).await
    }
}

impl AsyncWrite for FtpWriteStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.data.as_mut() {
            Some(data) => Pin::new(data).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.data.as_mut() {
            Some(data) => Pin::new(data).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl Drop for FtpWriteStream {
    fn drop(&mut self) {
        let channel = self.data.take().map(DataChannel::Writer);
        self.transfer.abandon(channel);
    }
}

// ─── Channel ─────────────────────────────────────────────────────────

enum ChannelInner {
    Read(FtpReadStream),
    Write(FtpWriteStream),
}

/// Sequential byte channel, either read-only or write-only. Seeking and
/// truncation are not available over FTP.
pub struct FtpChannel {
    inner: ChannelInner,
    position: u64,
    size: u64,
}

impl FtpChannel {
    pub(crate) fn reader(stream: FtpReadStream, size: u64) -> Self {
        Self {
            inner: ChannelInner::Read(stream),
            position: 0,
            size,
        }
    }

    pub(crate) fn writer(stream: FtpWriteStream, initial_position: u64) -> Self {
        Self {
            inner: ChannelInner::Write(stream),
            position: initial_position,
            size: initial_position,
        }
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.inner, ChannelInner::Read(_))
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.inner, ChannelInner::Write(_))
    }

    pub fn is_open(&self) -> bool {
        match &self.inner {
            ChannelInner::Read(s) => s.is_open(),
            ChannelInner::Write(s) => s.is_open(),
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Directory-entry size for read channels, bytes written so far for
    /// write channels.
    pub fn size(&self) -> u64 {
        match self.inner {
            ChannelInner::Read(_) => self.size,
            ChannelInner::Write(_) => self.size.max(self.position),
        }
    }

    pub fn set_position(&mut self, _position: u64) -> FtpResult<()> {
        Err(FtpError::unsupported("FTP channels do not support seeking"))
    }

    pub fn truncate(&mut self, _size: u64) -> FtpResult<()> {
        Err(FtpError::unsupported("FTP channels do not support truncation"))
    }

    /// Returns 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> FtpResult<usize> {
        match &mut self.inner {
            ChannelInner::Read(stream) => {
                let n = stream.read(buf).await?;
                self.position += n as u64;
                Ok(n)
            }
            ChannelInner::Write(_) => Err(FtpError::illegal_state("Channel is not readable")),
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> FtpResult<usize> {
        match &mut self.inner {
            ChannelInner::Write(stream) => {
                stream.write_all(buf).await?;
                self.position += buf.len() as u64;
                Ok(buf.len())
            }
            ChannelInner::Read(_) => Err(FtpError::illegal_state("Channel is not writable")),
        }
    }

    pub async fn close(&mut self) -> FtpResult<()> {
        match &mut self.inner {
            ChannelInner::Read(stream) => stream.close().await,
            ChannelInner::Write(stream) => {
                stream.flush().await?;
                stream.close().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftpfs::error::FtpErrorKind;
    use crate::ftpfs::mapper::DefaultErrorMapper;
    use crate::ftpfs::options::{OpenOption, OpenOptions};
    use crate::ftpfs::pool::ConnectionPool;
    use crate::ftpfs::simulated::SimulatedServer;
    use crate::ftpfs::types::FtpFileSystemConfig;
    use std::time::Duration;

    async fn pool(server: &SimulatedServer) -> ConnectionPool {
        let mut config = FtpFileSystemConfig::new("sim");
        config.client_connection_count = 1;
        ConnectionPool::new(config, Arc::new(server.clone()), Arc::new(DefaultErrorMapper))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn double_close_is_a_no_op() {
        let server = SimulatedServer::new();
        server.add_file("/a", b"data");
        let pool = pool(&server).await;
        let conn = pool.acquire().await.unwrap();
        let mut stream = conn
            .open_read("/a", &OpenOptions::for_new_input_stream(&[]).unwrap())
            .await
            .unwrap();
        conn.release().await.unwrap();

        stream.close().await.unwrap();
        let commands = server.commands().len();
        stream.close().await.unwrap();
        assert_eq!(server.commands().len(), commands);
        assert_eq!(server.completion_count(), 1);
        assert!(!stream.is_open());
    }

    #[tokio::test]
    async fn failed_completion_surfaces_and_still_releases() {
        let server = SimulatedServer::new();
        let pool = pool(&server).await;
        let conn = pool.acquire().await.unwrap();
        let mut stream = conn
            .open_write("/out", &OpenOptions::for_new_output_stream(&[]).unwrap())
            .await
            .unwrap();
        conn.release().await.unwrap();
        stream.write_all(b"x").await.unwrap();

        server.set_fail_completion(true);
        let err = stream.close().await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::TransferFailed);
        assert_eq!(err.code, Some(451));
        assert_eq!(err.path.as_deref(), Some("/out"));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn delete_on_close_runs_after_completion() {
        let server = SimulatedServer::new();
        server.add_file("/tmp.txt", b"scratch");
        let pool = pool(&server).await;
        let conn = pool.acquire().await.unwrap();
        let options = OpenOptions::for_new_input_stream(&[OpenOption::DeleteOnClose]).unwrap();
        let mut stream = conn.open_read("/tmp.txt", &options).await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        stream.close().await.unwrap();
        assert!(!server.exists("/tmp.txt"));
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_stream_is_finalized_in_background() {
        let server = SimulatedServer::new();
        server.add_file("/big", &[7u8; 1024]);
        let pool = pool(&server).await;
        let conn = pool.acquire().await.unwrap();
        let stream = conn
            .open_read("/big", &OpenOptions::for_new_input_stream(&[]).unwrap())
            .await
            .unwrap();
        conn.release().await.unwrap();
        drop(stream);

        let again = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.completion_count(), 1);
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn channel_tracks_position_and_rejects_seek() {
        let server = SimulatedServer::new();
        server.add_file("/c", b"0123456789");
        let pool = pool(&server).await;
        let conn = pool.acquire().await.unwrap();
        let stream = conn
            .open_read("/c", &OpenOptions::for_new_input_stream(&[]).unwrap())
            .await
            .unwrap();
        let mut channel = FtpChannel::reader(stream, 10);
        let mut buf = [0u8; 4];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(channel.position(), n as u64);
        assert_eq!(channel.size(), 10);
        assert!(channel.is_readable() && !channel.is_writable());
        assert_eq!(channel.set_position(0).unwrap_err().kind, FtpErrorKind::UnsupportedOption);
        assert_eq!(channel.truncate(0).unwrap_err().kind, FtpErrorKind::UnsupportedOption);
        assert!(channel.write(b"no").await.is_err());
        channel.close().await.unwrap();
        assert!(!channel.is_open());
        conn.release().await.unwrap();
    }
}
