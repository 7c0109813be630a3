//! Pooled sessions.
//!
//! A `Connection` wraps one `WireClient` together with its cached transfer
//! options and a reference count. Every holder (the `PooledConnection`
//! handed out by the pool and every open stream) owns a `Lease`; the
//! connection goes back to the pool, or is disconnected when transient,
//! once the last lease is released.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::mapper::ErrorMapper;
use crate::ftpfs::options::{OpenOptions, TransferOptions};
use crate::ftpfs::pool::PoolShared;
use crate::ftpfs::stream::{FtpReadStream, FtpWriteStream};
use crate::ftpfs::types::{FileStructure, FileTransferMode, FileType, FtpEntry, FtpFileSystemConfig, FtpReply};
use crate::ftpfs::wire::{parse_mdtm, parse_quoted_path, WireClient};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Mutable per-session state. Only touched by whoever holds the
/// connection.
pub(crate) struct Session {
    pub(crate) client: Box<dyn WireClient>,
    file_type: FileType,
    file_structure: FileStructure,
    file_transfer_mode: FileTransferMode,
    /// A data transfer has been started and not yet completed.
    pub(crate) transfer_open: bool,
}

impl Session {
    /// RFC 959 defaults, which is what a fresh server session starts with.
    fn new(client: Box<dyn WireClient>) -> Self {
        Self {
            client,
            file_type: FileType::Ascii,
            file_structure: FileStructure::File,
            file_transfer_mode: FileTransferMode::Stream,
            transfer_open: false,
        }
    }

    /// Send only the transfer options that differ from the cached state.
    pub(crate) async fn apply(
        &mut self,
        config: &FtpFileSystemConfig,
        options: &TransferOptions,
    ) -> FtpResult<()> {
        let file_type = options.file_type.unwrap_or(config.file_type);
        if file_type != self.file_type {
            let reply = self.client.file_type(file_type).await?;
            if !reply.is_success() {
                return Err(FtpError::command_rejected(reply.code, reply.text()));
            }
            self.file_type = file_type;
        }

        let structure = options.file_structure.unwrap_or(config.file_structure);
        if structure != self.file_structure {
            let reply = self.client.file_structure(structure).await?;
            if !reply.is_success() {
                return Err(FtpError::command_rejected(reply.code, reply.text()));
            }
            self.file_structure = structure;
        }

        let mode = options.file_transfer_mode.unwrap_or(config.file_transfer_mode);
        if mode != self.file_transfer_mode {
            let reply = self.client.transfer_mode(mode).await?;
            if !reply.is_success() {
                return Err(FtpError::command_rejected(reply.code, reply.text()));
            }
            self.file_transfer_mode = mode;
        }
        Ok(())
    }
}

/// One authenticated session owned by a pool.
pub struct Connection {
    id: String,
    pooled: bool,
    created_at: DateTime<Utc>,
    pub(crate) session: Mutex<Session>,
    ref_count: AtomicUsize,
    broken: AtomicBool,
    disconnected: AtomicBool,
}

impl Connection {
    /// Connect through the pool's factory and apply the default transfer
    /// options.
    pub(crate) async fn open(pool: &PoolShared, pooled: bool) -> FtpResult<Arc<Connection>> {
        let client = pool.factory.connect(&pool.config).await?;
        let conn = Connection {
            id: Uuid::new_v4().to_string(),
            pooled,
            created_at: Utc::now(),
            session: Mutex::new(Session::new(client)),
            ref_count: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        };

        {
            let mut session = conn.session.lock().await;
            if let Err(mut e) = session.apply(&pool.config, &TransferOptions::default()).await {
                if let Err(d) = session.client.disconnect().await {
                    e.add_suppressed(d);
                }
                return Err(e);
            }
        }

        log::debug!("FTP connection {} opened (pooled: {})", conn.id, pooled);
        let conn = Arc::new(conn);
        pool.register(&conn);
        Ok(conn)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Hand-out by the pool: the count goes from 0 to 1.
    pub(crate) fn claim(&self) {
        self.ref_count.store(1, Ordering::SeqCst);
    }

    /// NOOP round trip. Marks the connection broken on failure.
    pub(crate) async fn probe(&self) -> FtpResult<()> {
        let mut session = self.session.lock().await;
        if session.transfer_open {
            self.mark_broken();
            return Err(FtpError::illegal_state(format!(
                "FTP connection {} has an unfinished transfer",
                self.id
            )));
        }
        let result = match session.client.noop().await {
            Ok(reply) if reply.is_success() => Ok(()),
            Ok(reply) => Err(FtpError::from_reply(reply.code, &reply.text())),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Send QUIT once; later calls succeed without touching the session.
    pub(crate) async fn disconnect(&self) -> FtpResult<()> {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut session = self.session.lock().await;
        session.transfer_open = false;
        let result = session.client.disconnect().await;
        match &result {
            Ok(()) => log::debug!("FTP connection {} disconnected", self.id),
            Err(e) => log::warn!("FTP connection {} disconnect failed: {}", self.id, e),
        }
        result
    }
}

/// Disconnect from synchronous code, on the current runtime if there is one.
pub(crate) fn disconnect_detached(conn: Arc<Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = conn.disconnect().await {
                    log::debug!("Ignoring detached disconnect failure: {}", e);
                }
            });
        }
        Err(_) => log::warn!(
            "FTP connection {} dropped outside a runtime; closing without QUIT",
            conn.id()
        ),
    }
}

/// One reference on a connection. Releasing the last one returns the
/// connection to its pool.
pub(crate) struct Lease {
    conn: Arc<Connection>,
    pool: Arc<PoolShared>,
    released: bool,
}

impl Lease {
    /// Wrap a reference the caller has already counted.
    pub(crate) fn new(conn: Arc<Connection>, pool: Arc<PoolShared>) -> Self {
        Self {
            conn,
            pool,
            released: false,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.pool
    }

    /// Take an additional reference.
    pub(crate) fn retain(&self) -> Lease {
        self.conn.ref_count.fetch_add(1, Ordering::SeqCst);
        Lease::new(self.conn.clone(), self.pool.clone())
    }

    pub(crate) async fn release(mut self) -> FtpResult<()> {
        self.released = true;
        if self.conn.ref_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(());
        }
        match self.pool.reclaim(self.conn.clone()) {
            None => Ok(()),
            Some(conn) => conn.disconnect().await,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.conn.ref_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        if let Some(conn) = self.pool.reclaim(self.conn.clone()) {
            disconnect_detached(conn);
        }
    }
}

/// A connection checked out of the pool.
///
/// Operations on one handle run strictly one after another. Streams opened
/// from it keep the connection out of the pool until they are closed, even
/// after the handle itself has been released.
pub struct PooledConnection {
    lease: Lease,
}

impl PooledConnection {
    pub(crate) fn new(lease: Lease) -> Self {
        Self { lease }
    }

    pub fn id(&self) -> &str {
        self.lease.connection().id()
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.connection().is_pooled()
    }

    /// Open references: this handle plus every open stream.
    pub fn ref_count(&self) -> usize {
        self.lease.connection().ref_count()
    }

    fn config(&self) -> &FtpFileSystemConfig {
        &self.lease.pool().config
    }

    async fn session(&self) -> FtpResult<MutexGuard<'_, Session>> {
        let session = self.lease.connection().session.lock().await;
        if session.transfer_open {
            return Err(FtpError::illegal_state(format!(
                "A transfer is still open on FTP connection {}",
                self.id()
            )));
        }
        Ok(session)
    }

    /// Raw listing; refusals go through the error mapper.
    pub async fn list_files(&self, path: &str) -> FtpResult<Vec<FtpEntry>> {
        let mut session = self.session().await?;
        match session.client.list(path).await? {
            Ok(entries) => Ok(entries),
            Err(reply) => Err(self.lease.pool().mapper.get_file(path, &reply)),
        }
    }

    pub async fn make_directory(&self, path: &str) -> FtpResult<()> {
        let mut session = self.session().await?;
        session.apply(self.config(), &TransferOptions::default()).await?;
        let reply = session.client.make_directory(path).await?;
        if !reply.is_success() {
            return Err(self.lease.pool().mapper.create_directory(path, &reply));
        }
        Ok(())
    }

    /// `RMD` for directories, `DELE` otherwise.
    pub async fn delete(&self, path: &str, is_directory: bool) -> FtpResult<()> {
        let mut session = self.session().await?;
        session.apply(self.config(), &TransferOptions::default()).await?;
        let reply = if is_directory {
            session.client.remove_directory(path).await?
        } else {
            session.client.remove_file(path).await?
        };
        if !reply.is_success() {
            return Err(self.lease.pool().mapper.delete(path, &reply, is_directory));
        }
        Ok(())
    }

    async fn rename_with(
        &self,
        from: &str,
        to: &str,
        map: fn(&dyn ErrorMapper, &str, &str, &FtpReply) -> FtpError,
    ) -> FtpResult<()> {
        let mut session = self.session().await?;
        session.apply(self.config(), &TransferOptions::default()).await?;
        let reply = session.client.rename(from, to).await?;
        if !reply.is_success() {
            return Err(map(self.lease.pool().mapper.as_ref(), from, to, &reply));
        }
        Ok(())
    }

    /// `RNFR` + `RNTO`.
    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<()> {
        self.rename_with(from, to, |m, from, to, reply| m.rename(from, to, reply))
            .await
    }

    /// Same commands as `rename`, refusals reported as a failed move.
    pub async fn move_path(&self, from: &str, to: &str) -> FtpResult<()> {
        self.rename_with(from, to, |m, from, to, reply| m.move_path(from, to, reply))
            .await
    }

    /// `MDTM`; `None` when the reply cannot be parsed.
    pub async fn modification_time(&self, path: &str) -> FtpResult<Option<DateTime<Utc>>> {
        let mut session = self.session().await?;
        session.apply(self.config(), &TransferOptions::default()).await?;
        let reply = session.client.modification_time(path).await?;
        if !reply.is_success() {
            return Err(self.lease.pool().mapper.get_file(path, &reply));
        }
        Ok(parse_mdtm(&reply))
    }

    pub async fn open_read(&self, path: &str, options: &OpenOptions) -> FtpResult<FtpReadStream> {
        let mut session = self.session().await?;
        session.apply(self.config(), &options.transfer).await?;
        let data = match session.client.retrieve(path).await? {
            Ok(data) => data,
            Err(reply) => return Err(self.lease.pool().mapper.open_read(path, &reply)),
        };
        session.transfer_open = true;
        drop(session);
        log::debug!("FTP connection {}: reading {}", self.id(), path);
        Ok(FtpReadStream::new(
            self.lease.retain(),
            path.to_string(),
            data,
            options.delete_on_close,
        ))
    }

    /// `APPE` when appending, `STOR` otherwise.
    pub async fn open_write(&self, path: &str, options: &OpenOptions) -> FtpResult<FtpWriteStream> {
        let mut session = self.session().await?;
        session.apply(self.config(), &options.transfer).await?;
        let opened = if options.append {
            session.client.append(path).await?
        } else {
            session.client.store(path).await?
        };
        let data = match opened {
            Ok(data) => data,
            Err(reply) => return Err(self.lease.pool().mapper.open_write(path, &reply)),
        };
        session.transfer_open = true;
        drop(session);
        log::debug!("FTP connection {}: writing {}", self.id(), path);
        Ok(FtpWriteStream::new(
            self.lease.retain(),
            path.to_string(),
            data,
            options.delete_on_close,
        ))
    }

    /// Upload everything from `source` and finalize the transfer.
    pub async fn store_file<R>(&self, path: &str, source: &mut R, options: &OpenOptions) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut stream = self.open_write(path, options).await?;
        let copied = match tokio::io::copy(source, &mut stream).await {
            Ok(n) => n,
            Err(e) => {
                let mut err = FtpError::from(e).with_path(path);
                if let Err(close_err) = stream.close().await {
                    err.add_suppressed(close_err);
                }
                return Err(err);
            }
        };
        stream.flush().await?;
        stream.close().await?;
        Ok(copied)
    }

    /// NOOP on this connection.
    pub async fn keep_alive(&self) -> FtpResult<()> {
        self.lease.connection().probe().await
    }

    /// Server working directory.
    pub async fn pwd(&self) -> FtpResult<String> {
        let mut session = self.session().await?;
        let reply = session.client.pwd().await?;
        if !reply.is_success() {
            return Err(FtpError::from_reply(reply.code, &reply.text()));
        }
        parse_quoted_path(&reply)
    }

    /// Give this handle's reference back. Dropping the handle does the
    /// same, but can only disconnect transient sessions in the background.
    pub async fn release(self) -> FtpResult<()> {
        self.lease.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftpfs::error::FtpErrorKind;
    use crate::ftpfs::mapper::DefaultErrorMapper;
    use crate::ftpfs::options::OpenOption;
    use crate::ftpfs::pool::ConnectionPool;
    use crate::ftpfs::simulated::SimulatedServer;
    use tokio::io::AsyncReadExt;

    async fn pool(server: &SimulatedServer, capacity: usize) -> ConnectionPool {
        let mut config = FtpFileSystemConfig::new("sim");
        config.client_connection_count = capacity;
        ConnectionPool::new(config, Arc::new(server.clone()), Arc::new(DefaultErrorMapper))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn defaults_applied_once_at_creation() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1).await;
        assert_eq!(server.count_commands("TYPE I"), 1);
        assert_eq!(server.count_commands("STRU"), 0);
        assert_eq!(server.count_commands("MODE"), 0);

        let conn = pool.acquire().await.unwrap();
        conn.make_directory("/a").await.unwrap();
        conn.make_directory("/b").await.unwrap();
        assert_eq!(server.count_commands("TYPE"), 1);
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn only_differing_options_are_sent() {
        let server = SimulatedServer::new();
        server.add_file("/f.txt", b"hello");
        let pool = pool(&server, 1).await;
        let conn = pool.acquire().await.unwrap();
        server.clear_commands();

        let options = OpenOptions::for_new_input_stream(&[
            OpenOption::FileType(FileType::Ascii),
            OpenOption::FileStructure(FileStructure::File),
        ])
        .unwrap();
        let mut stream = conn.open_read("/f.txt", &options).await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(server.commands(), vec!["TYPE A", "RETR /f.txt"]);

        server.clear_commands();
        conn.make_directory("/d").await.unwrap();
        assert_eq!(server.commands(), vec!["TYPE I", "MKD /d"]);
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn streams_hold_references() {
        let server = SimulatedServer::new();
        server.add_file("/f.txt", b"hello");
        let pool = pool(&server, 1).await;
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.ref_count(), 1);

        let options = OpenOptions::for_new_input_stream(&[]).unwrap();
        let mut stream = conn.open_read("/f.txt", &options).await.unwrap();
        assert_eq!(conn.ref_count(), 2);

        let err = conn.make_directory("/x").await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::IllegalState);

        conn.release().await.unwrap();
        assert_eq!(pool.stats().idle, 0);

        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "hello");
        stream.close().await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn refused_commands_use_mapper() {
        let server = SimulatedServer::new();
        let pool = pool(&server, 1).await;
        let conn = pool.acquire().await.unwrap();
        let options = OpenOptions::for_new_input_stream(&[]).unwrap();
        let err = conn.open_read("/missing", &options).await.err().unwrap();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
        assert_eq!(err.code, Some(550));

        conn.make_directory("/d").await.unwrap();
        let err = conn.make_directory("/d").await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::AlreadyExists);
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn store_file_and_pwd() {
        let server = SimulatedServer::new();
        server.add_directory("/home/me");
        server.set_working_directory("/home/me");
        let pool = pool(&server, 1).await;
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.pwd().await.unwrap(), "/home/me");

        let options = OpenOptions::for_new_output_stream(&[]).unwrap();
        let mut source: &[u8] = b"uploaded";
        let n = conn.store_file("/home/me/u.bin", &mut source, &options).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(server.file_contents("/home/me/u.bin").unwrap(), b"uploaded");
        assert!(conn.modification_time("/home/me/u.bin").await.unwrap().is_some());
        conn.release().await.unwrap();
    }
}
