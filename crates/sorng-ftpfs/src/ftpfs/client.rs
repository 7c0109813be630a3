//! Network session: one control connection plus per-transfer data
//! channels.
//!
//! Lifecycle: TCP connect (TLS from the first byte for implicit FTPS) →
//! banner → `AUTH TLS` for explicit FTPS → login → `PBSZ`/`PROT` →
//! FEAT/SYST probing → optional `CWD` into the default directory.

use crate::ftpfs::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftpfs::parser;
use crate::ftpfs::protocol::{FtpCodec, WriteHalf};
use crate::ftpfs::tls;
use crate::ftpfs::transfer::{self, DataStream, DataTls};
use crate::ftpfs::types::{
    FileStructure, FileTransferMode, FileType, FtpEntry, FtpFileSystemConfig, FtpReply, FtpSecurityMode,
    ServerFeatures,
};
use crate::ftpfs::wire::{DataReader, DataWriter, WireClient, WireClientFactory};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// TCP connect and banner; TLS right away for implicit FTPS.
async fn connect_control(config: &FtpFileSystemConfig) -> FtpResult<(FtpCodec, FtpReply)> {
    let addr = format!("{}:{}", config.host, config.port);
    let dur = Duration::from_secs(config.connect_timeout_sec);

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::timeout(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;
    tcp.set_nodelay(true).ok();

    let mut codec = match config.security {
        FtpSecurityMode::Implicit => {
            let tls = tls::connect_tls(tcp, &config.host, config.accept_invalid_certs).await?;
            FtpCodec::from_tls(tls)
        }
        _ => FtpCodec::from_tcp(tcp),
    };

    let mut banner = timeout(dur, codec.read_reply())
        .await
        .map_err(|_| FtpError::timeout(format!("No greeting from {}", addr)))??;
    // 120: service ready in a few minutes.
    while banner.code == 120 {
        banner = codec.read_reply().await?;
    }
    if !banner.is_completion() {
        return Err(FtpError::connection_failed(format!("Server refused the session: {}", banner.text()))
            .with_code(banner.code));
    }
    Ok((codec, banner))
}

/// An authenticated FTP session over the network.
pub struct FtpWireClient {
    id: String,
    codec: FtpCodec,
    config: FtpFileSystemConfig,
    features: ServerFeatures,
    system_type: Option<String>,
    /// A transfer command was accepted and its completion reply is unread.
    pending: bool,
    connected: bool,
}

impl FtpWireClient {
    pub async fn connect(config: &FtpFileSystemConfig) -> FtpResult<Self> {
        config.validate()?;
        let (mut codec, banner) = connect_control(config).await?;
        log::debug!("FTP {}:{} greeting: {}", config.host, config.port, banner.text());

        if config.security == FtpSecurityMode::Explicit {
            let reply = codec.execute("AUTH TLS").await?;
            if !reply.is_completion() {
                return Err(FtpError::tls_failed(format!("AUTH TLS rejected: {}", reply.text()))
                    .with_code(reply.code));
            }
            codec = tls::upgrade_to_tls(codec, &config.host, config.accept_invalid_certs).await?;
        }

        Self::login(&mut codec, config).await?;

        if config.security != FtpSecurityMode::None {
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
        }

        let features = Self::probe_features(&mut codec).await;
        if config.utf8 && features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await;
        }

        let system_type = match codec.execute("SYST").await {
            Ok(r) if r.is_completion() => r.lines.first().and_then(|l| l.get(4..)).map(str::to_string),
            _ => None,
        };

        if let Some(dir) = &config.default_directory {
            let reply = codec.execute(&format!("CWD {}", dir)).await?;
            if !reply.is_completion() {
                return Err(FtpError::not_found(dir.clone()).with_code(reply.code));
            }
        }

        let id = Uuid::new_v4().to_string();
        log::info!(
            "FTP session {} logged in to {}:{} as {} (system: {})",
            id,
            config.host,
            config.port,
            config.username,
            system_type.as_deref().unwrap_or("unknown")
        );

        Ok(Self {
            id,
            codec,
            config: config.clone(),
            features,
            system_type,
            pending: false,
            connected: true,
        })
    }

    async fn login(codec: &mut FtpCodec, config: &FtpFileSystemConfig) -> FtpResult<()> {
        let mut reply = codec.execute(&format!("USER {}", config.username)).await?;
        if reply.code == 331 {
            reply = codec.execute(&format!("PASS {}", config.password)).await?;
        }
        if reply.code == 332 {
            let account = config
                .account
                .as_deref()
                .ok_or_else(|| FtpError::auth_failed("Server requires an account (ACCT)"))?;
            reply = codec.execute(&format!("ACCT {}", account)).await?;
        }
        if !reply.is_completion() {
            return Err(FtpError::auth_failed(format!("Login failed: {}", reply.text())).with_code(reply.code));
        }
        Ok(())
    }

    async fn probe_features(codec: &mut FtpCodec) -> ServerFeatures {
        let reply = match codec.execute("FEAT").await {
            Ok(r) if r.is_completion() => r,
            _ => return ServerFeatures::default(),
        };

        let raw: Vec<String> = reply
            .lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        ServerFeatures {
            mlsd: has("MLSD") || has("MLST"),
            mlst: has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            auth_tls: has("AUTH TLS"),
            raw_features: raw,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn system_type(&self) -> Option<&str> {
        self.system_type.as_deref()
    }

    fn check(&self) -> FtpResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(FtpError::disconnected(format!("FTP session {} is closed", self.id)))
        }
    }

    async fn command(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.check()?;
        if self.pending {
            return Err(FtpError::protocol_error("A transfer is still in progress"));
        }
        self.codec.execute(cmd).await
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.config.data_timeout_sec)
    }

    /// Negotiate a data channel and send `cmd` on it. A refusal comes back
    /// as `Ok(Err(reply))`.
    async fn open_data(&mut self, cmd: &str) -> FtpResult<Result<DataStream, FtpReply>> {
        self.check()?;
        if self.pending {
            return Err(FtpError::protocol_error("A transfer is already in progress"));
        }
        let data_timeout = self.data_timeout();
        let channel = transfer::prepare_data_channel(
            &mut self.codec,
            self.config.data_channel_mode,
            &self.config.host,
            data_timeout,
            self.config.active_bind_address.as_deref(),
        )
        .await?;

        let reply = self.codec.execute(cmd).await?;
        if !reply.is_preliminary() {
            return Ok(Err(reply));
        }
        self.pending = true;

        let tls = (self.config.security != FtpSecurityMode::None).then(|| DataTls {
            host: &self.config.host,
            accept_invalid_certs: self.config.accept_invalid_certs,
        });
        let stream = channel.establish(tls, data_timeout).await?;
        Ok(Ok(stream))
    }

    fn list_command(&self, path: &str) -> String {
        if self.config.use_mlsd && self.features.mlsd {
            format!("MLSD {}", path)
        } else if self.config.list_hidden_files {
            format!("LIST -a {}", path)
        } else {
            format!("LIST {}", path)
        }
    }
}

#[async_trait]
impl WireClient for FtpWireClient {
    async fn file_type(&mut self, file_type: FileType) -> FtpResult<FtpReply> {
        self.command(&file_type.command()).await
    }

    async fn file_structure(&mut self, structure: FileStructure) -> FtpResult<FtpReply> {
        self.command(structure.command()).await
    }

    async fn transfer_mode(&mut self, mode: FileTransferMode) -> FtpResult<FtpReply> {
        self.command(mode.command()).await
    }

    async fn noop(&mut self) -> FtpResult<FtpReply> {
        self.command("NOOP").await
    }

    async fn pwd(&mut self) -> FtpResult<FtpReply> {
        self.command("PWD").await
    }

    async fn make_directory(&mut self, path: &str) -> FtpResult<FtpReply> {
        self.command(&format!("MKD {}", path)).await
    }

    async fn remove_file(&mut self, path: &str) -> FtpResult<FtpReply> {
        self.command(&format!("DELE {}", path)).await
    }

    async fn remove_directory(&mut self, path: &str) -> FtpResult<FtpReply> {
        self.command(&format!("RMD {}", path)).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<FtpReply> {
        let reply = self.command(&format!("RNFR {}", from)).await?;
        if !reply.is_intermediate() {
            return Ok(reply);
        }
        self.command(&format!("RNTO {}", to)).await
    }

    async fn modification_time(&mut self, path: &str) -> FtpResult<FtpReply> {
        self.command(&format!("MDTM {}", path)).await
    }

    async fn retrieve(&mut self, path: &str) -> FtpResult<Result<DataReader, FtpReply>> {
        Ok(self
            .open_data(&format!("RETR {}", path))
            .await?
            .map(|stream| Box::new(stream) as DataReader))
    }

    async fn store(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>> {
        Ok(self
            .open_data(&format!("STOR {}", path))
            .await?
            .map(|stream| Box::new(stream) as DataWriter))
    }

    async fn append(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>> {
        Ok(self
            .open_data(&format!("APPE {}", path))
            .await?
            .map(|stream| Box::new(stream) as DataWriter))
    }

    async fn complete_pending_command(&mut self) -> FtpResult<FtpReply> {
        self.check()?;
        if !self.pending {
            return Err(FtpError::protocol_error("No transfer in progress"));
        }
        self.pending = false;
        timeout(self.data_timeout(), self.codec.read_reply())
            .await
            .map_err(|_| FtpError::timeout("Timed out waiting for the transfer completion reply"))?
    }

    async fn list(&mut self, path: &str) -> FtpResult<Result<Vec<FtpEntry>, FtpReply>> {
        let cmd = self.list_command(path);
        let mut stream = match self.open_data(&cmd).await? {
            Ok(stream) => stream,
            // Some servers answer an empty listing without opening a
            // channel.
            Err(reply) if reply.is_completion() => return Ok(Ok(Vec::new())),
            Err(reply) => return Ok(Err(reply)),
        };

        let mut buf = Vec::new();
        let read = timeout(self.data_timeout(), stream.read_to_end(&mut buf)).await;
        let _ = stream.shutdown().await;
        drop(stream);
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(FtpError::data_channel(format!("Listing {}: {}", path, e))),
            Err(_) => return Err(FtpError::timeout(format!("Listing {} timed out", path))),
        }

        let done = self.complete_pending_command().await?;
        if !done.is_completion() {
            return Ok(Err(done));
        }
        let entries = parser::parse_listing(&String::from_utf8_lossy(&buf));
        log::trace!("FTP session {}: {} entries in {}", self.id, entries.len(), path);
        Ok(Ok(entries))
    }

    async fn disconnect(&mut self) -> FtpResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        if self.pending {
            self.pending = false;
            let _ = timeout(Duration::from_secs(1), self.codec.read_reply()).await;
        }

        let quit = timeout(self.data_timeout(), self.codec.execute("QUIT")).await;
        let _ = match &mut self.codec.writer {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Tls(w) => w.shutdown().await,
        };
        log::debug!("FTP session {} closed", self.id);

        match quit {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind == FtpErrorKind::Disconnected => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FtpError::timeout("Timed out waiting for the QUIT reply")),
        }
    }
}

/// Opens `FtpWireClient` sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FtpClientFactory;

#[async_trait]
impl WireClientFactory for FtpClientFactory {
    async fn connect(&self, config: &FtpFileSystemConfig) -> FtpResult<Box<dyn WireClient>> {
        Ok(Box::new(FtpWireClient::connect(config).await?))
    }
}
