//! Data-channel setup for transfers and listings.
//!
//! Four modes (RFC 959 + RFC 2428):
//! - **PASV** / **EPSV**: the server listens, the client connects before
//!   the transfer command is sent
//! - **PORT** / **EPRT**: the client listens and accepts once the server
//!   has answered the transfer command
//!
//! With `PROT P` the socket is wrapped in TLS after the server's
//! preliminary reply.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::protocol::FtpCodec;
use crate::ftpfs::tls;
use crate::ftpfs::types::DataChannelMode;
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_rustls::client::TlsStream;

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("valid PASV regex");
    static ref EPSV_RE: Regex = Regex::new(r"\|\|\|(\d+)\|").expect("valid EPSV regex");
}

/// An established data connection.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A data channel negotiated but not yet usable.
pub enum DataChannel {
    /// Connected to the server's passive port.
    Connected(TcpStream),
    /// Waiting for the server to connect back.
    Listening(TcpListener),
}

/// TLS parameters for `PROT P` data channels.
pub struct DataTls<'a> {
    pub host: &'a str,
    pub accept_invalid_certs: bool,
}

/// Negotiate the data channel for the next transfer command.
pub async fn prepare_data_channel(
    codec: &mut FtpCodec,
    mode: DataChannelMode,
    host: &str,
    data_timeout: Duration,
    active_bind: Option<&str>,
) -> FtpResult<DataChannel> {
    match mode {
        DataChannelMode::Passive => open_pasv(codec, data_timeout).await.map(DataChannel::Connected),
        DataChannelMode::ExtendedPassive => open_epsv(codec, host, data_timeout)
            .await
            .map(DataChannel::Connected),
        DataChannelMode::Active => open_port(codec, active_bind).await.map(DataChannel::Listening),
        DataChannelMode::ExtendedActive => open_eprt(codec, active_bind).await.map(DataChannel::Listening),
    }
}

impl DataChannel {
    /// Finish the connection once the server accepted the transfer
    /// command.
    pub async fn establish(self, tls: Option<DataTls<'_>>, data_timeout: Duration) -> FtpResult<DataStream> {
        let tcp = match self {
            DataChannel::Connected(tcp) => tcp,
            DataChannel::Listening(listener) => {
                let (tcp, _) = timeout(data_timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::data_channel("Active data connection timed out"))?
                    .map_err(|e| FtpError::data_channel(format!("Active data accept: {}", e)))?;
                tcp
            }
        };
        match tls {
            Some(tls) => {
                let stream = tls::connect_tls(tcp, tls.host, tls.accept_invalid_certs).await?;
                Ok(DataStream::Tls(Box::new(stream)))
            }
            None => Ok(DataStream::Plain(tcp)),
        }
    }
}

async fn connect_data(addr: SocketAddr, data_timeout: Duration) -> FtpResult<TcpStream> {
    timeout(data_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FtpError::data_channel(format!("Data connect to {} timed out", addr)))?
        .map_err(|e| FtpError::data_channel(format!("Data connect to {}: {}", addr, e)))
}

// ─── PASV ────────────────────────────────────────────────────────────

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn open_pasv(codec: &mut FtpCodec, data_timeout: Duration) -> FtpResult<TcpStream> {
    let reply = codec.expect_ok("PASV").await?;
    let mut addr = parse_pasv_response(&reply.text())?;
    if let Some(peer) = codec.peer_addr {
        if addr.ip().is_unspecified() {
            addr.set_ip(peer.ip());
        }
    }
    connect_data(addr, data_timeout).await
}

fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("No address in PASV reply: {}", text)))?;
    let mut octets = [0u8; 6];
    for (slot, group) in octets.iter_mut().zip(caps.iter().skip(1)) {
        *slot = group
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .ok_or_else(|| FtpError::protocol_error(format!("Bad number in PASV reply: {}", text)))?;
    }
    let [a, b, c, d, hi, lo] = octets;
    Ok(SocketAddr::new(
        IpAddr::from([a, b, c, d]),
        u16::from_be_bytes([hi, lo]),
    ))
}

// ─── EPSV ────────────────────────────────────────────────────────────

/// `229 Entering Extended Passive Mode (|||port|)`, same host as the
/// control connection.
async fn open_epsv(codec: &mut FtpCodec, host: &str, data_timeout: Duration) -> FtpResult<TcpStream> {
    let reply = codec.expect_ok("EPSV").await?;
    let port = parse_epsv_response(&reply.text())?;
    match codec.peer_addr {
        Some(peer) => connect_data(SocketAddr::new(peer.ip(), port), data_timeout).await,
        None => {
            let target = (host, port);
            timeout(data_timeout, TcpStream::connect(target))
                .await
                .map_err(|_| FtpError::data_channel(format!("Data connect to {}:{} timed out", host, port)))?
                .map_err(|e| FtpError::data_channel(format!("Data connect to {}:{}: {}", host, port, e)))
        }
    }
}

fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    EPSV_RE
        .captures(text)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .ok_or_else(|| FtpError::protocol_error(format!("No port in EPSV reply: {}", text)))
}

// ─── PORT / EPRT ─────────────────────────────────────────────────────

/// Listen on the configured address, or the control connection's local
/// address.
async fn listen(codec: &FtpCodec, bind: Option<&str>) -> FtpResult<(TcpListener, SocketAddr)> {
    let bind_ip: IpAddr = match bind {
        Some(addr) => addr
            .parse()
            .map_err(|_| FtpError::invalid_config(format!("Invalid active bind address: {}", addr)))?,
        None => codec
            .local_addr
            .map(|a| a.ip())
            .ok_or_else(|| FtpError::data_channel("Control connection has no local address"))?,
    };
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
        .await
        .map_err(|e| FtpError::data_channel(format!("Active bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::data_channel(format!("Active local_addr: {}", e)))?;
    Ok((listener, local))
}

async fn open_port(codec: &mut FtpCodec, bind: Option<&str>) -> FtpResult<TcpListener> {
    let (listener, local) = listen(codec, bind).await?;
    let ip = match local.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(FtpError::data_channel("PORT requires IPv4; use EPRT")),
    };
    let o = ip.octets();
    let port = local.port();
    let cmd = format!("PORT {},{},{},{},{},{}", o[0], o[1], o[2], o[3], port / 256, port % 256);
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}

/// `EPRT |1|ip|port|` (1 = IPv4, 2 = IPv6)
async fn open_eprt(codec: &mut FtpCodec, bind: Option<&str>) -> FtpResult<TcpListener> {
    let (listener, local) = listen(codec, bind).await?;
    let af = match local.ip() {
        IpAddr::V4(_) => 1,
        IpAddr::V6(_) => 2,
    };
    let cmd = format!("EPRT |{}|{}|{}|", af, local.ip(), local.port());
    codec.expect_ok(&cmd).await?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply() {
        let addr = parse_pasv_response("227 Entering Passive Mode (192,168,1,10,195,80)").unwrap();
        assert_eq!(addr, "192.168.1.10:50000".parse().unwrap());
        assert!(parse_pasv_response("227 nothing here").is_err());
        assert!(parse_pasv_response("227 (300,1,1,1,1,1)").is_err());
    }

    #[test]
    fn epsv_reply() {
        assert_eq!(
            parse_epsv_response("229 Entering Extended Passive Mode (|||6446|)").unwrap(),
            6446
        );
        assert!(parse_epsv_response("229 Entering Extended Passive Mode").is_err());
    }
}
