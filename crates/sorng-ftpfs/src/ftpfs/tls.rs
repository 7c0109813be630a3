//! TLS for explicit and implicit FTPS (RFC 4217).
//!
//! Builds a rustls connector from the platform roots, optionally accepting
//! any certificate, and wraps control or data sockets with it.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::protocol::{FtpCodec, ReadHalf, WriteHalf};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Accepts any server certificate. Only used with `accept_invalid_certs`.
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn build_tls_connector(accept_invalid_certs: bool) -> FtpResult<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let config = if accept_invalid_certs {
        log::warn!("FTPS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            log::warn!("Could not load a platform root certificate: {}", e);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn server_name(host: &str) -> FtpResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| FtpError::tls_failed(format!("Invalid server name '{}': {}", host, e)))
}

pub async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    accept_invalid_certs: bool,
) -> FtpResult<TlsStream<TcpStream>> {
    let connector = build_tls_connector(accept_invalid_certs)?;
    connector
        .connect(server_name(host)?, tcp)
        .await
        .map_err(|e| FtpError::tls_failed(format!("TLS handshake with {}: {}", host, e)))
}

/// Upgrade a plain control connection after `AUTH TLS` was accepted.
pub async fn upgrade_to_tls(codec: FtpCodec, host: &str, accept_invalid_certs: bool) -> FtpResult<FtpCodec> {
    let tcp = reunite_plain(codec)?;
    let tls = connect_tls(tcp, host, accept_invalid_certs).await?;
    Ok(FtpCodec::from_tls(tls))
}

fn reunite_plain(codec: FtpCodec) -> FtpResult<TcpStream> {
    let (rd, wr) = match (codec.reader, codec.writer) {
        (ReadHalf::Plain(rd), WriteHalf::Plain(wr)) => (rd, wr),
        _ => {
            return Err(FtpError::protocol_error(
                "Cannot upgrade: connection is already TLS",
            ))
        }
    };
    if !rd.buffer().is_empty() {
        return Err(FtpError::protocol_error(
            "Unexpected data on the control connection before TLS handshake",
        ));
    }
    rd.into_inner()
        .reunite(wr)
        .map_err(|e| FtpError::protocol_error(format!("Reunite failed: {}", e)))
}
