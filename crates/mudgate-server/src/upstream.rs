//! Upstream connector: scheme-tagged address parsing, TLS or plain TCP
//! connect, TCP keep-alive, and the optional PROXY-protocol v1 preamble.
//!
//! Certificate verification is deliberately disabled: MUD servers almost
//! universally run self-signed certificates.

use mudgate_core::{ProxyError, ProxyResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Default port when the address carries a TLS-flavored scheme (or none).
pub const DEFAULT_TLS_PORT: u16 = 7443;

/// Default port for plain-TCP schemes.
pub const DEFAULT_TCP_PORT: u16 = 7777;

/// Idle time before TCP keep-alive probes start.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Transport selected by the upstream URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Tls,
    Tcp,
}

/// Parsed `<scheme>://<host>:<port>` upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub scheme: UpstreamScheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamAddr {
    /// Parse a scheme-tagged address. Recognized schemes: `tls`/`wss`/`ssl`
    /// (TLS, default port 7443), `tcp`/`ws`/`telnet` (plain, default port
    /// 7777). A bare `host[:port]` is treated as TLS.
    pub fn parse(input: &str) -> ProxyResult<Self> {
        let input = input.trim();
        let (scheme_str, rest) = match input.split_once("://") {
            Some((s, r)) => (Some(s), r),
            None => (None, input),
        };
        let scheme = match scheme_str {
            None | Some("tls") | Some("wss") | Some("ssl") => UpstreamScheme::Tls,
            Some("tcp") | Some("ws") | Some("telnet") => UpstreamScheme::Tcp,
            Some(other) => {
                return Err(ProxyError::Address(format!("unknown scheme: {other}")))
            }
        };
        let default_port = match scheme {
            UpstreamScheme::Tls => DEFAULT_TLS_PORT,
            UpstreamScheme::Tcp => DEFAULT_TCP_PORT,
        };
        let (host, port) = split_host_port(rest, default_port)?;
        if host.is_empty() {
            return Err(ProxyError::Address(format!("missing host in: {input}")));
        }
        Ok(Self { scheme, host, port })
    }
}

fn split_host_port(rest: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (host, after) = stripped
            .split_once(']')
            .ok_or_else(|| ProxyError::Address(format!("unclosed bracket: {rest}")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ProxyError::Address(format!("invalid port: {p}")))?,
            None if after.is_empty() => default_port,
            None => {
                return Err(ProxyError::Address(format!("trailing junk: {rest}")))
            }
        };
        return Ok((host.to_string(), port));
    }
    match rest.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Ok((rest.to_string(), default_port)),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::Address(format!("invalid port: {port}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), default_port)),
    }
}

/// Read side of an established upstream connection.
pub enum UpstreamReader {
    Tls(ReadHalf<TlsStream<TcpStream>>),
    Plain(OwnedReadHalf),
}

impl UpstreamReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            UpstreamReader::Tls(r) => r.read(buf).await,
            UpstreamReader::Plain(r) => r.read(buf).await,
        }
    }
}

/// Write side of an established upstream connection.
pub enum UpstreamWriter {
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Plain(OwnedWriteHalf),
}

impl UpstreamWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            UpstreamWriter::Tls(w) => w.write_all(data).await,
            UpstreamWriter::Plain(w) => w.write_all(data).await,
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            UpstreamWriter::Tls(w) => w.shutdown().await,
            UpstreamWriter::Plain(w) => w.shutdown().await,
        }
    }
}

/// An established upstream connection, split for independent pumping.
pub struct Upstream {
    pub reader: UpstreamReader,
    pub writer: UpstreamWriter,
}

/// Open the upstream connection. When `proxy_source` is set, a single
/// PROXY-protocol v1 line carrying that source address is written before
/// any other byte.
pub async fn connect(
    addr: &UpstreamAddr,
    proxy_source: Option<(&str, u16)>,
) -> ProxyResult<Upstream> {
    let tcp = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .map_err(|e| {
            ProxyError::UpstreamConnect(format!("{}:{}: {e}", addr.host, addr.port))
        })?;
    set_keepalive(&tcp)?;
    let local = tcp.local_addr()?;
    debug!(host = %addr.host, port = addr.port, tls = matches!(addr.scheme, UpstreamScheme::Tls), "upstream connected");

    let header = proxy_source.map(|(ip, port)| proxy_v1_header(ip, port, &local));

    let mut upstream = match addr.scheme {
        UpstreamScheme::Tcp => {
            let (reader, writer) = tcp.into_split();
            Upstream {
                reader: UpstreamReader::Plain(reader),
                writer: UpstreamWriter::Plain(writer),
            }
        }
        UpstreamScheme::Tls => {
            let connector = insecure_tls_connector()?;
            let server_name = ServerName::try_from(addr.host.clone())
                .map_err(|_| ProxyError::Address(format!("invalid host: {}", addr.host)))?;
            let tls = connector.connect(server_name, tcp).await.map_err(|e| {
                ProxyError::UpstreamConnect(format!("TLS handshake with {}: {e}", addr.host))
            })?;
            let (reader, writer) = tokio::io::split(tls);
            Upstream {
                reader: UpstreamReader::Tls(reader),
                writer: UpstreamWriter::Tls(writer),
            }
        }
    };

    if let Some(line) = header {
        upstream.writer.write_all(line.as_bytes()).await?;
    }

    Ok(upstream)
}

fn set_keepalive(stream: &TcpStream) -> ProxyResult<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Build the PROXY-protocol v1 line: family is TCP6 iff the source address
/// contains a colon; destination is the local end of the upstream socket.
fn proxy_v1_header(src_ip: &str, src_port: u16, dst: &SocketAddr) -> String {
    let family = if src_ip.contains(':') { "TCP6" } else { "TCP4" };
    format!(
        "PROXY {family} {src_ip} {} {src_port} {}\r\n",
        dst.ip(),
        dst.port()
    )
}

fn insecure_tls_connector() -> ProxyResult<tokio_rustls::TlsConnector> {
    let provider = rustls::crypto::ring::default_provider();
    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts anything the upstream presents.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
