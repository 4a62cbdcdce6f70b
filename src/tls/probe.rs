use super::{config::TlsContext, verifier::VerifyCode};
use crate::target::{CheckTarget, endpoint_name};
use rustls::pki_types::{CertificateDer, ServerName};
use std::{
    fmt,
    future::Future,
    io,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

// PostgreSQL SSL handshake constants
const POSTGRES_SSL_REQUEST_CODE: i32 = 80_877_103;
const POSTGRES_SSL_REQUEST_LEN: i32 = 8;

// MySQL capability flags
const MYSQL_CLIENT_SSL: u32 = 0x0000_0800;
const MYSQL_SSL_REQUEST_FLAGS: u32 = 0x007f_ae85;
const MYSQL_MAX_PACKET: u32 = 16_777_216;
const MYSQL_UTF8_GENERAL_CI: u8 = 0x21;
const MYSQL_MAX_HANDSHAKE_LEN: usize = 64 * 1024;

// LDAP extended request for 1.3.6.1.4.1.1466.20037 (StartTLS), message id 1
const LDAP_STARTTLS_REQUEST: [u8; 31] = [
    0x30, 0x1d, 0x02, 0x01, 0x01, 0x77, 0x18, 0x80, 0x16, 0x31, 0x2e, 0x33, 0x2e, 0x36, 0x2e, 0x31,
    0x2e, 0x34, 0x2e, 0x31, 0x2e, 0x31, 0x34, 0x36, 0x36, 0x2e, 0x32, 0x30, 0x30, 0x33, 0x37,
];
// extended response, resultCode success, empty matchedDN and diagnosticMessage
const LDAP_STARTTLS_SUCCESS: [u8; 14] = [
    0x30, 0x0c, 0x02, 0x01, 0x01, 0x78, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
];

const MAX_LINE_LENGTH: u64 = 4096;

/// Why an address could not be probed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No default port for {scheme} scheme")]
    NoDefaultPort { scheme: String },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {}s during {phase}", .after.as_secs_f64())]
    Timeout {
        phase: &'static str,
        after: Duration,
    },

    #[error("Unexpected message: \"{0}\"")]
    UnexpectedMessage(String),

    #[error("{0}")]
    Protocol(String),

    #[error("I/O error during {phase}: {source}")]
    Io {
        phase: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ProbeError {
    /// Label used by the handshake error counter
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } | Self::Io { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::NoDefaultPort { .. } | Self::UnexpectedMessage(_) | Self::Protocol(_) => {
                "protocol"
            }
            Self::ServerName(_) | Self::Tls(_) => "tls",
        }
    }
}

/// How a plaintext connection is upgraded to TLS, selected by URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TLS from the first byte (https, imaps, ldaps, ...)
    Raw,
    /// SMTP `STARTTLS`
    Smtp,
    /// IMAP `STARTTLS`
    Imap,
    /// LDAP StartTLS extended operation
    Ldap,
    /// MySQL/MariaDB `SSLRequest`
    Mysql,
    /// `PostgreSQL` `SSLRequest`
    Postgres,
}

impl Protocol {
    #[must_use]
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme {
            "smtp" | "submission" => Self::Smtp,
            "imap" => Self::Imap,
            "ldap" => Self::Ldap,
            "mysql" => Self::Mysql,
            "postgres" | "postgresql" => Self::Postgres,
            _ => Self::Raw,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Smtp => "smtp",
            Self::Imap => "imap",
            Self::Ldap => "ldap",
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Run the plaintext part of the protocol until the peer expects a TLS
    /// `ClientHello`, then hand the stream back.
    ///
    /// Every read and write is bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer deviates from the expected dialogue,
    /// closes the connection, or stalls for longer than `limit`
    pub async fn upgrade<S>(self, stream: S, ehlo_hostname: &str, limit: Duration) -> Result<S, ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Self::Raw => Ok(stream),
            Self::Smtp => smtp_starttls(stream, ehlo_hostname, limit).await,
            Self::Imap => imap_starttls(stream, limit).await,
            Self::Ldap => ldap_starttls(stream, limit).await,
            Self::Mysql => mysql_ssl_request(stream, limit).await,
            Self::Postgres => postgres_ssl_request(stream, limit).await,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, read-only settings for every probe
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub tls: Arc<TlsContext>,
    pub connect_timeout: Duration,
    pub ehlo_hostname: String,
}

/// Outcome of a TLS handshake against one address
#[derive(Debug, Clone, Default)]
pub struct HandshakeAttempt {
    /// Peer chain, leaf first; empty when the peer never presented one
    pub chain: Vec<CertificateDer<'static>>,
    /// `None` when verification was never reached
    pub verify_code: Option<VerifyCode>,
    /// TLS failure captured during the handshake
    pub exception: Option<String>,
    pub protocol_version: Option<String>,
}

impl HandshakeAttempt {
    #[must_use]
    pub fn peer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    #[must_use]
    pub fn issuer_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.chain.get(1)
    }
}

/// Connect to `address`, upgrade with the target's protocol and perform the
/// TLS handshake using the target hostname for SNI.
///
/// # Errors
///
/// Returns an error if the connection or the protocol upgrade fails. TLS
/// failures are captured on the returned attempt instead.
pub async fn probe(
    ctx: &ProbeContext,
    target: &CheckTarget,
    address: IpAddr,
) -> Result<HandshakeAttempt, ProbeError> {
    let port = target.port().ok_or_else(|| ProbeError::NoDefaultPort {
        scheme: target.scheme().to_string(),
    })?;
    let endpoint = endpoint_name(address, port);
    let protocol = target.protocol();

    let stream = match timeout(ctx.connect_timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(ProbeError::Connect { endpoint, source }),
        Err(_) => {
            return Err(ProbeError::Timeout {
                phase: "connect",
                after: ctx.connect_timeout,
            });
        }
    };

    debug!(%endpoint, %protocol, "connected");

    let stream = protocol
        .upgrade(stream, &ctx.ehlo_hostname, ctx.connect_timeout)
        .await?;

    tls_handshake(ctx, stream, target.hostname()).await
}

/// Wrap `stream` in TLS and capture whatever the peer presented
///
/// # Errors
///
/// Returns an error if `hostname` is not a valid server name or the client
/// configuration cannot be built
pub async fn tls_handshake<S>(
    ctx: &ProbeContext,
    stream: S,
    hostname: &str,
) -> Result<HandshakeAttempt, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = server_name_from_host(hostname)?;
    let verifier = ctx.tls.capturing_verifier();
    let config = ctx
        .tls
        .client_config(verifier.clone())
        .map_err(|e| ProbeError::Tls(format!("{e:#}")))?;
    let connector = TlsConnector::from(Arc::new(config));

    let (exception, protocol_version) =
        match timeout(ctx.connect_timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(mut tls_stream)) => {
                let version = tls_stream
                    .get_ref()
                    .1
                    .protocol_version()
                    .map(|version| format!("{version:?}"));
                let _ = timeout(ctx.connect_timeout, tls_stream.shutdown()).await;
                (None, version)
            }
            Ok(Err(err)) => (Some(err.to_string()), None),
            Err(_) => (
                Some(format!(
                    "TLS handshake timed out after {}s",
                    ctx.connect_timeout.as_secs_f64()
                )),
                None,
            ),
        };

    let attempt = match verifier.captured() {
        Some(captured) => HandshakeAttempt {
            chain: captured.chain,
            verify_code: Some(captured.verify_code),
            exception,
            protocol_version,
        },
        None => HandshakeAttempt {
            exception: Some(
                exception.unwrap_or_else(|| "peer presented no certificate".to_string()),
            ),
            ..HandshakeAttempt::default()
        },
    };

    Ok(attempt)
}

fn server_name_from_host(host: &str) -> Result<ServerName<'static>, ProbeError> {
    host.parse::<IpAddr>().map_or_else(
        |_| {
            ServerName::try_from(host.to_string())
                .map_err(|_| ProbeError::ServerName(host.to_string()))
        },
        |ip| Ok(ServerName::from(ip)),
    )
}

async fn bounded<T, F>(limit: Duration, phase: &'static str, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(ProbeError::Io { phase, source }),
        Err(_) => Err(ProbeError::Timeout {
            phase,
            after: limit,
        }),
    }
}

fn chomp(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .or_else(|| line.strip_suffix('\r'))
        .unwrap_or(line)
}

async fn read_line<R>(reader: &mut R, limit: Duration) -> Result<String, ProbeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = bounded(
        limit,
        "upgrade",
        (&mut *reader).take(MAX_LINE_LENGTH).read_until(b'\n', &mut buf),
    )
    .await?;

    if read == 0 {
        return Err(ProbeError::Protocol(
            "connection closed by peer during upgrade".to_string(),
        ));
    }

    let line = String::from_utf8_lossy(&buf).into_owned();
    if !buf.ends_with(b"\n") {
        if u64::try_from(read).unwrap_or(u64::MAX) >= MAX_LINE_LENGTH {
            return Err(ProbeError::UnexpectedMessage(line));
        }
        return Err(ProbeError::Protocol(
            "connection closed by peer during upgrade".to_string(),
        ));
    }

    Ok(line)
}

/// Read lines until one starts with `prefix`, skipping lines that start with
/// one of `also_accept`
async fn read_lines_until_prefix<R>(
    reader: &mut R,
    prefix: &str,
    also_accept: &[&str],
    limit: Duration,
) -> Result<(), ProbeError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = read_line(reader, limit).await?;
        if line.starts_with(prefix) {
            return Ok(());
        }
        if also_accept.iter().any(|accepted| line.starts_with(accepted)) {
            continue;
        }
        return Err(ProbeError::UnexpectedMessage(chomp(&line).to_string()));
    }
}

async fn write_command<W>(writer: &mut W, command: &str, limit: Duration) -> Result<(), ProbeError>
where
    W: AsyncWrite + Unpin,
{
    bounded(limit, "upgrade", writer.write_all(command.as_bytes())).await?;
    bounded(limit, "upgrade", writer.flush()).await
}

async fn smtp_starttls<S>(stream: S, ehlo_hostname: &str, limit: Duration) -> Result<S, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    read_lines_until_prefix(&mut reader, "220 ", &["220-"], limit).await?;
    write_command(&mut reader, &format!("EHLO {ehlo_hostname}\r\n"), limit).await?;
    read_lines_until_prefix(&mut reader, "250 ", &["250-"], limit).await?;
    write_command(&mut reader, "STARTTLS\r\n", limit).await?;
    read_line(&mut reader, limit).await?;

    Ok(reader.into_inner())
}

async fn imap_starttls<S>(stream: S, limit: Duration) -> Result<S, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    read_lines_until_prefix(&mut reader, "* OK", &[], limit).await?;
    write_command(&mut reader, ". CAPABILITY\r\n", limit).await?;
    read_lines_until_prefix(&mut reader, ". OK", &["* CAPABILITY"], limit).await?;
    write_command(&mut reader, ". STARTTLS\r\n", limit).await?;
    read_lines_until_prefix(&mut reader, ". OK", &[], limit).await?;

    Ok(reader.into_inner())
}

async fn ldap_starttls<S>(mut stream: S, limit: Duration) -> Result<S, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    bounded(limit, "upgrade", stream.write_all(&LDAP_STARTTLS_REQUEST)).await?;

    let mut response = [0u8; LDAP_STARTTLS_SUCCESS.len()];
    bounded(limit, "upgrade", stream.read_exact(&mut response)).await?;

    if response != LDAP_STARTTLS_SUCCESS {
        return Err(ProbeError::Protocol(
            "LDAP StartTLS was rejected".to_string(),
        ));
    }

    Ok(stream)
}

async fn postgres_ssl_request<S>(mut stream: S, limit: Duration) -> Result<S, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut packet = Vec::with_capacity(8);
    packet.extend_from_slice(&POSTGRES_SSL_REQUEST_LEN.to_be_bytes());
    packet.extend_from_slice(&POSTGRES_SSL_REQUEST_CODE.to_be_bytes());

    bounded(limit, "upgrade", stream.write_all(&packet)).await?;

    let mut response = [0u8; 1];
    bounded(limit, "upgrade", stream.read_exact(&mut response)).await?;

    if response != *b"S" {
        return Err(ProbeError::Protocol(
            "PostgreSQL server does not accept TLS connections".to_string(),
        ));
    }

    Ok(stream)
}

async fn mysql_ssl_request<S>(mut stream: S, limit: Duration) -> Result<S, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    bounded(limit, "upgrade", stream.read_exact(&mut header)).await?;
    let [len_lo, len_mid, len_hi, _sequence] = header;
    let payload_len = u32::from_le_bytes([len_lo, len_mid, len_hi, 0]) as usize;
    if payload_len > MYSQL_MAX_HANDSHAKE_LEN {
        return Err(ProbeError::Protocol(format!(
            "MySQL handshake packet too large: {payload_len} bytes"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    bounded(limit, "upgrade", stream.read_exact(&mut payload)).await?;

    let capabilities = parse_mysql_handshake(&payload)?;
    if capabilities & MYSQL_CLIENT_SSL == 0 {
        return Err(ProbeError::Protocol("No TLS support".to_string()));
    }

    bounded(limit, "upgrade", stream.write_all(&mysql_ssl_request_packet())).await?;

    Ok(stream)
}

/// `SSLRequest` packet, sequence 1
fn mysql_ssl_request_packet() -> Vec<u8> {
    let payload_len: u32 = 4 + 4 + 1 + 23;
    let [len_lo, len_mid, len_hi, _] = payload_len.to_le_bytes();
    let mut packet = Vec::with_capacity(36);
    packet.extend_from_slice(&[len_lo, len_mid, len_hi]);
    packet.push(1);
    packet.extend_from_slice(&MYSQL_SSL_REQUEST_FLAGS.to_le_bytes());
    packet.extend_from_slice(&MYSQL_MAX_PACKET.to_le_bytes());
    packet.push(MYSQL_UTF8_GENERAL_CI);
    packet.extend_from_slice(&[0u8; 23]);
    packet
}

/// Capability flags announced by the server's initial handshake packet
fn parse_mysql_handshake(payload: &[u8]) -> Result<u32, ProbeError> {
    let malformed = |what: &str| ProbeError::Protocol(format!("invalid MySQL handshake: {what}"));

    let (&protocol_version, rest) = payload
        .split_first()
        .ok_or_else(|| malformed("empty payload"))?;

    if protocol_version == 0xff {
        return Err(ProbeError::Protocol(mysql_error_message(rest)));
    }

    let version_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("missing version terminator"))?;
    // version string + NUL, connection id, auth plugin data part 1, filler
    let cursor = 1 + version_end + 1 + 4 + 8 + 1;

    let lower = payload
        .get(cursor..cursor + 2)
        .ok_or_else(|| malformed("missing capabilities"))?;
    let mut capabilities = u32::from(le_u16(lower).ok_or_else(|| malformed("capabilities"))?);

    // charset, status flags
    let upper_at = cursor + 2 + 1 + 2;
    if let Some(upper) = payload.get(upper_at..upper_at + 2).and_then(le_u16) {
        capabilities |= u32::from(upper) << 16;
    }

    Ok(capabilities)
}

fn le_u16(bytes: &[u8]) -> Option<u16> {
    bytes.try_into().ok().map(u16::from_le_bytes)
}

fn mysql_error_message(rest: &[u8]) -> String {
    let code = rest.get(..2).and_then(le_u16);
    let mut message = rest.get(2..).unwrap_or_default();
    if message.first() == Some(&b'#') {
        message = message.get(6..).unwrap_or_default();
    }
    let message = String::from_utf8_lossy(message);

    match code {
        Some(code) => format!("MySQL server error {code}: {message}"),
        None => "MySQL server error".to_string(),
    }
}
