#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;
use tlspulse::{
    report::{HealthSignal, MemoryReporter},
    resolver::Resolver,
    tls::{ProbeContext, TlsContext, TrustConfig},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::{Instant, sleep},
};
use tokio_rustls::TlsAcceptor;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Private CA and a leaf it signed for `localhost` and `127.0.0.1`
pub struct TestPki {
    pub ca_pem: String,
    pub ca_der: CertificateDer<'static>,
    pub leaf_der: CertificateDer<'static>,
    pub leaf_key_der: Vec<u8>,
}

impl TestPki {
    pub fn new() -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tlspulse test CA");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            ca_der: ca_cert.der().clone(),
            leaf_der: leaf_cert.der().clone(),
            leaf_key_der: leaf_key.serialize_der(),
        }
    }

    /// Server presenting the leaf followed by the CA
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key_der.clone()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![self.leaf_der.clone(), self.ca_der.clone()], key)
        .unwrap();

        Arc::new(config)
    }

    /// TLS 1.2 server that insists on a client certificate signed by the CA.
    ///
    /// The client sees the whole chain before the server rejects it, and the
    /// rejection lands inside the handshake.
    pub fn client_auth_server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key_der.clone()));

        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();

        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12])
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.leaf_der.clone(), self.ca_der.clone()], key)
            .unwrap();

        Arc::new(config)
    }

    /// Trust configuration holding the CA, the directory must outlive it
    pub fn trust(&self) -> (TempDir, TrustConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ca.pem");
        std::fs::write(&path, &self.ca_pem).unwrap();
        (
            dir,
            TrustConfig {
                extra_ca: vec![path],
            },
        )
    }
}

pub async fn probe_context(trust: &TrustConfig) -> ProbeContext {
    ProbeContext {
        tls: Arc::new(TlsContext::build(trust, TIMEOUT).await.unwrap()),
        connect_timeout: TIMEOUT,
        ehlo_hostname: "tlspulse.test".to_string(),
    }
}

/// Plaintext dialogue a fake server runs before accepting TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialogue {
    Raw,
    Smtp,
    Imap,
    Ldap,
    Mysql,
    Postgres,
    /// SMTP server that never offers TLS
    SmtpRefusing,
    /// Accept the connection and say nothing
    Silent,
    /// Raw TLS, rejecting clients without a certificate
    ClientAuth,
}

const LDAP_STARTTLS_SUCCESS: [u8; 14] = [
    0x30, 0x0c, 0x02, 0x01, 0x01, 0x78, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
];

async fn read_command<S>(reader: &mut BufReader<S>) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

fn mysql_greeting() -> Vec<u8> {
    let mut payload = vec![10];
    payload.extend_from_slice(b"8.0.36\0");
    payload.extend_from_slice(&7u32.to_le_bytes());
    payload.extend_from_slice(b"abcdefgh");
    payload.push(0);
    // CLIENT_PROTOCOL_41 | CLIENT_SSL | CLIENT_SECURE_CONNECTION
    payload.extend_from_slice(&0x8a00u16.to_le_bytes());
    payload.push(0x21);
    payload.extend_from_slice(&2u16.to_le_bytes());
    payload.extend_from_slice(&0x0000u16.to_le_bytes());

    let [len_lo, len_mid, len_hi, _] = u32::try_from(payload.len()).unwrap().to_le_bytes();
    let mut packet = vec![len_lo, len_mid, len_hi, 0];
    packet.extend_from_slice(&payload);
    packet
}

/// Run the server side of `dialogue`, returns the stream when TLS should start
async fn serve_dialogue(stream: TcpStream, dialogue: Dialogue) -> Option<TcpStream> {
    match dialogue {
        Dialogue::Raw | Dialogue::ClientAuth => Some(stream),
        Dialogue::Smtp | Dialogue::SmtpRefusing => {
            let mut reader = BufReader::new(stream);
            reader
                .get_mut()
                .write_all(b"220-tlspulse.test ESMTP\r\n220 ready\r\n")
                .await
                .unwrap();
            let ehlo = read_command(&mut reader).await;
            assert!(ehlo.starts_with("EHLO tlspulse.test"), "got {ehlo:?}");
            reader
                .get_mut()
                .write_all(b"250-tlspulse.test\r\n250 STARTTLS\r\n")
                .await
                .unwrap();
            let starttls = read_command(&mut reader).await;
            assert_eq!(starttls, "STARTTLS\r\n");
            if dialogue == Dialogue::SmtpRefusing {
                reader
                    .get_mut()
                    .write_all(b"454 TLS not available\r\n")
                    .await
                    .unwrap();
                return None;
            }
            reader.get_mut().write_all(b"220 go ahead\r\n").await.unwrap();
            Some(reader.into_inner())
        }
        Dialogue::Imap => {
            let mut reader = BufReader::new(stream);
            reader
                .get_mut()
                .write_all(b"* OK IMAP4rev1 ready\r\n")
                .await
                .unwrap();
            assert_eq!(read_command(&mut reader).await, ". CAPABILITY\r\n");
            reader
                .get_mut()
                .write_all(b"* CAPABILITY IMAP4rev1 STARTTLS\r\n. OK done\r\n")
                .await
                .unwrap();
            assert_eq!(read_command(&mut reader).await, ". STARTTLS\r\n");
            reader
                .get_mut()
                .write_all(b". OK begin TLS\r\n")
                .await
                .unwrap();
            Some(reader.into_inner())
        }
        Dialogue::Ldap => {
            let mut stream = stream;
            let mut request = [0u8; 31];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request.first(), Some(&0x30));
            stream.write_all(&LDAP_STARTTLS_SUCCESS).await.unwrap();
            Some(stream)
        }
        Dialogue::Mysql => {
            let mut stream = stream;
            stream.write_all(&mysql_greeting()).await.unwrap();
            let mut request = [0u8; 36];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request.get(3), Some(&1));
            Some(stream)
        }
        Dialogue::Postgres => {
            let mut stream = stream;
            let mut request = [0u8; 8];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0, 0, 0, 8, 4, 210, 22, 47]);
            stream.write_all(b"S").await.unwrap();
            Some(stream)
        }
        Dialogue::Silent => {
            sleep(Duration::from_secs(30)).await;
            None
        }
    }
}

/// Fake endpoint on `127.0.0.1` accepting any number of connections
pub async fn spawn_server(pki: &TestPki, dialogue: Dialogue) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(if dialogue == Dialogue::ClientAuth {
        pki.client_auth_server_config()
    } else {
        pki.server_config()
    });

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Some(stream) = serve_dialogue(stream, dialogue).await else {
                    return;
                };
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let mut buf = [0u8; 64];
                    let _ = tls.read(&mut buf).await;
                }
            });
        }
    });

    addr
}

/// A local port nothing listens on
pub fn pick_free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .expect("failed to bind random local port")
        .local_addr()
        .expect("failed to read local addr")
        .port()
}

/// Resolver whose only name server is a local port nobody answers on
pub fn unreachable_resolver() -> Resolver {
    let port = std::net::UdpSocket::bind(("127.0.0.1", 0))
        .expect("failed to bind random local port")
        .local_addr()
        .expect("failed to read local addr")
        .port();
    let servers =
        NameServerConfigGroup::from_ips_clear(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], port, true);
    let mut options = ResolverOpts::default();
    options.timeout = Duration::from_millis(200);
    options.attempts = 1;
    Resolver::with_config(ResolverConfig::from_parts(None, vec![], servers), options)
}

/// Poll `reporter` until `done` holds for its signals or the deadline passes
pub async fn wait_for_signals<F>(reporter: &MemoryReporter, done: F) -> Vec<HealthSignal>
where
    F: Fn(&[HealthSignal]) -> bool,
{
    let deadline = Instant::now() + TIMEOUT * 2;
    loop {
        let signals = reporter.signals();
        if done(&signals) || Instant::now() >= deadline {
            return signals;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

pub fn find<'a>(signals: &'a [HealthSignal], suffix: &str) -> Vec<&'a HealthSignal> {
    signals
        .iter()
        .filter(|signal| signal.service.ends_with(suffix))
        .collect()
}
