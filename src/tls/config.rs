use super::verifier::CapturingVerifier;
use anyhow::{Context, Result, anyhow, bail};
use rustls::{
    ClientConfig, RootCertStore,
    client::WebPkiServerVerifier,
    crypto::{CryptoProvider, ring::default_provider},
    pki_types::CertificateDer,
};
use rustls_pemfile::certs;
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Extra trust material added to the default roots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustConfig {
    /// Certificate files (PEM or DER) or directories of them
    pub extra_ca: Vec<PathBuf>,
}

/// Trust store, verifier and OCSP client shared by every probe.
///
/// Built once before the pools start, read-only afterwards.
#[derive(Debug)]
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    verifier: Arc<WebPkiServerVerifier>,
    http: reqwest::Client,
}

impl TlsContext {
    /// # Errors
    ///
    /// Returns an error if an extra CA path is unreadable or holds no
    /// certificate, or if the verifier or HTTP client cannot be built
    pub async fn build(trust: &TrustConfig, ocsp_timeout: Duration) -> Result<Self> {
        let mut root_store: RootCertStore =
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();

        for path in &trust.extra_ca {
            let extra = load_trust_path(path).await?;
            let (added, ignored) = root_store.add_parsable_certificates(extra);
            if added == 0 {
                bail!("no usable CA certificate in {}", path.display());
            }
            info!(
                path = %path.display(),
                added, ignored, "added extra trusted certificates"
            );
        }

        let provider = Arc::new(default_provider());
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
                .build()
                .map_err(|e| anyhow!("failed to build WebPKI verifier: {e}"))?;

        let http = reqwest::Client::builder()
            .timeout(ocsp_timeout)
            .connect_timeout(ocsp_timeout)
            .build()
            .context("failed to build OCSP HTTP client")?;

        Ok(Self {
            provider,
            verifier,
            http,
        })
    }

    /// Verifier for a single connection
    #[must_use]
    pub fn capturing_verifier(&self) -> Arc<CapturingVerifier> {
        Arc::new(CapturingVerifier::new(self.verifier.clone()))
    }

    /// Client configuration that reports trust through `verifier` instead of
    /// enforcing it
    ///
    /// # Errors
    ///
    /// Returns an error if the provider supports no protocol version
    pub fn client_config(&self, verifier: Arc<CapturingVerifier>) -> Result<ClientConfig> {
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(config)
    }

    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Certificates from a file, or from every file of a directory
async fn load_trust_path(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("failed to read trust path {}", path.display()))?;

    if !metadata.is_dir() {
        return load_cert_file(path).await;
    }

    let mut entries = fs::read_dir(path)
        .await
        .with_context(|| format!("failed to list trust directory {}", path.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut loaded = Vec::new();
    for file in files {
        match load_cert_file(&file).await {
            Ok(mut certs) => loaded.append(&mut certs),
            Err(e) => debug!(path = %file.display(), "skipping trust file: {e:#}"),
        }
    }

    if loaded.is_empty() {
        bail!("no certificates found in {}", path.display());
    }

    Ok(loaded)
}

async fn load_cert_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("failed to read certificate {}", path.display()))?;

    // a single DER certificate
    if data.first() == Some(&0x30) && X509Certificate::from_der(&data).is_ok() {
        return Ok(vec![CertificateDer::from(data)]);
    }

    let mut reader = Cursor::new(&data);
    let parsed = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid certificate PEM in {}: {e}", path.display()))?;

    if parsed.is_empty() {
        bail!("no certificates found in {}", path.display());
    }

    Ok(parsed)
}
