use crate::{
    config::Thresholds,
    target::{CheckTarget, endpoint_name},
    tls::{
        config::TlsContext,
        facts::CertificateFacts,
        ocsp::{self, OcspStatus},
        probe::HandshakeAttempt,
        verifier::VerifyCode,
    },
};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use tokio::sync::OnceCell;
use tracing::debug;

/// Everything known about one (target, address) handshake.
///
/// Certificate facts are parsed once on construction, the OCSP outcome is
/// fetched at most once, on first use.
#[derive(Debug)]
pub struct Evaluation {
    target: CheckTarget,
    address: IpAddr,
    port: u16,
    attempt: HandshakeAttempt,
    facts: Option<CertificateFacts>,
    now: DateTime<Utc>,
    thresholds: Thresholds,
    ocsp: OnceCell<OcspStatus>,
}

impl Evaluation {
    #[must_use]
    pub fn new(
        target: CheckTarget,
        address: IpAddr,
        port: u16,
        mut attempt: HandshakeAttempt,
        thresholds: Thresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let parsed = attempt
            .peer_certificate()
            .map(|der| CertificateFacts::parse(der.as_ref()));

        let facts = match parsed {
            Some(Ok(facts)) => Some(facts),
            Some(Err(e)) => {
                debug!(uri = %target, "unusable peer certificate: {e:#}");
                if attempt.exception.is_none() {
                    attempt.exception = Some(format!("Invalid peer certificate: {e:#}"));
                }
                None
            }
            None => None,
        };

        Self {
            target,
            address,
            port,
            attempt,
            facts,
            now,
            thresholds,
            ocsp: OnceCell::new(),
        }
    }

    /// Use a known OCSP outcome instead of asking the responder
    #[must_use]
    pub fn with_ocsp(mut self, status: OcspStatus) -> Self {
        self.ocsp = OnceCell::new_with(Some(status));
        self
    }

    #[must_use]
    pub const fn target(&self) -> &CheckTarget {
        &self.target
    }

    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        endpoint_name(self.address, self.port)
    }

    #[must_use]
    pub const fn attempt(&self) -> &HandshakeAttempt {
        &self.attempt
    }

    /// `None` when the peer presented no usable certificate
    #[must_use]
    pub const fn facts(&self) -> Option<&CertificateFacts> {
        self.facts.as_ref()
    }

    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    #[must_use]
    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    #[must_use]
    pub fn exception(&self) -> Option<&str> {
        self.attempt.exception.as_deref()
    }

    #[must_use]
    pub fn not_valid_yet(&self) -> bool {
        self.facts
            .as_ref()
            .is_some_and(|facts| facts.not_valid_yet(self.now))
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        self.facts
            .as_ref()
            .is_some_and(|facts| facts.expired(self.now))
    }

    /// Identity is always checked against the configured hostname
    #[must_use]
    pub fn valid_identity(&self) -> bool {
        self.facts
            .as_ref()
            .is_some_and(|facts| facts.valid_identity(self.target.hostname()))
    }

    #[must_use]
    pub fn verify_code(&self) -> VerifyCode {
        self.attempt.verify_code.unwrap_or(VerifyCode::UNSPECIFIED)
    }

    #[must_use]
    pub fn trusted(&self) -> bool {
        self.attempt.verify_code.is_some_and(VerifyCode::is_ok)
    }

    /// OCSP outcome, queried from the responder on first call
    pub async fn ocsp(&self, tls: &TlsContext) -> &OcspStatus {
        self.ocsp
            .get_or_init(|| async {
                match self.attempt.peer_certificate() {
                    Some(leaf) => {
                        ocsp::check(
                            tls.http(),
                            leaf.as_ref(),
                            self.attempt.issuer_certificate().map(AsRef::as_ref),
                        )
                        .await
                    }
                    None => OcspStatus::NotApplicable,
                }
            })
            .await
    }

    /// Failing conditions in reporting order, empty when the certificate is fine
    #[must_use]
    pub fn issues(&self, ocsp: Option<&OcspStatus>) -> Vec<&'static str> {
        let mut issues = Vec::new();

        if self.not_valid_yet() {
            issues.push("Certificate is not valid yet");
        }
        if self.expired() {
            issues.push("Certificate has expired");
        }
        if !self.valid_identity() {
            issues.push("Certificate identity could not be verified");
        }
        if !self.trusted() {
            issues.push("Certificate is not trusted");
        }
        if let Some(status) = ocsp
            && status.is_applicable()
            && !status.is_valid()
        {
            issues.push("Certificate OCSP verification failed");
        }

        issues
    }
}
