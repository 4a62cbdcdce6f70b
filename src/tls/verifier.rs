use rustls::{
    CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use std::{
    fmt,
    sync::{Arc, Mutex},
};
use x509_parser::prelude::{FromDer, X509Certificate};

/// X.509 verify result texts, indexed by code
const VERIFY_CODE_TEXTS: [&str; 29] = [
    "ok",
    "unspecified certificate verification error",
    "unable to get issuer certificate",
    "unable to get certificate CRL",
    "unable to decrypt certificate's signature",
    "unable to decrypt CRL's signature",
    "unable to decode issuer public key",
    "certificate signature failure",
    "CRL signature failure",
    "certificate is not yet valid",
    "certificate has expired",
    "CRL is not yet valid",
    "CRL has expired",
    "format error in certificate's notBefore field",
    "format error in certificate's notAfter field",
    "format error in CRL's lastUpdate field",
    "format error in CRL's nextUpdate field",
    "out of memory",
    "self-signed certificate",
    "self-signed certificate in certificate chain",
    "unable to get local issuer certificate",
    "unable to verify the first certificate",
    "certificate chain too long",
    "certificate revoked",
    "issuer certificate doesn't have a public key",
    "path length constraint exceeded",
    "unsuitable certificate purpose",
    "certificate not trusted",
    "certificate rejected",
];

/// Outcome of chain-of-trust validation, using the X.509 verify code space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerifyCode(pub u32);

impl VerifyCode {
    pub const OK: Self = Self(0);
    pub const UNSPECIFIED: Self = Self(1);
    pub const CERT_SIGNATURE_FAILURE: Self = Self(7);
    pub const CERT_NOT_YET_VALID: Self = Self(9);
    pub const CERT_HAS_EXPIRED: Self = Self(10);
    pub const DEPTH_ZERO_SELF_SIGNED_CERT: Self = Self(18);
    pub const SELF_SIGNED_CERT_IN_CHAIN: Self = Self(19);
    pub const UNABLE_TO_GET_ISSUER_CERT_LOCALLY: Self = Self(20);
    pub const CERT_REVOKED: Self = Self(23);
    pub const INVALID_PURPOSE: Self = Self(26);

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == Self::OK.0
    }

    /// Human readable text, `None` outside the known table
    #[must_use]
    pub fn text(self) -> Option<&'static str> {
        usize::try_from(self.0)
            .ok()
            .and_then(|index| VERIFY_CODE_TEXTS.get(index))
            .copied()
    }

    /// Map a rustls verification result onto the code table.
    ///
    /// Name mismatches count as success, identity is checked separately.
    #[must_use]
    pub fn from_verification(
        result: &Result<ServerCertVerified, TlsError>,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Self {
        let Err(err) = result else {
            return Self::OK;
        };

        match err {
            TlsError::InvalidCertificate(cert_err) => match cert_err {
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. } => Self::OK,
                CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
                    Self::CERT_NOT_YET_VALID
                }
                CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                    Self::CERT_HAS_EXPIRED
                }
                CertificateError::BadSignature => Self::CERT_SIGNATURE_FAILURE,
                CertificateError::Revoked => Self::CERT_REVOKED,
                CertificateError::InvalidPurpose
                | CertificateError::InvalidPurposeContext { .. } => Self::INVALID_PURPOSE,
                CertificateError::UnknownIssuer => {
                    if is_self_issued(end_entity) {
                        Self::DEPTH_ZERO_SELF_SIGNED_CERT
                    } else if intermediates.iter().any(is_self_issued) {
                        Self::SELF_SIGNED_CERT_IN_CHAIN
                    } else {
                        Self::UNABLE_TO_GET_ISSUER_CERT_LOCALLY
                    }
                }
                _ => Self::UNSPECIFIED,
            },
            _ => Self::UNSPECIFIED,
        }
    }
}

impl fmt::Display for VerifyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text() {
            Some(text) => write!(f, "{} - {text}", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

fn is_self_issued(cert: &CertificateDer<'_>) -> bool {
    X509Certificate::from_der(cert.as_ref())
        .is_ok_and(|(_, cert)| cert.subject().as_raw() == cert.issuer().as_raw())
}

/// Peer chain and verify code recorded during the handshake
#[derive(Debug, Clone)]
pub struct CapturedChain {
    /// Leaf first, as presented by the peer
    pub chain: Vec<CertificateDer<'static>>,
    pub verify_code: VerifyCode,
}

/// A certificate verifier that records the peer chain and the outcome of the
/// `WebPKI` validation, then lets the handshake proceed.
///
/// Trust is reported, not enforced: the handshake must complete against
/// untrusted peers so their certificate can be inspected. One instance is
/// built per connection.
pub struct CapturingVerifier {
    captured: Mutex<Option<CapturedChain>>,
    inner_verifier: Arc<WebPkiServerVerifier>,
}

impl fmt::Debug for CapturingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturingVerifier")
            .field("captured", &self.captured)
            .field("inner_verifier", &"WebPkiServerVerifier")
            .finish()
    }
}

impl CapturingVerifier {
    #[must_use]
    pub const fn new(inner_verifier: Arc<WebPkiServerVerifier>) -> Self {
        Self {
            captured: Mutex::new(None),
            inner_verifier,
        }
    }

    /// `None` until the peer presented its certificate
    #[must_use]
    pub fn captured(&self) -> Option<CapturedChain> {
        self.captured.lock().ok()?.clone()
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let result = self.inner_verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        let verify_code = VerifyCode::from_verification(&result, end_entity, intermediates);

        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.clone().into_owned())
            .collect();

        if let Ok(mut captured) = self.captured.lock() {
            *captured = Some(CapturedChain { chain, verify_code });
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner_verifier
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner_verifier
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner_verifier.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use rcgen::generate_simple_self_signed;

    fn self_signed() -> CertificateDer<'static> {
        let certified = generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        certified.cert.der().clone()
    }

    #[test]
    fn test_verify_code_display() {
        assert_eq!(VerifyCode::OK.to_string(), "0 - ok");
        assert_eq!(
            VerifyCode(18).to_string(),
            "18 - self-signed certificate"
        );
        assert_eq!(VerifyCode(28).to_string(), "28 - certificate rejected");
    }

    #[test]
    fn test_unknown_verify_code_is_raw_number() {
        assert_eq!(VerifyCode(29).to_string(), "29");
        assert_eq!(VerifyCode(62).to_string(), "62");
        assert!(VerifyCode(62).text().is_none());
    }

    #[test]
    fn test_verify_code_is_ok() {
        assert!(VerifyCode::OK.is_ok());
        assert!(!VerifyCode::CERT_HAS_EXPIRED.is_ok());
    }

    #[test]
    fn test_from_verification_success() {
        let leaf = self_signed();
        let result = Ok(ServerCertVerified::assertion());
        assert_eq!(
            VerifyCode::from_verification(&result, &leaf, &[]),
            VerifyCode::OK
        );
    }

    #[test]
    fn test_from_verification_name_mismatch_is_ok() {
        let leaf = self_signed();
        let result = Err(TlsError::InvalidCertificate(
            CertificateError::NotValidForName,
        ));
        assert_eq!(
            VerifyCode::from_verification(&result, &leaf, &[]),
            VerifyCode::OK
        );
    }

    #[test]
    fn test_from_verification_time_errors() {
        let leaf = self_signed();
        let expired = Err(TlsError::InvalidCertificate(CertificateError::Expired));
        assert_eq!(
            VerifyCode::from_verification(&expired, &leaf, &[]),
            VerifyCode::CERT_HAS_EXPIRED
        );

        let not_yet = Err(TlsError::InvalidCertificate(CertificateError::NotValidYet));
        assert_eq!(
            VerifyCode::from_verification(&not_yet, &leaf, &[]),
            VerifyCode::CERT_NOT_YET_VALID
        );
    }

    #[test]
    fn test_from_verification_unknown_issuer() {
        let result = Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer));

        let self_signed_leaf = self_signed();
        assert_eq!(
            VerifyCode::from_verification(&result, &self_signed_leaf, &[]),
            VerifyCode::DEPTH_ZERO_SELF_SIGNED_CERT
        );

        // leaf issued by a CA that is not in the store
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        assert_eq!(
            VerifyCode::from_verification(&result, leaf.der(), &[]),
            VerifyCode::UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        );
        assert_eq!(
            VerifyCode::from_verification(&result, leaf.der(), &[ca.der().clone()]),
            VerifyCode::SELF_SIGNED_CERT_IN_CHAIN
        );
    }

    #[test]
    fn test_from_verification_other_error() {
        let leaf = self_signed();
        let result = Err(TlsError::General("boom".to_string()));
        assert_eq!(
            VerifyCode::from_verification(&result, &leaf, &[]),
            VerifyCode::UNSPECIFIED
        );
    }
}
