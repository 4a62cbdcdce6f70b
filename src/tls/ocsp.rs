//! OCSP status of a peer certificate (RFC 6960).
//!
//! The request carries a single SHA-1 `CertID` and a random nonce. The
//! response must be signed by the issuer, or by a responder certificate the
//! issuer signed for OCSP signing. Anything that cannot be established this
//! way is reported as not applicable rather than as a failure.

use super::facts::CertificateFacts;
use ring::{
    digest::{SHA1_FOR_LEGACY_USE_ONLY, digest},
    signature::{self, UnparsedPublicKey, VerificationAlgorithm},
};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use x509_parser::{
    asn1_rs::{
        self, Any, BitString, Class, Enumerated, FromDer, Header, Integer, Length, Null,
        OctetString, Oid, Sequence, SerializeError, Tag, ToDer, oid,
    },
    oid_registry::{
        OID_HASH_SHA1, OID_PKCS1_SHA1WITHRSA, OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA,
        OID_PKCS1_SHA512WITHRSA, OID_SIG_ECDSA_WITH_SHA256, OID_SIG_ECDSA_WITH_SHA384,
        OID_SIG_ED25519,
    },
    prelude::X509Certificate,
};

// id-pkix-ocsp-basic and id-pkix-ocsp-nonce
const OID_OCSP_BASIC: Oid<'static> = oid!(1.3.6.1.5.5.7.48.1.1);
const OID_OCSP_NONCE: Oid<'static> = oid!(1.3.6.1.5.5.7.48.1.2);

const NONCE_LEN: usize = 16;

/// OCSP outcome for one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcspStatus {
    /// No issuer, no responder, or no usable answer
    NotApplicable,
    Good,
    Revoked,
    Unknown,
}

impl OcspStatus {
    #[must_use]
    pub const fn is_applicable(&self) -> bool {
        !matches!(self, Self::NotApplicable)
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Good)
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::NotApplicable => "",
            Self::Good => "successful",
            Self::Revoked => "revoked",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OcspStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Error)]
pub enum OcspError {
    #[error("malformed DER: {0}")]
    Der(#[from] asn1_rs::Error),

    #[error("DER encoding failed: {0}")]
    Encode(#[from] SerializeError),

    #[error("malformed response: {0}")]
    Malformed(&'static str),

    #[error("certificate parse error: {0}")]
    Certificate(String),

    #[error("OCSP responder returned {0}")]
    Unsuccessful(&'static str),

    #[error("unsupported response type")]
    UnsupportedResponseType,

    #[error("unsupported signature algorithm")]
    UnsupportedSignatureAlgorithm,

    #[error("response signature could not be verified")]
    BadSignature,

    #[error("no response for the certificate serial")]
    NoMatchingResponse,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

impl From<asn1_rs::Err<asn1_rs::Error>> for OcspError {
    fn from(e: asn1_rs::Err<asn1_rs::Error>) -> Self {
        Self::Der(e.into())
    }
}

/// Query the leaf's OCSP responder
///
/// Every failure collapses to [`OcspStatus::NotApplicable`]
pub async fn check(
    http: &reqwest::Client,
    leaf_der: &[u8],
    issuer_der: Option<&[u8]>,
) -> OcspStatus {
    let Some(issuer_der) = issuer_der else {
        return OcspStatus::NotApplicable;
    };

    let url = match CertificateFacts::parse(leaf_der) {
        Ok(facts) => match facts.ocsp_url {
            Some(url) => url,
            None => return OcspStatus::NotApplicable,
        },
        Err(e) => {
            debug!("OCSP skipped: {e:#}");
            return OcspStatus::NotApplicable;
        }
    };

    match query(http, &url, leaf_der, issuer_der).await {
        Ok(status) => status,
        Err(e) => {
            debug!(url, "OCSP not applicable: {e}");
            OcspStatus::NotApplicable
        }
    }
}

async fn query(
    http: &reqwest::Client,
    url: &str,
    leaf_der: &[u8],
    issuer_der: &[u8],
) -> Result<OcspStatus, OcspError> {
    let leaf = parse_certificate(leaf_der)?;
    let issuer = parse_certificate(issuer_der)?;
    let nonce: [u8; NONCE_LEN] = rand::random();
    let request = build_request(&leaf, &issuer, &nonce)?;

    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/ocsp-request")
        .body(request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(OcspError::HttpStatus(response.status().as_u16()));
    }

    let body = response.bytes().await?;
    evaluate_response(&body, &leaf, &issuer)
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, OcspError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| OcspError::Certificate(e.to_string()))
}

/// DER `OCSPRequest` for `leaf` with a nonce extension
///
/// # Errors
///
/// Returns an error if a field cannot be encoded
pub fn build_request(
    leaf: &X509Certificate<'_>,
    issuer: &X509Certificate<'_>,
    nonce: &[u8],
) -> Result<Vec<u8>, OcspError> {
    let request = encode_sequence(&[cert_id(leaf, issuer)?])?;
    let request_list = encode_sequence(&[request])?;

    let nonce = OctetString::new(nonce).to_der_vec()?;
    let nonce_ext = encode_sequence(&[
        OID_OCSP_NONCE.to_der_vec()?,
        OctetString::new(&nonce).to_der_vec()?,
    ])?;
    let extensions = encode_explicit(2, &encode_sequence(&[nonce_ext])?)?;

    let tbs_request = encode_sequence(&[request_list, extensions])?;
    encode_sequence(&[tbs_request])
}

fn cert_id(leaf: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Result<Vec<u8>, OcspError> {
    let algorithm = encode_sequence(&[OID_HASH_SHA1.to_der_vec()?, Null::new().to_der_vec()?])?;
    let name_hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, issuer.subject().as_raw());
    let key_hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, spki_bits(issuer));

    encode_sequence(&[
        algorithm,
        OctetString::new(name_hash.as_ref()).to_der_vec()?,
        OctetString::new(key_hash.as_ref()).to_der_vec()?,
        Integer::new(leaf.raw_serial()).to_der_vec()?,
    ])
}

fn spki_bits<'a>(cert: &'a X509Certificate<'_>) -> &'a [u8] {
    &cert.public_key().subject_public_key.data
}

/// SEQUENCE around members that are already encoded
fn encode_sequence(members: &[Vec<u8>]) -> Result<Vec<u8>, OcspError> {
    Ok(Sequence::new(members.concat().into()).to_der_vec()?)
}

/// Explicit context-specific `[tag]` around encoded content
fn encode_explicit(tag: u32, content: &[u8]) -> Result<Vec<u8>, OcspError> {
    let header = Header::new(
        Class::ContextSpecific,
        true,
        Tag(tag),
        Length::Definite(content.len()),
    );
    Ok(Any::new(header, content).to_der_vec()?)
}

/// Next element of `input`, which must be `tag` in `class`
fn parse_tagged(input: &[u8], class: Class, tag: Tag) -> Result<(&[u8], Any<'_>), OcspError> {
    let (rest, any) = Any::from_der(input)?;
    any.class().assert_eq(class)?;
    any.tag().assert_eq(tag)?;
    Ok((rest, any))
}

fn parse_sequence(input: &[u8]) -> Result<(&[u8], Any<'_>), OcspError> {
    parse_tagged(input, Class::Universal, Tag::Sequence)
}

/// The encoded bytes of `input` in front of `rest`
fn consumed<'a>(input: &'a [u8], rest: &[u8]) -> &'a [u8] {
    input
        .get(..input.len().saturating_sub(rest.len()))
        .unwrap_or_default()
}

/// Decode an `OCSPResponse`, check its signature and return the status of
/// `leaf`
///
/// # Errors
///
/// Returns an error for unsuccessful responses, unverifiable signatures and
/// malformed or unrelated answers
pub fn evaluate_response(
    body: &[u8],
    leaf: &X509Certificate<'_>,
    issuer: &X509Certificate<'_>,
) -> Result<OcspStatus, OcspError> {
    let (_, response) = parse_sequence(body)?;

    let (rest, status) = Enumerated::from_der(response.data)?;
    match status.0 {
        0 => {}
        1 => return Err(OcspError::Unsuccessful("malformedRequest")),
        2 => return Err(OcspError::Unsuccessful("internalError")),
        3 => return Err(OcspError::Unsuccessful("tryLater")),
        5 => return Err(OcspError::Unsuccessful("sigRequired")),
        6 => return Err(OcspError::Unsuccessful("unauthorized")),
        _ => return Err(OcspError::Malformed("response status")),
    }

    let (_, response_bytes) = parse_tagged(rest, Class::ContextSpecific, Tag(0))?;
    let (_, response_bytes) = parse_sequence(response_bytes.data)?;
    let (rest, response_type) = Oid::from_der(response_bytes.data)?;
    if response_type != OID_OCSP_BASIC {
        return Err(OcspError::UnsupportedResponseType);
    }
    let (_, basic) = parse_tagged(rest, Class::Universal, Tag::OctetString)?;

    let (_, basic) = parse_sequence(basic.data)?;
    let (rest, signed) = SignedData::parse(basic.data)?;
    let certs = if rest.is_empty() {
        &[][..]
    } else {
        let (_, certs) = parse_tagged(rest, Class::ContextSpecific, Tag(0))?;
        parse_sequence(certs.data)?.1.data
    };

    verify_signer(&signed, certs, issuer)?;

    single_response_status(signed.tbs_content, leaf.raw_serial())
}

/// `tbs` + algorithm + signature, shared by certificates and basic responses
struct SignedData<'a> {
    tbs_raw: &'a [u8],
    tbs_content: &'a [u8],
    algorithm: Oid<'a>,
    signature: BitString<'a>,
}

impl<'a> SignedData<'a> {
    fn parse(input: &'a [u8]) -> Result<(&'a [u8], Self), OcspError> {
        let (rest, tbs) = parse_sequence(input)?;
        let tbs_raw = consumed(input, rest);

        let (rest, algorithm) = parse_sequence(rest)?;
        let (_, algorithm) = Oid::from_der(algorithm.data)?;

        let (rest, signature) = BitString::from_der(rest)?;
        if signature.unused_bits != 0 {
            return Err(OcspError::Malformed("signature bits"));
        }

        Ok((
            rest,
            Self {
                tbs_raw,
                tbs_content: tbs.data,
                algorithm,
                signature,
            },
        ))
    }

    fn verify(&self, public_key: &[u8]) -> Result<(), OcspError> {
        let algorithm = verification_algorithm(&self.algorithm, public_key)?;
        UnparsedPublicKey::new(algorithm, public_key)
            .verify(self.tbs_raw, self.signature.as_ref())
            .map_err(|_| OcspError::BadSignature)
    }
}

fn verification_algorithm(
    oid: &Oid<'_>,
    public_key: &[u8],
) -> Result<&'static dyn VerificationAlgorithm, OcspError> {
    // uncompressed P-384 points are 97 bytes, P-256 65
    let p384 = public_key.len() == 97;

    let algorithm: &'static dyn VerificationAlgorithm = if *oid == OID_PKCS1_SHA1WITHRSA {
        &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY
    } else if *oid == OID_PKCS1_SHA256WITHRSA {
        &signature::RSA_PKCS1_2048_8192_SHA256
    } else if *oid == OID_PKCS1_SHA384WITHRSA {
        &signature::RSA_PKCS1_2048_8192_SHA384
    } else if *oid == OID_PKCS1_SHA512WITHRSA {
        &signature::RSA_PKCS1_2048_8192_SHA512
    } else if *oid == OID_SIG_ECDSA_WITH_SHA256 {
        if p384 {
            &signature::ECDSA_P384_SHA256_ASN1
        } else {
            &signature::ECDSA_P256_SHA256_ASN1
        }
    } else if *oid == OID_SIG_ECDSA_WITH_SHA384 {
        if p384 {
            &signature::ECDSA_P384_SHA384_ASN1
        } else {
            &signature::ECDSA_P256_SHA384_ASN1
        }
    } else if *oid == OID_SIG_ED25519 {
        &signature::ED25519
    } else {
        return Err(OcspError::UnsupportedSignatureAlgorithm);
    };

    Ok(algorithm)
}

/// The response is signed by the issuer itself, or by a delegated responder
/// certificate the issuer signed with the OCSP signing purpose
fn verify_signer(
    signed: &SignedData<'_>,
    certs: &[u8],
    issuer: &X509Certificate<'_>,
) -> Result<(), OcspError> {
    if signed.verify(spki_bits(issuer)).is_ok() {
        return Ok(());
    }

    let mut rest = certs;
    while !rest.is_empty() {
        let (next, cert) = parse_sequence(rest)?;
        let raw = consumed(rest, next);
        rest = next;

        let Ok(responder) = parse_certificate(raw) else {
            continue;
        };
        if responder.issuer().as_raw() != issuer.subject().as_raw() {
            continue;
        }

        let ocsp_signing = responder
            .extended_key_usage()
            .ok()
            .flatten()
            .is_some_and(|eku| eku.value.ocsp_signing);
        if !ocsp_signing {
            continue;
        }

        let issued_by_issuer = SignedData::parse(cert.data)
            .and_then(|(_, cert)| cert.verify(spki_bits(issuer)))
            .is_ok();
        if issued_by_issuer && signed.verify(spki_bits(&responder)).is_ok() {
            return Ok(());
        }
    }

    Err(OcspError::BadSignature)
}

fn single_response_status(tbs_content: &[u8], serial: &[u8]) -> Result<OcspStatus, OcspError> {
    let (mut rest, mut responder_id) = Any::from_der(tbs_content)?;
    if responder_id.class() == Class::ContextSpecific && responder_id.tag() == Tag(0) {
        // version
        (rest, responder_id) = Any::from_der(rest)?;
    }
    responder_id.class().assert_eq(Class::ContextSpecific)?;
    if !matches!(responder_id.tag(), Tag(1 | 2)) {
        return Err(OcspError::Malformed("responder id"));
    }

    let (rest, _produced_at) = parse_tagged(rest, Class::Universal, Tag::GeneralizedTime)?;
    let (_, responses) = parse_sequence(rest)?;

    let mut responses = responses.data;
    while !responses.is_empty() {
        let (next, single) = parse_sequence(responses)?;
        responses = next;

        let (status, cert_id) = parse_sequence(single.data)?;
        let (cert_id, _hash_algorithm) = parse_sequence(cert_id.data)?;
        let (cert_id, _issuer_name_hash) =
            parse_tagged(cert_id, Class::Universal, Tag::OctetString)?;
        let (cert_id, _issuer_key_hash) =
            parse_tagged(cert_id, Class::Universal, Tag::OctetString)?;
        let (_, serial_number) = parse_tagged(cert_id, Class::Universal, Tag::Integer)?;
        if serial_number.data != serial {
            continue;
        }

        let (_, cert_status) = Any::from_der(status)?;
        cert_status.class().assert_eq(Class::ContextSpecific)?;
        return match cert_status.tag() {
            Tag(0) => Ok(OcspStatus::Good),
            Tag(1) => Ok(OcspStatus::Revoked),
            Tag(2) => Ok(OcspStatus::Unknown),
            _ => Err(OcspError::Malformed("cert status")),
        };
    }

    Err(OcspError::NoMatchingResponse)
}
