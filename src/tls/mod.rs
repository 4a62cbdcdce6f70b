//! TLS handshake and certificate evaluation
//!
//! # Module Organization
//!
//! - `config` - trust store, extra CA material and the shared [`config::TlsContext`]
//! - `verifier` - verifier that records the peer chain and its verify code
//! - `probe` - per-scheme STARTTLS upgrades and the TLS begin step
//! - `facts` - validity, renewal window and identity of a peer certificate
//! - `ocsp` - OCSP request, responder round-trip and response verification

pub mod config;
pub mod facts;
pub mod ocsp;
pub mod probe;
pub mod verifier;

pub use config::{TlsContext, TrustConfig};
pub use facts::CertificateFacts;
pub use ocsp::OcspStatus;
pub use probe::{HandshakeAttempt, ProbeContext, ProbeError, Protocol};
pub use verifier::VerifyCode;
