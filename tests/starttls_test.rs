#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{Dialogue, TestPki, pick_free_port, probe_context, spawn_server};
use std::{net::IpAddr, time::Duration};
use tlspulse::{
    target::CheckTarget,
    tls::{ProbeError, TrustConfig, VerifyCode, probe},
};

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

async fn handshake(scheme: &str, dialogue: Dialogue) {
    let pki = TestPki::new();
    let (_dir, trust) = pki.trust();
    let context = probe_context(&trust).await;
    let addr = spawn_server(&pki, dialogue).await;

    let target = CheckTarget::parse(&format!("{scheme}://localhost:{}", addr.port())).unwrap();
    let attempt = probe::probe(&context, &target, LOCALHOST).await.unwrap();

    assert!(
        attempt.exception.is_none(),
        "{scheme}: unexpected exception {:?}",
        attempt.exception
    );
    assert_eq!(attempt.verify_code, Some(VerifyCode::OK), "{scheme}");
    assert_eq!(attempt.chain.len(), 2, "{scheme}");
    assert_eq!(attempt.peer_certificate(), Some(&pki.leaf_der));
    assert_eq!(attempt.issuer_certificate(), Some(&pki.ca_der));
    assert!(attempt.protocol_version.is_some());
}

#[tokio::test]
async fn test_raw_tls() {
    handshake("https", Dialogue::Raw).await;
}

#[tokio::test]
async fn test_smtp_starttls() {
    handshake("smtp", Dialogue::Smtp).await;
}

#[tokio::test]
async fn test_submission_uses_smtp() {
    handshake("submission", Dialogue::Smtp).await;
}

#[tokio::test]
async fn test_imap_starttls() {
    handshake("imap", Dialogue::Imap).await;
}

#[tokio::test]
async fn test_ldap_starttls() {
    handshake("ldap", Dialogue::Ldap).await;
}

#[tokio::test]
async fn test_mysql_ssl_request() {
    handshake("mysql", Dialogue::Mysql).await;
}

#[tokio::test]
async fn test_postgres_ssl_request() {
    handshake("postgres", Dialogue::Postgres).await;
}

#[tokio::test]
async fn test_untrusted_chain_still_captured() {
    let pki = TestPki::new();
    let context = probe_context(&TrustConfig::default()).await;
    let addr = spawn_server(&pki, Dialogue::Raw).await;

    let target = CheckTarget::parse(&format!("https://localhost:{}", addr.port())).unwrap();
    let attempt = probe::probe(&context, &target, LOCALHOST).await.unwrap();

    assert!(attempt.exception.is_none());
    assert_eq!(attempt.chain.len(), 2);
    let code = attempt.verify_code.unwrap();
    assert!(!code.is_ok());
    assert_eq!(code, VerifyCode::SELF_SIGNED_CERT_IN_CHAIN);
}

#[tokio::test]
async fn test_smtp_refused_starttls_is_tls_exception() {
    let pki = TestPki::new();
    let (_dir, trust) = pki.trust();
    let context = probe_context(&trust).await;
    let addr = spawn_server(&pki, Dialogue::SmtpRefusing).await;

    let target = CheckTarget::parse(&format!("smtp://localhost:{}", addr.port())).unwrap();
    let attempt = probe::probe(&context, &target, LOCALHOST).await.unwrap();

    assert!(attempt.exception.is_some());
    assert!(attempt.chain.is_empty());
    assert!(attempt.peer_certificate().is_none());
}

#[tokio::test]
async fn test_rejected_handshake_keeps_certificates() {
    let pki = TestPki::new();
    let (_dir, trust) = pki.trust();
    let context = probe_context(&trust).await;
    let addr = spawn_server(&pki, Dialogue::ClientAuth).await;

    let target = CheckTarget::parse(&format!("https://localhost:{}", addr.port())).unwrap();
    let attempt = probe::probe(&context, &target, LOCALHOST).await.unwrap();

    let exception = attempt.exception.as_deref().unwrap();
    assert!(exception.contains("fatal alert"), "got {exception:?}");
    assert_eq!(attempt.chain.len(), 2);
    assert_eq!(attempt.verify_code, Some(VerifyCode::OK));
    assert_eq!(attempt.peer_certificate(), Some(&pki.leaf_der));
    assert_eq!(attempt.issuer_certificate(), Some(&pki.ca_der));
}

#[tokio::test]
async fn test_connection_refused() {
    let context = probe_context(&TrustConfig::default()).await;
    let port = pick_free_port();

    let target = CheckTarget::parse(&format!("https://localhost:{port}")).unwrap();
    let err = probe::probe(&context, &target, LOCALHOST).await.unwrap_err();

    assert!(matches!(err, ProbeError::Connect { .. }), "got {err:?}");
    assert_eq!(err.kind(), "connection");
    assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let pki = TestPki::new();
    let mut context = probe_context(&TrustConfig::default()).await;
    context.connect_timeout = Duration::from_millis(300);
    let addr = spawn_server(&pki, Dialogue::Silent).await;

    let target = CheckTarget::parse(&format!("smtp://localhost:{}", addr.port())).unwrap();
    let err = probe::probe(&context, &target, LOCALHOST).await.unwrap_err();

    assert!(matches!(err, ProbeError::Timeout { .. }), "got {err:?}");
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_unknown_scheme_without_port() {
    let context = probe_context(&TrustConfig::default()).await;
    let target = CheckTarget::parse("gopher://localhost").unwrap();

    let err = probe::probe(&context, &target, LOCALHOST).await.unwrap_err();
    assert_eq!(err.to_string(), "No default port for gopher scheme");
}
