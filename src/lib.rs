//! Concurrent TLS certificate checker for network endpoints.
//!
//! Targets are URIs (`https://`, `smtp://`, `imap://`, `ldap://`, `mysql://`,
//! `postgres://`, ...). Each target is resolved to its addresses, every
//! address is upgraded to TLS with the scheme's own handshake, and the peer
//! certificate is classified into health signals handed to a [`report::Reporter`].

pub mod checker;
pub mod cli;
pub mod config;
pub mod evaluation;
pub mod metrics;
pub mod pool;
pub mod pulse;
pub mod report;
pub mod resolver;
pub mod target;
pub mod tls;
