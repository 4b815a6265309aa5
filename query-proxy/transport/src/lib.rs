//! Outbound HTTP transport with hot-reloaded TLS credentials.
//!
//! The upstream metrics store requires mutual TLS. Its CA bundle, client certificate, and private
//! key are mounted from secrets that are rotated in place, typically by swapping a symlink. A
//! [`Transport`] loads the three files once at startup (failing if any is unusable) and then polls
//! their resolved targets, rebuilding the client configuration whenever one of them changes. A
//! rotation that cannot be loaded is retried with a bounded backoff and otherwise abandoned, leaving
//! the previous configuration in place.
//!
//! [`HttpsConnector`] dials upstream connections for a `hyper-util` client, reading the current
//! client configuration for each new connection.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
mod connect;
mod material;
pub mod metrics;
mod reload;

pub use self::{
    backoff::Backoff,
    connect::{Conn, ConfigSource, HttpsConnector},
    material::{server_auth_config, TlsMaterial, TlsPaths, TlsVersion},
    metrics::ReloadMetrics,
    reload::Transport,
};
use std::{io, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("unsupported TLS version: {0}")]
    UnsupportedVersion(String),

    #[error("uri has no host")]
    MissingHost,

    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}
