//! Origin-local forward proxies
//!
//! Optional SOCKS5 and HTTP CONNECT front-ends on the origin. Each accepted
//! proxy connection opens a FORWARD substream through the session pool; the
//! edge dials the requested target and the proxy splices bytes. This is the
//! forward direction of the tunnel: same sessions, opposite initiative.

pub mod http;
pub mod socks5;

use thiserror::Error;

/// Proxy protocol errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol version: {0}")]
    Version(u8),

    #[error("unsupported command: {0}")]
    Command(u8),

    #[error("unsupported address type: {0}")]
    AddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("no tunnel session available")]
    NoSession,
}
