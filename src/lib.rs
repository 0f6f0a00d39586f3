//! # Veiltun
//!
//! A bidirectional encrypted reverse tunnel for traversing networks that
//! deploy deep packet inspection.
//!
//! An *edge* node sits inside the restricted network, terminates user TCP/UDP
//! traffic on mapped ports, and relays it through long-lived multiplexed
//! sessions to an *origin* node outside, which dials the final targets. The
//! transport between the two impersonates an HTTP/WebSocket upgrade; after the
//! handshake the connection carries AES-256-GCM packets framing a credit-based
//! stream multiplexer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Port Mappings (edge)                 │
//! │        (TCP/UDP listeners, per-flow substreams)     │
//! ├─────────────────────────────────────────────────────┤
//! │            Stream Routing + Session Pool            │
//! │      (type tags, target headers, round-robin)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Stream Multiplexer                  │
//! │           (substreams, credits, keepalive)          │
//! ├─────────────────────────────────────────────────────┤
//! │               Framed Crypto Channel                 │
//! │     (AES-256-GCM packets, padding, burst split)     │
//! ├─────────────────────────────────────────────────────┤
//! │              HTTP Mimicry + Transport               │
//! │      (upgrade handshake, TLS, TCP fragmenting)      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod crypto;
pub mod edge;
pub mod mimic;
pub mod mux;
pub mod obfs;
pub mod origin;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod sockopt;
pub mod tlscfg;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Handshake error: {0}")]
    Mimic(#[from] mimic::MimicError),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("TLS error: {0}")]
    Tls(#[from] tlscfg::TlsError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("no active session")]
    NoSession,
}
