//! Stream multiplexer
//!
//! Interleaves many logical substreams over one framed crypto channel:
//! - substream frames with u32 ids (odd = client-opened, even = server-opened)
//! - per-substream credit windows with half-window replenishment
//! - jittered NOP keepalives with a liveness timeout
//! - FIFO delivery of peer-opened substreams

mod frame;
mod session;
mod stream;

pub use frame::{Command, Frame, HEADER_SIZE};
pub use session::{Session, SessionConfig, Side};
pub use stream::{MuxStream, StreamReadHalf, StreamWriteHalf};

use thiserror::Error;

/// Default per-substream credit window (256 KiB)
pub const DEFAULT_WINDOW: u32 = 262_144;

/// Default payload cap per PSH frame
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("session closed")]
    SessionClosed,

    #[error("stream reset")]
    StreamReset,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),
}
