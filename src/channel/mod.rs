//! Framed crypto channel
//!
//! Wraps a raw byte stream in length-prefixed AES-256-GCM packets:
//!
//! ```text
//! +-----------+------------+----------------------+
//! | len (4B)  | nonce (12B)| ciphertext + tag     |
//! +-----------+------------+----------------------+
//! ```
//!
//! The plaintext under each nonce is `u16_be body_len ∥ body ∥ padding` when
//! a padding policy is configured, or the raw body otherwise. Without a key
//! the channel degrades to plain length framing (loopback testing only;
//! production deployments must set a shared secret).
//!
//! Both directions are single-owner: one task drives the writer, one the
//! reader, so packets are never interleaved.

use crate::crypto::{CryptoError, PacketKey, NONCE_LEN, TAG_LEN};
use crate::obfs::{BurstPolicy, DelayPolicy, PaddingPolicy};
use bytes::{Buf, Bytes};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Hard cap on a single packet (16 MiB); readers reject anything larger
pub const MAX_PACKET_SIZE: u32 = 16 << 20;

/// Writes at or below this size skip the post-write jitter so keepalives and
/// control frames stay prompt
const JITTER_MIN_PAYLOAD: usize = 128;

/// Largest plaintext carried by one packet when padding framing is active
/// (the body length prefix is a u16)
const MAX_BODY_PER_PACKET: usize = u16::MAX as usize;

/// Channel errors. All of them are terminal for the connection.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid packet length: {0}")]
    PacketLength(u32),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid padding prefix")]
    Padding,
}

/// Channel parameters shared by both halves of one connection
#[derive(Clone, Default)]
pub struct ChannelConfig {
    /// Packet key; `None` selects unencrypted framing
    pub key: Option<Arc<PacketKey>>,
    /// Per-packet padding; both peers must configure this symmetrically
    pub padding: Option<PaddingPolicy>,
    /// Burst splitting of large writes
    pub burst: Option<BurstPolicy>,
    /// Post-write jitter for writes larger than 128 bytes
    pub write_delay: Option<DelayPolicy>,
}

/// Split a stream into framed reader and writer halves.
pub fn split<S>(stream: S, cfg: &ChannelConfig) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r, cfg), FrameWriter::new(w, cfg))
}

/// Writing half: seals payloads into packets
pub struct FrameWriter<W> {
    inner: W,
    key: Option<Arc<PacketKey>>,
    padding: Option<PaddingPolicy>,
    burst: Option<BurstPolicy>,
    write_delay: Option<DelayPolicy>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, cfg: &ChannelConfig) -> Self {
        Self {
            inner,
            key: cfg.key.clone(),
            padding: cfg.padding,
            burst: cfg.burst,
            write_delay: cfg.write_delay,
        }
    }

    /// Write one logical payload, applying burst splitting, padding,
    /// sealing, and post-write jitter per the configured policies.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        match self.burst {
            Some(burst) if data.len() > burst.max_chunk => {
                let mut remaining = data;
                while !remaining.is_empty() {
                    let n = burst.next_chunk(remaining.len());
                    self.write_packet(&remaining[..n]).await?;
                    remaining = &remaining[n..];
                    if !remaining.is_empty() {
                        tokio::time::sleep(burst.inter_chunk_delay()).await;
                    }
                }
            }
            _ => {
                // The u16 body-length prefix bounds a padded packet's body
                for chunk in data.chunks(MAX_BODY_PER_PACKET.min(data.len()).max(1)) {
                    self.write_packet(chunk).await?;
                }
            }
        }

        if let Some(delay) = self.write_delay {
            if data.len() > JITTER_MIN_PAYLOAD {
                tokio::time::sleep(delay.sample()).await;
            }
        }

        Ok(())
    }

    async fn write_packet(&mut self, body: &[u8]) -> Result<(), ChannelError> {
        let payload: Vec<u8> = match &self.padding {
            Some(policy) => policy.pad(body),
            None => body.to_vec(),
        };

        let wire = match &self.key {
            Some(key) => key.seal(&payload)?,
            None => payload,
        };

        let mut frame = Vec::with_capacity(4 + wire.len());
        frame.extend_from_slice(&(wire.len() as u32).to_be_bytes());
        frame.extend_from_slice(&wire);
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reading half: parses and opens packets, buffering any surplus plaintext
pub struct FrameReader<R> {
    inner: R,
    key: Option<Arc<PacketKey>>,
    strip_padding: bool,
    leftover: Bytes,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, cfg: &ChannelConfig) -> Self {
        Self {
            inner,
            key: cfg.key.clone(),
            strip_padding: cfg.padding.is_some(),
            leftover: Bytes::new(),
        }
    }

    /// Read decrypted bytes into `buf`, pulling the next packet when the
    /// leftover buffer is drained. Returns the number of bytes copied.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        while self.leftover.is_empty() {
            self.leftover = self.read_packet().await?;
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Bytes, ChannelError> {
        let mut header = [0u8; 4];
        self.inner.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header);
        if len == 0 || len > MAX_PACKET_SIZE {
            return Err(ChannelError::PacketLength(len));
        }

        let mut wire = vec![0u8; len as usize];
        self.inner.read_exact(&mut wire).await?;

        let plaintext = match &self.key {
            Some(key) => key.open(&wire)?,
            None => wire,
        };

        if self.strip_padding {
            let body = PaddingPolicy::strip(&plaintext).ok_or(ChannelError::Padding)?;
            Ok(Bytes::copy_from_slice(body))
        } else {
            Ok(Bytes::from(plaintext))
        }
    }
}
