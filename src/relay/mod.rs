//! Substream routing and relaying
//!
//! The first byte on every substream is its type tag, which disambiguates
//! bidirectional stream initiation: both peers may open substreams on the
//! same session, and without the tag an accepted stream's purpose would be
//! ambiguous. FORWARD and REVERSE streams then carry a target header and
//! become plain byte relays; FAKE streams are idle-traffic decoys that get
//! drained and dropped.

use crate::mux::{MuxError, MuxStream, StreamReadHalf, StreamWriteHalf};
use crate::pool::StreamGuard;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// Substream opened by the origin towards the edge
pub const TAG_FORWARD: u8 = 0x01;
/// Substream opened by the edge towards the origin
pub const TAG_REVERSE: u8 = 0x02;
/// Idle-traffic decoy substream
pub const TAG_FAKE: u8 = 0xFF;

/// Deadline for the type tag after accepting a substream
pub const TAG_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for the target header
pub const TARGET_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout when dialing the final target
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounds on the target header length
pub const MAX_TARGET_LEN: usize = 4096;

/// Splice buffer size per direction
const SPLICE_BUF: usize = 32 * 1024;

/// Relay errors. These close the substream only; the session continues.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("timed out reading substream preamble")]
    Timeout,

    #[error("unknown stream tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("illegal target length: {0}")]
    TargetLength(usize),

    #[error("malformed target: {0}")]
    BadTarget(String),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Stream type carried in the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Forward,
    Reverse,
    Fake,
}

impl StreamKind {
    pub fn tag(self) -> u8 {
        match self {
            StreamKind::Forward => TAG_FORWARD,
            StreamKind::Reverse => TAG_REVERSE,
            StreamKind::Fake => TAG_FAKE,
        }
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            TAG_FORWARD => Ok(StreamKind::Forward),
            TAG_REVERSE => Ok(StreamKind::Reverse),
            TAG_FAKE => Ok(StreamKind::Fake),
            other => Err(RelayError::UnknownTag(other)),
        }
    }
}

/// Transport of the final target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetProto {
    Tcp,
    Udp,
}

/// A dialable target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub proto: TargetProto,
    pub addr: String,
}

impl Target {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            proto: TargetProto::Tcp,
            addr: addr.into(),
        }
    }

    pub fn udp(addr: impl Into<String>) -> Self {
        Self {
            proto: TargetProto::Udp,
            addr: addr.into(),
        }
    }

    /// Parse a target string. `udp://` selects UDP; everything else,
    /// scheme-prefixed or bare, is TCP.
    pub fn parse(s: &str) -> Result<Self, RelayError> {
        let (proto, rest) = if let Some(rest) = s.strip_prefix("udp://") {
            (TargetProto::Udp, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (TargetProto::Tcp, rest)
        } else {
            (TargetProto::Tcp, s)
        };

        if rest.is_empty() {
            return Err(RelayError::BadTarget(s.to_string()));
        }
        Ok(Self {
            proto,
            addr: rest.to_string(),
        })
    }

    /// Wire form with an explicit scheme
    pub fn to_wire(&self) -> String {
        match self.proto {
            TargetProto::Tcp => format!("tcp://{}", self.addr),
            TargetProto::Udp => format!("udp://{}", self.addr),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Write the opening preamble on a fresh substream: tag, then the target
/// header, as one buffer so they share a frame.
pub async fn write_preamble(
    stream: &mut MuxStream,
    kind: StreamKind,
    target: &Target,
) -> Result<(), RelayError> {
    let wire = target.to_wire();
    let mut buf = Vec::with_capacity(3 + wire.len());
    buf.push(kind.tag());
    buf.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    buf.extend_from_slice(wire.as_bytes());
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read the type tag from an accepted substream (5 s deadline).
pub async fn read_kind(read: &mut StreamReadHalf) -> Result<StreamKind, RelayError> {
    let tag = tokio::time::timeout(TAG_TIMEOUT, read.read_u8())
        .await
        .map_err(|_| RelayError::Timeout)??;
    StreamKind::try_from(tag)
}

/// Read the target header (10 s deadline). After this the stream carries
/// opaque relay bytes with no deadline.
pub async fn read_target(read: &mut StreamReadHalf) -> Result<Target, RelayError> {
    let target = tokio::time::timeout(TARGET_TIMEOUT, async {
        let mut len_buf = [0u8; 2];
        read.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TARGET_LEN {
            return Err(RelayError::TargetLength(len));
        }

        let mut raw = vec![0u8; len];
        read.read_exact(&mut raw).await?;
        let text = String::from_utf8(raw)
            .map_err(|_| RelayError::BadTarget("non-utf8 target".to_string()))?;
        Target::parse(&text)
    })
    .await
    .map_err(|_| RelayError::Timeout)??;

    Ok(target)
}

/// Handle one accepted substream: read the tag, dispatch by kind.
///
/// FORWARD and REVERSE differ only in which side opened them; both dial the
/// received target locally and splice. FAKE streams are drained. An unknown
/// tag closes the substream and leaves the session running.
pub async fn handle_inbound(stream: MuxStream, guard: StreamGuard) {
    let _guard = guard;
    let (mut read, write) = stream.split();

    let kind = match read_kind(&mut read).await {
        Ok(kind) => kind,
        Err(RelayError::UnknownTag(tag)) => {
            debug!(tag, "closing substream with unknown tag");
            return;
        }
        Err(e) => {
            trace!("substream preamble failed: {}", e);
            return;
        }
    };

    match kind {
        StreamKind::Fake => drain(read).await,
        StreamKind::Forward | StreamKind::Reverse => {
            let target = match read_target(&mut read).await {
                Ok(t) => t,
                Err(e) => {
                    debug!("bad target header: {}", e);
                    return;
                }
            };
            if let Err(e) = relay_to_target(read, write, &target).await {
                trace!(%target, "relay ended: {}", e);
            }
        }
    }
}

/// Consume and discard a decoy stream until the peer closes it.
pub async fn drain(mut read: StreamReadHalf) {
    let mut sink = [0u8; 1024];
    while let Ok(n) = read.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

/// Dial the target and relay bytes in both directions.
pub async fn relay_to_target(
    read: StreamReadHalf,
    write: StreamWriteHalf,
    target: &Target,
) -> Result<(), RelayError> {
    match target.proto {
        TargetProto::Tcp => {
            let conn = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target.addr))
                .await
                .map_err(|_| RelayError::Timeout)??;
            conn.set_nodelay(true).ok();
            trace!(addr = %target.addr, "target dialed");
            splice_tcp(conn, read, write).await;
            Ok(())
        }
        TargetProto::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&target.addr).await?;
            relay_udp(socket, read, write).await;
            Ok(())
        }
    }
}

/// Splice a TCP connection with a substream, one task per direction,
/// 32 KiB buffers. Each side closes its peer on first EOF or error.
pub async fn splice_tcp(conn: TcpStream, mut read: StreamReadHalf, mut write: StreamWriteHalf) {
    let (mut conn_read, mut conn_write) = conn.into_split();

    let uplink = tokio::spawn(async move {
        let mut buf = vec![0u8; SPLICE_BUF];
        loop {
            match conn_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = write.close().await;
    });

    let downlink = tokio::spawn(async move {
        let mut buf = vec![0u8; SPLICE_BUF];
        loop {
            match read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = conn_write.shutdown().await;
    });

    let _ = tokio::join!(uplink, downlink);
}

/// Pump datagrams between a connected UDP socket and a substream. Each
/// datagram travels as one data frame, so frame boundaries are datagram
/// boundaries: one substream read yields one datagram and vice versa.
async fn relay_udp(socket: UdpSocket, mut read: StreamReadHalf, mut write: StreamWriteHalf) {
    let mut stream_buf = vec![0u8; 64 * 1024];
    let mut sock_buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            r = read.read(&mut stream_buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Non-reliable by contract: a failed send drops the packet
                    let _ = socket.send(&stream_buf[..n]).await;
                }
            },
            r = socket.recv(&mut sock_buf) => match r {
                Ok(n) => {
                    if write.write_datagram(&sock_buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse_schemes() {
        let t = Target::parse("tcp://10.0.0.1:8080").unwrap();
        assert_eq!(t.proto, TargetProto::Tcp);
        assert_eq!(t.addr, "10.0.0.1:8080");

        let u = Target::parse("udp://10.0.0.1:53").unwrap();
        assert_eq!(u.proto, TargetProto::Udp);

        // Scheme-less strings are TCP
        let bare = Target::parse("example.com:443").unwrap();
        assert_eq!(bare.proto, TargetProto::Tcp);
        assert_eq!(bare.addr, "example.com:443");
    }

    #[test]
    fn test_target_roundtrip() {
        for s in ["tcp://a:1", "udp://b:2"] {
            let t = Target::parse(s).unwrap();
            assert_eq!(t.to_wire(), s);
            assert_eq!(Target::parse(&t.to_wire()).unwrap(), t);
        }
    }

    #[test]
    fn test_target_rejects_empty() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("udp://").is_err());
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(StreamKind::try_from(0x01).unwrap(), StreamKind::Forward);
        assert_eq!(StreamKind::try_from(0x02).unwrap(), StreamKind::Reverse);
        assert_eq!(StreamKind::try_from(0xFF).unwrap(), StreamKind::Fake);
        assert!(matches!(
            StreamKind::try_from(0x7A),
            Err(RelayError::UnknownTag(0x7A))
        ));
    }
}
