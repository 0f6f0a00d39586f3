//! First-write fragmentation
//!
//! Splits the first large write on a connection into two halves with a short
//! random delay between them. When the stream carries TLS this breaks
//! ClientHello-based DPI signatures; the wrapper itself never inspects the
//! bytes it carries.

use crate::crypto::rand_between;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;

/// Fragmentation parameters, sampled once per dial
#[derive(Debug, Clone, Copy)]
pub struct FragmentPolicy {
    pub min_size: usize,
    pub max_size: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FragmentPolicy {
    fn default() -> Self {
        Self {
            min_size: 64,
            max_size: 191,
            min_delay_ms: 1,
            max_delay_ms: 3,
        }
    }
}

enum FragState {
    /// First oversized write not yet seen
    Pending,
    /// First half emitted, waiting out the inter-fragment delay
    Sleeping(Pin<Box<Sleep>>),
    /// Passthrough from here on
    Done,
}

/// Stream wrapper that fragments the first oversized write
pub struct FragmentedStream<S> {
    inner: S,
    fragment_size: usize,
    delay: Duration,
    state: FragState,
}

impl<S> FragmentedStream<S> {
    pub fn new(inner: S, policy: &FragmentPolicy) -> Self {
        let fragment_size = rand_between(policy.min_size as u64, policy.max_size as u64) as usize;
        let delay_ms = rand_between(policy.min_delay_ms, policy.max_delay_ms) + rand_between(0, 2);
        Self {
            inner,
            fragment_size,
            delay: Duration::from_millis(delay_ms),
            state: FragState::Pending,
        }
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                FragState::Done => return Pin::new(&mut this.inner).poll_write(cx, buf),
                FragState::Pending => {
                    if buf.len() <= this.fragment_size {
                        this.state = FragState::Done;
                        continue;
                    }
                    // Emit the first half only; the caller resubmits the rest,
                    // which lands after the delay below.
                    let n = ready!(
                        Pin::new(&mut this.inner).poll_write(cx, &buf[..this.fragment_size])
                    )?;
                    this.state = FragState::Sleeping(Box::pin(tokio::time::sleep(this.delay)));
                    return Poll::Ready(Ok(n));
                }
                FragState::Sleeping(sleep) => {
                    ready!(sleep.as_mut().poll(cx));
                    this.state = FragState::Done;
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Dial a TCP connection whose first flight will be fragmented.
pub async fn dial_fragmented(
    addr: &str,
    policy: &FragmentPolicy,
    timeout: Duration,
) -> io::Result<FragmentedStream<TcpStream>> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    stream.set_nodelay(true)?;
    Ok(FragmentedStream::new(stream, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_first_large_write_is_split() {
        let (client, mut server) = tokio::io::duplex(4096);
        let policy = FragmentPolicy {
            min_size: 10,
            max_size: 10,
            min_delay_ms: 0,
            max_delay_ms: 0,
        };
        let mut frag = FragmentedStream::new(client, &policy);
        assert_eq!(frag.fragment_size(), 10);

        let payload = vec![0xAB; 100];
        frag.write_all(&payload).await.unwrap();

        let mut received = vec![0u8; 100];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_small_first_write_passes_through() {
        let (client, mut server) = tokio::io::duplex(4096);
        let policy = FragmentPolicy {
            min_size: 64,
            max_size: 64,
            min_delay_ms: 0,
            max_delay_ms: 0,
        };
        let mut frag = FragmentedStream::new(client, &policy);

        frag.write_all(b"tiny").await.unwrap();
        // A later large write must not be fragmented or delayed
        frag.write_all(&vec![1u8; 500]).await.unwrap();

        let mut received = vec![0u8; 504];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..4], b"tiny");
    }
}
