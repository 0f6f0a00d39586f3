//! Multiplexer session
//!
//! One session owns one framed crypto channel. Three tasks drive it: a read
//! loop parsing inbound frames, a write loop serializing outbound frames
//! (which also keeps the frame emission single-threaded on the channel), and
//! a keepalive loop enforcing the liveness bound. When any of them fails the
//! session transitions to closed and every substream observes it.

use super::frame::{Command, Frame, HEADER_SIZE};
use super::stream::{self, MuxStream, StreamShared};
use super::{MuxError, DEFAULT_FRAME_SIZE, DEFAULT_WINDOW};
use crate::channel::{FrameReader, FrameWriter};
use crate::crypto::rand_below;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Outbound frame queue depth; overflow back-pressures substream writers
const OUTBOUND_QUEUE: usize = 256;

/// Floor on the keepalive liveness timeout
const KEEPALIVE_TIMEOUT_FLOOR: Duration = Duration::from_secs(30);

/// Which side of the tunnel this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opens odd-numbered substreams
    Client,
    /// Opens even-numbered substreams
    Server,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base keepalive interval
    pub keepalive: Duration,
    /// Random jitter applied to each keepalive interval (± this much)
    pub keepalive_jitter: Duration,
    /// Per-substream credit window in bytes
    pub window: u32,
    /// Payload cap per data frame
    pub frame_size: usize,
    /// Peer-opened substreams queued before accept back-pressure
    pub accept_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(2),
            keepalive_jitter: Duration::ZERO,
            window: DEFAULT_WINDOW,
            frame_size: DEFAULT_FRAME_SIZE,
            accept_backlog: 64,
        }
    }
}

struct StreamSlot {
    data_tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<StreamShared>,
    /// Credit we have granted the peer and not yet seen consumed
    recv_window: u32,
}

struct SessionInner {
    cfg: SessionConfig,
    outbound_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, StreamSlot>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_id: AtomicU32,
    closed: Arc<AtomicBool>,
    close_notify: Notify,
    last_recv: Mutex<Instant>,
}

/// A live multiplexer session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Build a session over a framed channel and spawn its driver tasks.
    pub fn new<R, W>(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        side: Side,
        cfg: SessionConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_backlog);

        let first_id = match side {
            Side::Client => 1,
            Side::Server => 2,
        };

        let inner = Arc::new(SessionInner {
            cfg,
            outbound_tx,
            streams: Mutex::new(HashMap::new()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(first_id),
            closed: Arc::new(AtomicBool::new(false)),
            close_notify: Notify::new(),
            last_recv: Mutex::new(Instant::now()),
        });

        tokio::spawn(read_loop(inner.clone(), reader, accept_tx));
        tokio::spawn(write_loop(inner.clone(), writer, outbound_rx));
        tokio::spawn(keepalive_loop(inner.clone()));

        Self { inner }
    }

    pub fn client<R, W>(reader: FrameReader<R>, writer: FrameWriter<W>, cfg: SessionConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(reader, writer, Side::Client, cfg)
    }

    pub fn server<R, W>(reader: FrameReader<R>, writer: FrameWriter<W>, cfg: SessionConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(reader, writer, Side::Server, cfg)
    }

    /// Open a substream towards the peer.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let (stream, data_tx, shared) = stream::create(
            id,
            self.inner.cfg.window,
            self.inner.cfg.frame_size,
            self.inner.outbound_tx.clone(),
            self.inner.closed.clone(),
        );

        self.inner.streams.lock().unwrap().insert(
            id,
            StreamSlot {
                data_tx,
                shared,
                recv_window: self.inner.cfg.window,
            },
        );

        if self.inner.outbound_tx.send(Frame::syn(id)).await.is_err() {
            self.inner.streams.lock().unwrap().remove(&id);
            return Err(MuxError::SessionClosed);
        }

        trace!(stream_id = id, "substream opened");
        Ok(stream)
    }

    /// Next peer-opened substream, in arrival order.
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        let mut rx = self.inner.accept_rx.lock().await;
        rx.recv().await.ok_or(MuxError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same session
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tear the session down; all substreams observe read EOF / write errors.
    pub fn close(&self) {
        shutdown(&self.inner);
    }

    /// Substreams currently tracked by this session
    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().unwrap().len()
    }
}

fn shutdown(inner: &Arc<SessionInner>) {
    if inner.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    inner.close_notify.notify_waiters();

    // Dropping each data_tx ends reads; the notify wakes blocked writers.
    let mut streams = inner.streams.lock().unwrap();
    for (_, slot) in streams.drain() {
        slot.shared.window_notify.notify_waiters();
    }
    debug!("session closed");
}

async fn read_loop<R>(
    inner: Arc<SessionInner>,
    mut reader: FrameReader<R>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let result: Result<(), MuxError> = loop {
        if inner.closed.load(Ordering::Acquire) {
            break Ok(());
        }

        let mut header = [0u8; HEADER_SIZE];
        tokio::select! {
            _ = inner.close_notify.notified() => break Ok(()),
            r = reader.read_exact(&mut header) => {
                if let Err(e) = r {
                    break Err(e.into());
                }
            }
        }

        let (cmd, stream_id, len) = match Frame::parse_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => break Err(e),
        };

        let mut payload = vec![0u8; len];
        if len > 0 {
            if let Err(e) = reader.read_exact(&mut payload).await {
                break Err(e.into());
            }
        }

        *inner.last_recv.lock().unwrap() = Instant::now();

        match cmd {
            Command::Nop => {}
            Command::Syn => {
                let (stream, data_tx, shared) = stream::create(
                    stream_id,
                    inner.cfg.window,
                    inner.cfg.frame_size,
                    inner.outbound_tx.clone(),
                    inner.closed.clone(),
                );
                {
                    let mut streams = inner.streams.lock().unwrap();
                    if streams.contains_key(&stream_id) {
                        trace!(stream_id, "duplicate SYN ignored");
                        continue;
                    }
                    streams.insert(
                        stream_id,
                        StreamSlot {
                            data_tx,
                            shared,
                            recv_window: inner.cfg.window,
                        },
                    );
                }
                tokio::select! {
                    _ = inner.close_notify.notified() => break Ok(()),
                    r = accept_tx.send(stream) => {
                        if r.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
            Command::Psh => {
                let mut streams = inner.streams.lock().unwrap();
                let violated = match streams.get_mut(&stream_id) {
                    Some(slot) => {
                        if (len as u32) > slot.recv_window {
                            true
                        } else {
                            slot.recv_window -= len as u32;
                            let _ = slot.data_tx.send(Bytes::from(payload));
                            false
                        }
                    }
                    None => {
                        trace!(stream_id, "data for unknown substream dropped");
                        false
                    }
                };
                if violated {
                    debug!(stream_id, "credit window violated, resetting stream");
                    if let Some(slot) = streams.remove(&stream_id) {
                        slot.shared.window_notify.notify_waiters();
                    }
                }
            }
            Command::Fin => {
                if let Some(slot) = inner.streams.lock().unwrap().remove(&stream_id) {
                    slot.shared.window_notify.notify_waiters();
                    trace!(stream_id, "substream closed by peer");
                }
            }
            Command::Upd => {
                let frame = Frame {
                    cmd,
                    stream_id,
                    payload: Bytes::from(payload),
                };
                match frame.upd_increment() {
                    Ok(increment) => {
                        if let Some(slot) = inner.streams.lock().unwrap().get(&stream_id) {
                            slot.shared.send_window.fetch_add(increment, Ordering::AcqRel);
                            slot.shared.window_notify.notify_waiters();
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    if let Err(e) = result {
        debug!("session read loop ended: {}", e);
    }
    shutdown(&inner);
}

async fn write_loop<W>(
    inner: Arc<SessionInner>,
    mut writer: FrameWriter<W>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        let frame = tokio::select! {
            _ = inner.close_notify.notified() => break,
            f = outbound_rx.recv() => match f {
                Some(frame) => frame,
                None => break,
            }
        };

        // An outgoing grant extends the credit we track for the peer
        if frame.cmd == Command::Upd {
            if let Ok(increment) = frame.upd_increment() {
                if let Some(slot) = inner.streams.lock().unwrap().get_mut(&frame.stream_id) {
                    slot.recv_window = slot.recv_window.saturating_add(increment);
                }
            }
        }

        if let Err(e) = writer.write_all(&frame.encode()).await {
            debug!("session write loop ended: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    shutdown(&inner);
}

async fn keepalive_loop(inner: Arc<SessionInner>) {
    let base = inner.cfg.keepalive;
    let jitter = inner.cfg.keepalive_jitter;
    let timeout = std::cmp::max(base * 15, KEEPALIVE_TIMEOUT_FLOOR);

    loop {
        let interval = jittered_interval(base, jitter);
        tokio::select! {
            _ = inner.close_notify.notified() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        let idle = inner.last_recv.lock().unwrap().elapsed();
        if idle > timeout {
            debug!(?idle, "keepalive timeout, closing session");
            shutdown(&inner);
            return;
        }

        // Skip the tick rather than wait when the queue is saturated; data
        // frames already prove liveness to the peer.
        let _ = inner.outbound_tx.try_send(Frame::nop());
    }
}

fn jittered_interval(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let jitter_ms = jitter.as_millis() as u64;
    let offset = rand_below(2 * jitter_ms + 1) as i64 - jitter_ms as i64;
    let ms = (base.as_millis() as i64 + offset).max(100) as u64;
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{split, ChannelConfig};

    fn session_pair() -> (Session, Session) {
        let cfg = ChannelConfig::default();
        let (a, b) = tokio::io::duplex(1 << 20);
        let (ra, wa) = split(a, &cfg);
        let (rb, wb) = split(b, &cfg);
        let client = Session::client(ra, wa, SessionConfig::default());
        let server = Session::server(rb, wb, SessionConfig::default());
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_data() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"ping").await.unwrap();

        let mut inc = server.accept_stream().await.unwrap();
        assert_eq!(inc.id(), 1);

        let mut buf = [0u8; 4];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inc.write_all(b"pong").await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_stream_id_parity() {
        let (client, server) = session_pair();

        let a = client.open_stream().await.unwrap();
        let b = client.open_stream().await.unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 3);

        let s = server.open_stream().await.unwrap();
        assert_eq!(s.id(), 2);
    }

    #[tokio::test]
    async fn test_fin_gives_eof() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"last words").await.unwrap();
        out.close().await.unwrap();

        let mut inc = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 10];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last words");

        let mut extra = [0u8; 1];
        assert_eq!(inc.read(&mut extra).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_order_is_fifo() {
        let (client, server) = session_pair();

        let mut first = client.open_stream().await.unwrap();
        first.write_all(b"1").await.unwrap();
        let mut second = client.open_stream().await.unwrap();
        second.write_all(b"2").await.unwrap();

        let a = server.accept_stream().await.unwrap();
        let b = server.accept_stream().await.unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 3);
    }

    #[tokio::test]
    async fn test_close_session_fails_streams() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"x").await.unwrap();
        let _ = server.accept_stream().await.unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(client.open_stream().await.is_err());
        assert!(out.write_all(b"y").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_observes_underlying_death() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"hello").await.unwrap();
        let _ = server.accept_stream().await.unwrap();

        client.close();
        // The write side shuts down, the peer's reader hits EOF and the
        // session transitions to closed.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !server.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server session should observe closure");
    }

    #[tokio::test]
    async fn test_datagram_write_preserves_boundaries() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        // Larger than the frame size: must still travel as one frame
        let first = vec![0xD7u8; 9000];
        out.write_datagram(&first).await.unwrap();
        out.write_datagram(&[1, 2, 3]).await.unwrap();

        let mut inc = server.accept_stream().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];

        let n = inc.read(&mut buf).await.unwrap();
        assert_eq!(n, 9000);
        assert_eq!(&buf[..n], &first[..]);

        let n = inc.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_datagram_too_large_rejected() {
        let (client, _server) = session_pair();
        let mut out = client.open_stream().await.unwrap();
        let oversized = vec![0u8; u16::MAX as usize + 1];
        assert!(out.write_datagram(&oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_write_blocks_on_exhausted_credit() {
        let cfg = ChannelConfig::default();
        let (a, b) = tokio::io::duplex(1 << 20);
        let (ra, wa) = split(a, &cfg);
        let (rb, wb) = split(b, &cfg);
        let small = SessionConfig {
            window: 65536,
            ..Default::default()
        };
        let client = Session::client(ra, wa, small.clone());
        let server = Session::server(rb, wb, small);

        let mut out = client.open_stream().await.unwrap();
        let mut inc = server.accept_stream().await.unwrap();

        let payload = vec![7u8; 200_000];
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
        });

        // With nobody reading, the writer exhausts its credit and blocks
        // rather than dropping data
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        // Draining the reader releases credit and the write completes
        let mut total = 0;
        let mut buf = vec![0u8; 32 * 1024];
        while total < 200_000 {
            let n = inc.read(&mut buf).await.unwrap();
            assert!(n > 0);
            total += n;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_close_does_not_disturb_others() {
        let (client, server) = session_pair();

        let mut keep = client.open_stream().await.unwrap();
        keep.write_all(b"before").await.unwrap();
        let mut keep_in = server.accept_stream().await.unwrap();

        // Open and immediately close another substream
        let mut ephemeral = client.open_stream().await.unwrap();
        ephemeral.close().await.unwrap();
        drop(ephemeral);
        let _ = server.accept_stream().await.unwrap();

        keep.write_all(b" after").await.unwrap();
        let mut buf = [0u8; 12];
        keep_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"before after");
    }

    #[tokio::test]
    async fn test_large_transfer_respects_windows() {
        let (client, server) = session_pair();

        let payload: Vec<u8> = (0..1_000_000).map(|i| (i % 256) as u8).collect();
        let expect = payload.clone();

        let mut out = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
            out.close().await.unwrap();
        });

        let mut inc = server.accept_stream().await.unwrap();
        let mut received = Vec::with_capacity(expect.len());
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = inc.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        writer.await.unwrap();
        assert_eq!(received.len(), expect.len());
        assert_eq!(received, expect);
    }
}
