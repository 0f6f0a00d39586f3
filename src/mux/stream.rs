//! Multiplexed substream handles
//!
//! A substream is a pair of halves sharing credit-window state. The write
//! half consumes send credit replenished by peer UPD frames; the read half
//! grants credit back once it has consumed half a window.

use super::frame::Frame;
use super::MuxError;
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// State shared between a stream's halves and the session loops
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    /// Bytes we may still send before the peer grants more credit
    pub(crate) send_window: AtomicU32,
    /// Woken on window grants, stream reset, and session close
    pub(crate) window_notify: Notify,
    pub(crate) session_closed: Arc<AtomicBool>,
}

/// Create a substream handle plus the session-side hooks for it.
pub(crate) fn create(
    id: u32,
    window: u32,
    frame_size: usize,
    outbound: mpsc::Sender<Frame>,
    session_closed: Arc<AtomicBool>,
) -> (MuxStream, mpsc::UnboundedSender<Bytes>, Arc<StreamShared>) {
    let shared = Arc::new(StreamShared {
        id,
        send_window: AtomicU32::new(window),
        window_notify: Notify::new(),
        session_closed,
    });
    let (data_tx, data_rx) = mpsc::unbounded_channel();

    let stream = MuxStream {
        read: StreamReadHalf {
            id,
            data_rx,
            leftover: Bytes::new(),
            consumed: 0,
            window,
            outbound: outbound.clone(),
        },
        write: StreamWriteHalf {
            shared: shared.clone(),
            outbound,
            frame_size,
            fin_sent: false,
        },
    };

    (stream, data_tx, shared)
}

/// Reading half of a substream
#[derive(Debug)]
pub struct StreamReadHalf {
    id: u32,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
    consumed: u32,
    window: u32,
    outbound: mpsc::Sender<Frame>,
}

impl StreamReadHalf {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read ordered bytes. Returns 0 at end of stream (peer FIN or session
    /// close).
    ///
    /// Cancel-safe: both await points either complete or leave no effect,
    /// so this may be used inside `select!`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Replenish peer credit before blocking on data; a cancelled send
        // leaves the grant pending for the next call.
        if self.consumed >= self.window / 2 {
            let grant = self.consumed;
            let _ = self.outbound.send(Frame::upd(self.id, grant)).await;
            self.consumed = 0;
        }

        while self.leftover.is_empty() {
            match self.data_rx.recv().await {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => self.leftover = chunk,
                None => return Ok(0),
            }
        }

        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        self.consumed += n as u32;

        Ok(n)
    }

    /// Fill `buf` completely; errors if the stream ends first.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(MuxError::UnexpectedEof);
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8, MuxError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b).await?;
        Ok(b[0])
    }
}

/// Writing half of a substream
#[derive(Debug)]
pub struct StreamWriteHalf {
    shared: Arc<StreamShared>,
    outbound: mpsc::Sender<Frame>,
    frame_size: usize,
    fin_sent: bool,
}

impl StreamWriteHalf {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Write all of `data`, waiting on send credit as needed. Data is cut
    /// into frames of at most `frame_size`; boundaries are not preserved.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<(), MuxError> {
        while !data.is_empty() {
            let avail = self.wait_for_credit(1).await?;
            let n = data.len().min(avail as usize).min(self.frame_size);
            self.shared.send_window.fetch_sub(n as u32, Ordering::AcqRel);

            let frame = Frame::psh(self.shared.id, Bytes::copy_from_slice(&data[..n]));
            self.outbound
                .send(frame)
                .await
                .map_err(|_| MuxError::SessionClosed)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Write `data` as exactly one data frame, regardless of `frame_size`.
    ///
    /// Datagram relays depend on this: the peer reads one frame per read,
    /// so a frame boundary is a message boundary. The payload must fit a
    /// frame's u16 length; credit for the whole payload is awaited up front.
    pub async fn write_datagram(&mut self, data: &[u8]) -> Result<(), MuxError> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > u16::MAX as usize {
            return Err(MuxError::Protocol(format!(
                "datagram too large for one frame: {}",
                data.len()
            )));
        }

        self.wait_for_credit(data.len() as u32).await?;
        self.shared
            .send_window
            .fetch_sub(data.len() as u32, Ordering::AcqRel);

        let frame = Frame::psh(self.shared.id, Bytes::copy_from_slice(data));
        self.outbound
            .send(frame)
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Wait until at least `min` bytes of send credit are available.
    async fn wait_for_credit(&self, min: u32) -> Result<u32, MuxError> {
        loop {
            if self.shared.session_closed.load(Ordering::Acquire) {
                return Err(MuxError::SessionClosed);
            }
            let avail = self.shared.send_window.load(Ordering::Acquire);
            if avail >= min {
                return Ok(avail);
            }

            let notified = self.shared.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering so a concurrent grant is not missed
            if self.shared.send_window.load(Ordering::Acquire) >= min
                || self.shared.session_closed.load(Ordering::Acquire)
            {
                continue;
            }
            notified.await;
        }
    }

    /// Signal end of stream to the peer.
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if self.fin_sent {
            return Ok(());
        }
        self.fin_sent = true;
        self.outbound
            .send(Frame::fin(self.shared.id))
            .await
            .map_err(|_| MuxError::SessionClosed)
    }
}

impl Drop for StreamWriteHalf {
    fn drop(&mut self) {
        if !self.fin_sent {
            let _ = self.outbound.try_send(Frame::fin(self.shared.id));
        }
    }
}

/// A bidirectional substream
#[derive(Debug)]
pub struct MuxStream {
    pub(crate) read: StreamReadHalf,
    pub(crate) write: StreamWriteHalf,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.read.id
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.read.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MuxError> {
        self.read.read_exact(buf).await
    }

    pub async fn read_u8(&mut self) -> Result<u8, MuxError> {
        self.read.read_u8().await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.write.write_all(data).await
    }

    pub async fn write_datagram(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.write.write_datagram(data).await
    }

    pub async fn close(&mut self) -> Result<(), MuxError> {
        self.write.close().await
    }

    /// Split into independently owned halves for bidirectional splicing.
    pub fn split(self) -> (StreamReadHalf, StreamWriteHalf) {
        (self.read, self.write)
    }
}
