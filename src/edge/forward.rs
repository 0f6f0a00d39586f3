//! Port-mapping listeners
//!
//! Each configured `"bind->target"` pair becomes a listener on the edge.
//! TCP flows map 1:1 onto REVERSE substreams and splice; UDP shares one
//! socket across peers, with one substream per remote peer tracked in a
//! flow table that a sweeper expires.

use crate::config::AdvancedConfig;
use crate::pool::SessionPool;
use crate::relay::{splice_tcp, StreamKind, Target};
use crate::sockopt;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// UDP mapping knobs
#[derive(Debug, Clone)]
pub struct UdpOptions {
    /// Idle lifetime before a flow's substream is closed
    pub flow_timeout: Duration,
    /// Datagram receive buffer size
    pub buffer_size: usize,
    /// Sweeper cadence
    pub sweep_interval: Duration,
    /// Cap on concurrent flows; packets from new peers are dropped at the cap
    pub max_flows: usize,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            flow_timeout: Duration::from_secs(120),
            buffer_size: 512 * 1024,
            sweep_interval: Duration::from_secs(30),
            max_flows: 300,
        }
    }
}

impl UdpOptions {
    pub fn from_advanced(advanced: &AdvancedConfig) -> Self {
        Self {
            flow_timeout: Duration::from_secs(advanced.udp_flow_timeout.max(1)),
            buffer_size: advanced.udp_buffer_size.max(2048),
            max_flows: advanced.max_udp_flows.max(1),
            ..Default::default()
        }
    }
}

/// Accept TCP connections on `listener` and relay each over a fresh REVERSE
/// substream towards `target`. Flows are never queued: with no live session
/// the user connection is closed immediately.
pub async fn serve_tcp(
    pool: Arc<SessionPool>,
    listener: TcpListener,
    target: String,
    advanced: AdvancedConfig,
) {
    let target = Target::tcp(target);
    if let Ok(addr) = listener.local_addr() {
        info!(bind = %addr, target = %target, "TCP mapping listening");
    }

    loop {
        let (user, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("mapping accept error: {}", e);
                continue;
            }
        };
        sockopt::apply(&user, &advanced);

        let pool = pool.clone();
        let target = target.clone();
        tokio::spawn(async move {
            match pool.open_stream(StreamKind::Reverse, &target).await {
                Ok((stream, guard)) => {
                    trace!(%peer, stream_id = stream.id(), "user flow mapped");
                    let _guard = guard;
                    let (read, write) = stream.split();
                    splice_tcp(user, read, write).await;
                }
                Err(_) => {
                    debug!(%peer, "no active session, dropping user connection");
                }
            }
        });
    }
}

struct UdpFlow {
    tx: mpsc::Sender<Bytes>,
    last_activity: Arc<AtomicU64>,
}

type FlowTable = Arc<Mutex<HashMap<SocketAddr, UdpFlow>>>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Relay datagrams arriving on `socket` towards `target`. Concurrent packets
/// from one peer share one substream; silence beyond the flow timeout closes
/// it, and the next packet allocates a fresh one.
pub async fn serve_udp(
    pool: Arc<SessionPool>,
    socket: UdpSocket,
    target: String,
    options: UdpOptions,
) {
    let socket = Arc::new(socket);
    let target = Target::udp(target);
    let flows: FlowTable = Arc::new(Mutex::new(HashMap::new()));

    if let Ok(addr) = socket.local_addr() {
        info!(bind = %addr, target = %target, "UDP mapping listening");
    }

    // Sweeper: drop flows idle past the timeout. Removing the entry closes
    // the channel, which ends the flow task and its substream.
    {
        let flows = flows.clone();
        let timeout = options.flow_timeout.as_secs();
        let interval = options.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = unix_now();
                let mut flows = flows.lock().unwrap();
                let before = flows.len();
                flows.retain(|_, flow| {
                    now.saturating_sub(flow.last_activity.load(Ordering::Acquire)) <= timeout
                });
                if flows.len() != before {
                    debug!(expired = before - flows.len(), "UDP flows expired");
                }
            }
        });
    }

    let mut buf = vec![0u8; options.buffer_size];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("UDP recv error: {}", e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        let existing = {
            let flows = flows.lock().unwrap();
            flows
                .get(&peer)
                .map(|f| (f.tx.clone(), f.last_activity.clone()))
        };

        if let Some((tx, last_activity)) = existing {
            last_activity.store(unix_now(), Ordering::Release);
            // Packets are non-reliable by contract: full queue means drop
            let _ = tx.try_send(datagram);
            continue;
        }

        if flows.lock().unwrap().len() >= options.max_flows {
            trace!(%peer, "UDP flow table full, dropping packet");
            continue;
        }

        match pool.open_stream(StreamKind::Reverse, &target).await {
            Ok((stream, guard)) => {
                trace!(%peer, stream_id = stream.id(), "UDP flow allocated");
                let (tx, rx) = mpsc::channel(256);
                let last_activity = Arc::new(AtomicU64::new(unix_now()));
                flows.lock().unwrap().insert(
                    peer,
                    UdpFlow {
                        tx: tx.clone(),
                        last_activity: last_activity.clone(),
                    },
                );
                let _ = tx.try_send(datagram);

                tokio::spawn(udp_flow_task(
                    stream,
                    guard,
                    rx,
                    socket.clone(),
                    peer,
                    last_activity,
                    flows.clone(),
                ));
            }
            Err(_) => {
                trace!(%peer, "no active session, dropping UDP packet");
            }
        }
    }
}

async fn udp_flow_task(
    stream: crate::mux::MuxStream,
    guard: crate::pool::StreamGuard,
    mut rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    last_activity: Arc<AtomicU64>,
    flows: FlowTable,
) {
    let _guard = guard;
    let (mut read, mut write) = stream.split();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            datagram = rx.recv() => match datagram {
                Some(datagram) => {
                    // One frame per datagram keeps message boundaries intact
                    if write.write_datagram(&datagram).await.is_err() {
                        break;
                    }
                }
                // Sweeper removed the flow
                None => break,
            },
            result = read.read(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    last_activity.store(unix_now(), Ordering::Release);
                    let _ = socket.send_to(&buf[..n], peer).await;
                }
            },
        }
    }

    let _ = write.close().await;
    flows.lock().unwrap().remove(&peer);
    trace!(%peer, "UDP flow closed");
}
