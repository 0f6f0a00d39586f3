//! Edge tunnel server
//!
//! Listens on one or more ports, validates upgrade requests, hijacks the
//! socket under the 101 response, and layers the framed channel and a server
//! mux session on it. All listeners feed a single session pool, so a user
//! flow accepted on any mapping may traverse any session. Accepted
//! substreams (origin-opened FORWARD streams) are dialed locally.

pub mod forward;

use crate::channel::{self, ChannelConfig};
use crate::config::{parse_forward_entry, Config};
use crate::crypto::{rand_between, random_bytes};
use crate::mimic;
use crate::mux::Session;
use crate::pool::{PoolEntry, SessionPool};
use crate::relay::{self, TAG_FAKE};
use crate::sockopt;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Fake-traffic streams only fire below this many active streams
const FAKE_TRAFFIC_MAX_ACTIVE: usize = 3;

/// The edge node: tunnel listeners, session pool, port mappings.
#[derive(Clone)]
pub struct EdgeServer {
    cfg: Arc<Config>,
    pool: Arc<SessionPool>,
    channel_cfg: ChannelConfig,
    tls: Option<TlsAcceptor>,
    conn_limit: Arc<Semaphore>,
}

impl EdgeServer {
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.psk.is_empty() {
            warn!("running without a shared secret; tunnel traffic is unencrypted");
        }

        let channel_cfg = cfg.channel_config()?;

        let tls = match (&cfg.cert_file, &cfg.key_file) {
            (Some(cert), Some(key)) => {
                let server_config = crate::tlscfg::build_server_config(cert, key)?;
                info!("TLS enabled on tunnel listeners");
                Some(TlsAcceptor::from(Arc::new(server_config)))
            }
            _ => None,
        };

        let pool = Arc::new(SessionPool::new(cfg.advanced.max_streams_per_session));
        let conn_limit = Arc::new(Semaphore::new(cfg.advanced.max_connections.max(1)));

        Ok(Self {
            cfg: Arc::new(cfg),
            pool,
            channel_cfg,
            tls,
            conn_limit,
        })
    }

    pub fn pool(&self) -> Arc<SessionPool> {
        self.pool.clone()
    }

    /// Bind every configured listener and mapping and serve until aborted.
    pub async fn run(&self) -> Result<()> {
        self.pool
            .spawn_health_task(Duration::from_secs(self.cfg.advanced.cleanup_interval.max(1)));

        let mut tasks = JoinSet::new();

        for addr in &self.cfg.listen_ports {
            let listener = TcpListener::bind(addr).await?;
            info!(bind = %addr, "tunnel listening");
            let this = self.clone();
            tasks.spawn(async move { this.serve_listener(listener).await });
        }

        for entry in &self.cfg.forward.tcp {
            let (bind, target) = parse_forward_entry(entry)?;
            let listener = TcpListener::bind(&bind).await?;
            let pool = self.pool.clone();
            let advanced = self.cfg.advanced.clone();
            tasks.spawn(forward::serve_tcp(pool, listener, target, advanced));
        }

        for entry in &self.cfg.forward.udp {
            let (bind, target) = parse_forward_entry(entry)?;
            let socket = UdpSocket::bind(&bind).await?;
            let pool = self.pool.clone();
            let options = forward::UdpOptions::from_advanced(&self.cfg.advanced);
            tasks.spawn(forward::serve_udp(pool, socket, target, options));
        }

        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Accept tunnel connections on one listener.
    pub async fn serve_listener(&self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!("tunnel accept error: {}", e);
                    continue;
                }
            };

            let Ok(permit) = self.conn_limit.clone().try_acquire_owned() else {
                debug!(%peer, "connection limit reached, dropping");
                continue;
            };

            sockopt::apply(&stream, &self.cfg.advanced);

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = this.handle_tunnel_conn(stream, peer).await {
                    debug!(%peer, "tunnel connection ended: {}", e);
                }
            });
        }
    }

    async fn handle_tunnel_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                self.establish(tls_stream, peer).await
            }
            None => self.establish(stream, peer).await,
        }
    }

    /// Validate the upgrade, hijack the socket, run the session to its end.
    async fn establish<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upgraded = mimic::server_handshake(stream, &self.cfg.mimic).await?;

        let (reader, writer) = channel::split(upgraded, &self.channel_cfg);
        let session = Session::server(reader, writer, self.cfg.session_config());

        let entry = PoolEntry::new(session.clone(), peer.to_string());
        self.pool.add(entry.clone());
        info!(%peer, "tunnel session established");

        if self.cfg.stealth.fake_traffic {
            tokio::spawn(fake_traffic_task(
                entry.clone(),
                self.cfg.stealth.fake_traffic_interval,
            ));
        }

        loop {
            match session.accept_stream().await {
                Ok(stream) => {
                    let guard = entry.track();
                    tokio::spawn(relay::handle_inbound(stream, guard));
                }
                Err(_) => break,
            }
        }

        self.pool.remove(&session);
        session.close();
        info!(%peer, "tunnel session ended");
        Ok(())
    }
}

/// Periodically open a short-lived decoy substream so idle sessions still
/// show traffic. Skipped while real streams are active.
async fn fake_traffic_task(entry: PoolEntry, base_interval_secs: u64) {
    let base = base_interval_secs.max(2);
    loop {
        let wait = rand_between(base / 2, base + base / 2);
        tokio::time::sleep(Duration::from_secs(wait)).await;

        if entry.session.is_closed() {
            break;
        }
        if entry.active_streams() >= FAKE_TRAFFIC_MAX_ACTIVE {
            continue;
        }

        let Ok(mut stream) = entry.session.open_stream().await else {
            break;
        };

        let len = rand_between(32, 256) as usize;
        let mut body = vec![0u8; 1 + len];
        body[0] = TAG_FAKE;
        random_bytes(&mut body[1..]);

        let _ = stream.write_all(&body).await;
        tokio::time::sleep(Duration::from_millis(rand_between(50, 250))).await;
        let _ = stream.close().await;
    }
}
