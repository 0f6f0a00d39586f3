//! Origin tunnel client
//!
//! Maintains a pool of sessions to the edge. Each worker runs the
//! dial → handshake → run → die → backoff loop: quick failures back off
//! with a jittered, capped delay and eventually rotate to the next
//! configured path; a session that lived long enough resets the failure
//! count and reconnects immediately. While running, edge-opened REVERSE
//! substreams are dialed locally and spliced.

use crate::channel::{self, ChannelConfig};
use crate::config::{Config, PathConfig, Transport};
use crate::crypto::rand_below;
use crate::mimic;
use crate::mux::{MuxStream, Session};
use crate::obfs::fragment::FragmentedStream;
use crate::pool::{PoolEntry, SessionPool, StreamGuard};
use crate::relay::{self, StreamKind, Target};
use crate::sockopt;
use crate::tlscfg::{self, BrowserProfile, TlsError};
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Quick failures on one path before rotating to the next
const MAX_QUICK_FAILS: u32 = 3;

/// A session that survived this long resets the failure count
const LONG_LIVED: Duration = Duration::from_secs(30);

/// Backoff ceiling between retries
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Sleep after path rotation wraps back to the first path
const WRAP_SLEEP: Duration = Duration::from_secs(10);

/// Base gap between pool worker startups
const STAGGER_BASE: Duration = Duration::from_millis(500);

/// The origin node: session pool workers plus outbound stream opening.
#[derive(Clone)]
pub struct OriginClient {
    cfg: Arc<Config>,
    pool: Arc<SessionPool>,
    channel_cfg: ChannelConfig,
}

impl OriginClient {
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.paths.is_empty() {
            return Err(Error::Config("origin requires at least one path".into()));
        }
        let channel_cfg = cfg.channel_config()?;
        let pool = Arc::new(SessionPool::new(cfg.advanced.max_streams_per_session));

        Ok(Self {
            cfg: Arc::new(cfg),
            pool,
            channel_cfg,
        })
    }

    pub fn pool(&self) -> Arc<SessionPool> {
        self.pool.clone()
    }

    /// Open a FORWARD substream towards `target` through any live session.
    /// For origin-local forward-proxy callers.
    pub async fn open_stream(&self, target: &str) -> Result<(MuxStream, StreamGuard)> {
        let target = Target::parse(target)?;
        self.pool.open_stream(StreamKind::Forward, &target).await
    }

    /// Spawn all pool workers (staggered) and serve until aborted.
    pub async fn run(&self) -> Result<()> {
        self.pool
            .spawn_health_task(Duration::from_secs(self.cfg.advanced.cleanup_interval.max(1)));

        let mut workers = JoinSet::new();

        if let Some(addr) = &self.cfg.proxy.socks5_listen {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            workers.spawn(crate::proxy::socks5::serve(self.pool.clone(), listener));
        }
        if let Some(addr) = &self.cfg.proxy.http_listen {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            workers.spawn(crate::proxy::http::serve(self.pool.clone(), listener));
        }

        let jitter = self.cfg.stealth.conn_jitter_ms;

        for (path_index, path) in self.cfg.paths.iter().enumerate() {
            for _ in 0..path.connection_pool.max(1) {
                let this = self.clone();
                workers.spawn(async move { this.worker_loop(path_index).await });

                // Staggered startup avoids synchronized dial storms
                let gap = STAGGER_BASE + Duration::from_millis(rand_below(jitter + 1));
                tokio::time::sleep(gap).await;
            }
        }

        while workers.join_next().await.is_some() {}
        Ok(())
    }

    /// One pool slot's lifecycle, forever.
    async fn worker_loop(&self, start_path: usize) {
        let paths = &self.cfg.paths;
        let mut path_index = start_path % paths.len();
        let mut quick_fails: u32 = 0;

        loop {
            let path = &paths[path_index];

            match self.connect_once(path).await {
                Ok(lifetime) if lifetime >= LONG_LIVED => {
                    debug!(addr = %path.addr, "long-lived session died, retrying immediately");
                    quick_fails = 0;
                    continue;
                }
                Ok(_) => {
                    quick_fails += 1;
                }
                Err(e) => {
                    debug!(addr = %path.addr, fails = quick_fails + 1, "connect failed: {}", e);
                    quick_fails += 1;
                }
            }

            if quick_fails >= MAX_QUICK_FAILS {
                path_index = (path_index + 1) % paths.len();
                quick_fails = 0;
                debug!(addr = %paths[path_index].addr, "rotating to next path");
                if path_index == 0 {
                    tokio::time::sleep(WRAP_SLEEP).await;
                }
                continue;
            }

            let base = Duration::from_secs(path.retry_interval.max(1)) * quick_fails;
            let backoff = base.min(BACKOFF_CAP) + Duration::from_millis(rand_below(500));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Dial, handshake, run one session to its death. Returns how long the
    /// session lived; any error before Running counts as a quick failure.
    async fn connect_once(&self, path: &PathConfig) -> Result<Duration> {
        let dial_timeout = Duration::from_secs(path.dial_timeout.max(1));

        let tcp = tokio::time::timeout(dial_timeout, TcpStream::connect(&path.addr))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "dial timed out",
                ))
            })??;
        sockopt::apply(&tcp, &self.cfg.advanced);

        match (path.transport, self.cfg.fragment.enabled) {
            (Transport::Tcp, false) => self.run_session(tcp, path).await,
            (Transport::Tcp, true) => {
                let fragmented = FragmentedStream::new(tcp, &self.cfg.fragment_policy());
                self.run_session(fragmented, path).await
            }
            (Transport::Tls, false) => {
                let tls = self.wrap_tls(tcp, path).await?;
                self.run_session(tls, path).await
            }
            (Transport::Tls, true) => {
                let fragmented = FragmentedStream::new(tcp, &self.cfg.fragment_policy());
                let tls = self.wrap_tls(fragmented, path).await?;
                self.run_session(tls, path).await
            }
        }
    }

    async fn wrap_tls<S>(&self, stream: S, path: &PathConfig) -> Result<tokio_rustls::client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let config = tlscfg::build_client_config(BrowserProfile::Chrome)?;
        let connector = TlsConnector::from(Arc::new(config));

        // SNI follows the mimicked domain; fall back to the dialed host
        let sni = if self.cfg.mimic.fake_domain.is_empty() {
            path.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&path.addr).to_string()
        } else {
            self.cfg.mimic.fake_domain.clone()
        };

        let name = ServerName::try_from(sni.clone())
            .map_err(|e| TlsError::ServerName(format!("{sni}: {e}")))?;
        let tls = connector.connect(name, stream).await?;
        Ok(tls)
    }

    async fn run_session<S>(&self, stream: S, path: &PathConfig) -> Result<Duration>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upgraded = mimic::client_handshake(stream, &self.cfg.mimic).await?;

        let (reader, writer) = channel::split(upgraded, &self.channel_cfg);
        let session = Session::client(reader, writer, self.cfg.session_config());

        let entry = PoolEntry::new(session.clone(), path.addr.clone());
        self.pool.add(entry.clone());
        info!(addr = %path.addr, "tunnel session established");
        let born = Instant::now();

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
        info!(addr = %path.addr, "tunnel session died");
        Ok(born.elapsed())
    }
}
