//! Session pool
//!
//! Both endpoints keep the set of live multiplexer sessions here. Substream
//! requests pick an entry round-robin, skipping dead or saturated sessions;
//! a health task evicts closed sessions on a fixed cadence. An empty pool is
//! a legal state: stream requests then fail with `NoSession` and the caller
//! drops the user connection.

use crate::mux::{MuxStream, Session};
use crate::relay::{write_preamble, StreamKind, Target};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One live session known to the pool
#[derive(Clone)]
pub struct PoolEntry {
    pub session: Session,
    pub remote: String,
    pub created_at: Instant,
    active: Arc<AtomicUsize>,
}

impl PoolEntry {
    pub fn new(session: Session, remote: impl Into<String>) -> Self {
        Self {
            session,
            remote: remote.into(),
            created_at: Instant::now(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Substreams currently charged to this entry
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Account a new substream; the guard releases it on drop.
    pub fn track(&self) -> StreamGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        StreamGuard {
            active: self.active.clone(),
        }
    }
}

/// Decrements an entry's active-stream counter when dropped
#[derive(Debug)]
pub struct StreamGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Round-robin pool of live sessions
pub struct SessionPool {
    entries: RwLock<Vec<PoolEntry>>,
    cursor: AtomicUsize,
    max_streams_per_session: usize,
}

impl SessionPool {
    pub fn new(max_streams_per_session: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            max_streams_per_session: max_streams_per_session.max(1),
        }
    }

    pub fn add(&self, entry: PoolEntry) {
        let mut entries = self.entries.write().unwrap();
        entries.push(entry);
        info!(sessions = entries.len(), "session registered");
    }

    /// Remove the entry owning `session`. Idempotent.
    pub fn remove(&self, session: &Session) {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| !e.session.same(session));
        if entries.len() != before {
            info!(sessions = entries.len(), "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current entries
    pub fn snapshot(&self) -> Vec<PoolEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Round-robin pick starting at the shared cursor, skipping closed
    /// sessions and saturated entries. Falls back to the least-loaded live
    /// entry when every candidate is saturated.
    pub fn pick(&self) -> Option<PoolEntry> {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return None;
        }

        let n = entries.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;

        for offset in 0..n {
            let entry = &entries[(start + offset) % n];
            if entry.session.is_closed() {
                continue;
            }
            if entry.active_streams() >= self.max_streams_per_session {
                continue;
            }
            return Some(entry.clone());
        }

        entries
            .iter()
            .filter(|e| !e.session.is_closed())
            .min_by_key(|e| e.active_streams())
            .cloned()
    }

    /// Open a tagged substream through the pool. Entries found dead along
    /// the way are evicted before the next attempt.
    pub async fn open_stream(
        &self,
        kind: StreamKind,
        target: &Target,
    ) -> Result<(MuxStream, StreamGuard)> {
        let attempts = self.len().max(1);
        for _ in 0..attempts {
            let Some(entry) = self.pick() else {
                return Err(Error::NoSession);
            };

            let mut stream = match entry.session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(remote = %entry.remote, "evicting dead session: {}", e);
                    self.remove(&entry.session);
                    continue;
                }
            };

            if let Err(e) = write_preamble(&mut stream, kind, target).await {
                debug!(remote = %entry.remote, "preamble failed: {}", e);
                self.remove(&entry.session);
                continue;
            }

            return Ok((stream, entry.track()));
        }
        Err(Error::NoSession)
    }

    /// Evict closed sessions on `interval` until the pool is dropped.
    pub fn spawn_health_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else { break };

                let mut entries = pool.entries.write().unwrap();
                let before = entries.len();
                entries.retain(|e| !e.session.is_closed());
                if entries.len() != before {
                    debug!(
                        evicted = before - entries.len(),
                        remaining = entries.len(),
                        "health sweep evicted closed sessions"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{split, ChannelConfig};
    use crate::mux::SessionConfig;

    fn live_session() -> Session {
        let cfg = ChannelConfig::default();
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ra, wa) = split(a, &cfg);
        let session = Session::client(ra, wa, SessionConfig::default());
        // Keep the far end alive by leaking a server session
        let (rb, wb) = split(b, &cfg);
        std::mem::forget(Session::server(rb, wb, SessionConfig::default()));
        session
    }

    #[tokio::test]
    async fn test_round_robin_distribution() {
        let pool = SessionPool::new(512);
        let s1 = live_session();
        let s2 = live_session();
        pool.add(PoolEntry::new(s1, "a"));
        pool.add(PoolEntry::new(s2, "b"));

        let mut seen_a = 0;
        let mut seen_b = 0;
        for _ in 0..10 {
            match pool.pick().unwrap().remote.as_str() {
                "a" => seen_a += 1,
                _ => seen_b += 1,
            }
        }
        assert_eq!(seen_a, 5);
        assert_eq!(seen_b, 5);
    }

    #[tokio::test]
    async fn test_pick_skips_closed() {
        let pool = SessionPool::new(512);
        let dead = live_session();
        dead.close();
        let alive = live_session();
        pool.add(PoolEntry::new(dead, "dead"));
        pool.add(PoolEntry::new(alive, "alive"));

        for _ in 0..6 {
            assert_eq!(pool.pick().unwrap().remote, "alive");
        }
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = SessionPool::new(512);
        assert!(pool.pick().is_none());
        let err = pool
            .open_stream(StreamKind::Reverse, &Target::tcp("127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSession));
    }

    #[tokio::test]
    async fn test_saturated_entries_fall_back_to_least_loaded() {
        let pool = SessionPool::new(1);
        let entry_a = PoolEntry::new(live_session(), "a");
        let entry_b = PoolEntry::new(live_session(), "b");
        let _g1 = entry_a.track();
        let _g2 = entry_b.track();
        let _g3 = entry_b.track();
        pool.add(entry_a);
        pool.add(entry_b);

        // Everyone is at or above the cap; least-loaded wins
        assert_eq!(pool.pick().unwrap().remote, "a");
    }

    #[tokio::test]
    async fn test_guard_releases_count() {
        let entry = PoolEntry::new(live_session(), "x");
        assert_eq!(entry.active_streams(), 0);
        let guard = entry.track();
        assert_eq!(entry.active_streams(), 1);
        drop(guard);
        assert_eq!(entry.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_health_task_evicts_closed() {
        let pool = Arc::new(SessionPool::new(512));
        let session = live_session();
        pool.add(PoolEntry::new(session.clone(), "victim"));
        assert_eq!(pool.len(), 1);

        let handle = pool.spawn_health_task(Duration::from_millis(20));
        session.close();

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.len() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed session should be evicted within one interval");
        handle.abort();
    }
}
