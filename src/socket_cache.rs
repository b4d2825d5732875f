//! C3: mapping from peer address to a reusable outbound stream socket plus
//! a last-use timestamp; evicts idle sockets; replaces dead or
//! endpoint-changed entries (§4.3).
//!
//! Used only by the broadcast path (§4.7); request/reply (§4.4) always
//! opens a dedicated ephemeral socket to avoid reply misrouting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::FrameGroupCodec;
use crate::peer::BoundPeer;

pub(crate) type OutboundStream = Framed<TcpStream, FrameGroupCodec>;

struct Entry {
    stream: Arc<tokio::sync::Mutex<OutboundStream>>,
    peer_addr: SocketAddr,
    last_use: Instant,
}

/// Keyed by the peer's resolved wire address; guarded by a single lock per
/// §5 ("C3 mutations are serialized by one lock").
pub(crate) struct SocketCache {
    entries: Mutex<HashMap<SocketAddr, Entry>>,
}

impl SocketCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns a live socket for `peer`, reusing a cached one if its
    /// recorded endpoint still matches, otherwise disposing the stale entry
    /// and dialing a fresh connection.
    pub async fn get_or_connect(&self, peer: &BoundPeer) -> std::io::Result<Arc<tokio::sync::Mutex<OutboundStream>>> {
        let addr = peer.resolve().await?;
        let cached = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&addr) {
                Some(entry) if entry.peer_addr == addr => {
                    entry.last_use = Instant::now();
                    Some(entry.stream.clone())
                }
                _ => None,
            }
        };
        if let Some(stream) = cached {
            return Ok(stream);
        }

        let tcp = TcpStream::connect(addr).await?;
        let framed = Arc::new(tokio::sync::Mutex::new(Framed::new(tcp, FrameGroupCodec::default())));
        self.entries.lock().insert(
            addr,
            Entry { stream: framed.clone(), peer_addr: addr, last_use: Instant::now() },
        );
        Ok(framed)
    }

    /// Drops the cached entry for `addr`, e.g. after a send failure.
    pub fn evict(&self, addr: SocketAddr) {
        self.entries.lock().remove(&addr);
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.entries.lock().contains_key(&addr)
    }

    /// Disposes every entry older than `lifetime`; returns how many were
    /// evicted, for the sweeper's log line.
    pub fn sweep(&self, lifetime: std::time::Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_use) <= lifetime);
        before - entries.len()
    }

    /// Disposes every cached socket unconditionally; used on `stop()`.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Wakes every `sweep_period` and disposes every cache entry older than
/// `lifetime` (§4.3).
pub(crate) fn spawn_sweeper(
    cache: Arc<SocketCache>,
    lifetime: std::time::Duration,
    sweep_period: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sweep_period) => {}
            }
            let evicted = cache.sweep(lifetime);
            if evicted > 0 {
                tracing::debug!(target: "net::cache", evicted, "swept idle outbound sockets");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_evicts_only_stale_entries() {
        let cache = SocketCache::new();
        // sweep() on an empty cache is a no-op and must not panic.
        assert_eq!(cache.sweep(std::time::Duration::from_secs(1)), 0);
    }

    #[test]
    fn contains_reflects_cache_state() {
        let cache = SocketCache::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(!cache.contains(addr));
    }
}
