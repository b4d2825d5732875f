//! C7: queue of `(peer-set, message)` pairs that fans out encoded
//! messages to each peer via the outbound socket cache (§4.7).

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt as _;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::Config;
use crate::message::MessageBody;
use crate::peer::{BoundPeer, Peer};
use crate::socket_cache::SocketCache;

struct BroadcastJob {
    peers: Vec<BoundPeer>,
    body: MessageBody,
}

/// Producer handle; cloning is cheap (wraps an mpsc sender).
#[derive(Clone)]
pub(crate) struct BroadcastQueue {
    sender: mpsc::UnboundedSender<BroadcastJob>,
}

impl BroadcastQueue {
    pub fn broadcast(&self, peers: Vec<BoundPeer>, body: MessageBody) {
        // Fire-and-forget (§4.7): no completion is reported to the caller,
        // so a channel-closed error (transport shutting down) is silently
        // swallowed here rather than surfaced.
        let _ = self.sender.send(BroadcastJob { peers, body });
    }
}

pub(crate) fn spawn(
    config: Arc<Config>,
    local_peer: Arc<RwLock<Peer>>,
    cache: Arc<SocketCache>,
    cancel: CancellationToken,
) -> (BroadcastQueue, tokio::task::JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<BroadcastJob>();
    let queue = BroadcastQueue { sender };

    let handle = tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => return,
                job = receiver.recv() => job,
            };
            let Some(job) = job else { return };

            let local_peer_snapshot = local_peer.read().clone();
            let frames = match codec::encode(
                &job.body,
                &config.private_key,
                &local_peer_snapshot,
                chrono::Utc::now(),
                &config.app_protocol_version,
                None,
            ) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!(target: "net::broadcast", error = %e, "failed to encode broadcast message");
                    continue;
                }
            };

            let sends = job.peers.into_iter().map(|peer| {
                let frames = frames.clone();
                let cache = cache.clone();
                async move { send_one(&cache, &peer, frames, Config::SEND_TIMEOUT).await }
            });
            futures::future::join_all(sends).await;
        }
    });

    (queue, handle)
}

async fn send_one(cache: &SocketCache, peer: &BoundPeer, frames: codec::FrameGroup, timeout: Duration) {
    let addr = match peer.resolve().await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!(target: "net::broadcast", error = %e, "could not resolve broadcast peer address");
            return;
        }
    };
    let connection = match cache.get_or_connect(peer).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::debug!(target: "net::broadcast", %addr, error = %e, "could not open outbound socket");
            return;
        }
    };

    let result = tokio::time::timeout(timeout, async {
        let mut conn = connection.lock().await;
        conn.send(frames).await
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(target: "net::broadcast", %addr, error = %e, "broadcast send failed, evicting socket");
            cache.evict(addr);
        }
        Err(_) => {
            tracing::debug!(target: "net::broadcast", %addr, "broadcast send timed out, evicting socket");
            cache.evict(addr);
        }
    }
}
