//! C6: queue of outbound replies waiting to be emitted on the listening
//! socket, paired with per-identity completion signals (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use futures::SinkExt as _;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::Config;
use crate::error::TransportError;
use crate::message::{identity_hex, Identity, MessageBody};
use crate::peer::Peer;
use crate::router::ConnectionTable;

struct PendingReply {
    identity: Identity,
    body: MessageBody,
}

/// Producer handle; cloning is cheap (wraps an mpsc sender), so any thread
/// may call [`ReplyQueue::reply`] (§5 "any thread may call `reply`").
#[derive(Clone)]
pub(crate) struct ReplyQueue {
    sender: mpsc::UnboundedSender<PendingReply>,
    completions: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ReplyQueue {
    /// Sends `body` back to whichever connection currently owns `identity`
    /// and awaits the 1 s bounded send completing (§4.6). The completion
    /// resolves even if the send itself failed or timed out: the
    /// application has already produced the reply, and a lost reply is
    /// observed by the remote as a request timeout.
    pub async fn reply(&self, identity: Identity, body: MessageBody) -> Result<(), TransportError> {
        let (completion_tx, completion_rx) = oneshot::channel();
        self.completions.lock().insert(identity_hex(&identity), completion_tx);
        self.sender
            .send(PendingReply { identity, body })
            .map_err(|_| TransportError::NotRunning)?;
        let _ = completion_rx.await;
        Ok(())
    }

    /// Enqueues a reply without registering a completion handle; used by
    /// the router for the `DifferentVersion` rejection path, which has no
    /// caller awaiting a handle.
    pub(crate) fn enqueue_fire_and_forget(&self, identity: Identity, body: MessageBody) -> Result<(), TransportError> {
        self.sender
            .send(PendingReply { identity, body })
            .map_err(|_| TransportError::NotRunning)
    }
}

pub(crate) fn spawn(
    config: Arc<Config>,
    local_peer: Arc<parking_lot::RwLock<Peer>>,
    connections: ConnectionTable,
    cancel: CancellationToken,
) -> (ReplyQueue, tokio::task::JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<PendingReply>();
    let completions: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>> = Arc::new(Mutex::new(HashMap::new()));
    let queue = ReplyQueue { sender, completions: completions.clone() };

    let handle = tokio::spawn(async move {
        loop {
            let pending = tokio::select! {
                _ = cancel.cancelled() => return,
                pending = receiver.recv() => pending,
            };
            let Some(pending) = pending else { return };
            let key = identity_hex(&pending.identity);

            let Some(connection) = connections.get(&pending.identity) else {
                tracing::debug!(target: "net::reply", identity = %key, "no live connection for reply identity, dropping");
                signal(&completions, &key);
                continue;
            };

            let local_peer_snapshot = local_peer.read().clone();
            let frames = match codec::encode(
                &pending.body,
                &config.private_key,
                &local_peer_snapshot,
                chrono::Utc::now(),
                &config.app_protocol_version,
                None,
            ) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!(target: "net::reply", error = %e, "failed to encode reply");
                    signal(&completions, &key);
                    continue;
                }
            };

            let send_result = tokio::time::timeout(Config::REPLY_SEND_TIMEOUT, async {
                let mut conn = connection.lock().await;
                conn.send(frames).await
            })
            .await;
            match send_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(target: "net::reply", error = %e, "reply send failed"),
                Err(_) => tracing::debug!(target: "net::reply", "reply send timed out"),
            }
            signal(&completions, &key);
        }
    });

    (queue, handle)
}

fn signal(completions: &Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>, key: &str) {
    if let Some(sender) = completions.lock().remove(key) {
        let _ = sender.send(());
    }
}
