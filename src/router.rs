//! C5: single listening socket reading multi-frame messages, decoding
//! them, dispatching to the application handler, and routing replies back
//! to the originator using the request's frame identity (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt as _;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, FrameGroupCodec};
use crate::config::Config;
use crate::message::{Message, MessageBody};
use crate::peer::Peer;
use crate::reply_pump::ReplyQueue;
use crate::requests::validate_version;

pub(crate) type ConnectionHandle = Arc<tokio::sync::Mutex<Framed<TcpStream, FrameGroupCodec>>>;

/// Per-identity live connection, so a reply can be written back to
/// whichever TCP connection currently owns that identity (§4.5's
/// "hand over" rule: the newer connection simply replaces the map entry).
#[derive(Clone, Default)]
pub(crate) struct ConnectionTable {
    connections: Arc<Mutex<HashMap<Vec<u8>, ConnectionHandle>>>,
}

impl ConnectionTable {
    pub fn get(&self, identity: &[u8]) -> Option<ConnectionHandle> {
        self.connections.lock().get(identity).cloned()
    }

    fn register(&self, identity: Vec<u8>, handle: ConnectionHandle) {
        self.connections.lock().insert(identity, handle);
    }
}

/// Ordered list of async callbacks invoked per decoded inbound message
/// (§9 "multicast async delegate → explicit subscriber list"). A callback
/// erroring does not prevent the others from running.
pub(crate) type Handler = Arc<dyn Fn(Message) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

pub(crate) struct Router {
    pub connections: ConnectionTable,
    pub last_message_timestamp: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
}

/// Derives a stable per-peer routing identity from the sender's public
/// key, so a peer that disconnects and reconnects with the same keypair
/// is recognized as the same logical identity (§8 scenario S5).
fn derive_identity(peer: &Peer) -> Vec<u8> {
    peer.public_key.to_bytes().to_vec()
}

pub(crate) fn spawn(
    listener: TcpListener,
    config: Arc<Config>,
    handlers: Arc<RwLock<Vec<Handler>>>,
    connections: ConnectionTable,
    reply_queue: ReplyQueue,
    cancel: CancellationToken,
) -> (Router, tokio::task::JoinHandle<()>) {
    let last_message_timestamp = Arc::new(RwLock::new(None));
    let router = Router { connections: connections.clone(), last_message_timestamp: last_message_timestamp.clone() };

    let handle = tokio::spawn(accept_loop(
        listener,
        config,
        handlers,
        connections,
        last_message_timestamp,
        reply_queue,
        cancel,
    ));
    (router, handle)
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    handlers: Arc<RwLock<Vec<Handler>>>,
    connections: ConnectionTable,
    last_message_timestamp: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
    reply_queue: ReplyQueue,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (tcp, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(target: "net::router", error = %e, "failed to accept inbound connection");
                continue;
            }
        };
        tracing::debug!(target: "net::router", %peer_addr, "accepted inbound connection");

        let config = config.clone();
        let handlers = handlers.clone();
        let connections = connections.clone();
        let last_message_timestamp = last_message_timestamp.clone();
        let reply_queue = reply_queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            connection_loop(tcp, config, handlers, connections, last_message_timestamp, reply_queue, cancel).await;
        });
    }
}

async fn connection_loop(
    tcp: TcpStream,
    config: Arc<Config>,
    handlers: Arc<RwLock<Vec<Handler>>>,
    connections: ConnectionTable,
    last_message_timestamp: Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>,
    reply_queue: ReplyQueue,
    cancel: CancellationToken,
) {
    let handle: ConnectionHandle = Arc::new(tokio::sync::Mutex::new(Framed::new(tcp, FrameGroupCodec::default())));
    loop {
        let frames = {
            let mut framed = handle.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = framed.next() => next,
            }
        };
        let Some(frames) = frames else { return }; // connection closed.
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                tracing::debug!(target: "net::router", error = %e, "connection read error, dropping connection");
                return;
            }
        };

        // Step 1 (§4.5): if transport is cancelled, drop.
        if cancel.is_cancelled() {
            return;
        }

        let config_for_validator = config.clone();
        let validator = move |_id: &[u8], _peer: &Peer, remote_version: &crate::peer::AppProtocolVersion| {
            validate_version(&config_for_validator, remote_version)
        };
        let mut message =
            match codec::decode(frames, false, config.message_lifespan, &config.app_protocol_version, &validator) {
                Ok(message) => message,
                Err(crate::error::CodecError::DifferentAppProtocolVersion { remote_peer, local, remote }) => {
                    tracing::debug!(target: "net::router", local = %local, remote = %remote, "rejecting message with incompatible app protocol version");
                    // The regular dispatch path below never ran, so this
                    // connection was never registered; register it now under
                    // its derived identity so the reply below has somewhere
                    // to go.
                    let identity = derive_identity(&remote_peer);
                    connections.register(identity.clone(), handle.clone());
                    let _ = reply_queue.enqueue_fire_and_forget(identity, MessageBody::DifferentVersion);
                    continue;
                }
                Err(e) => {
                    tracing::debug!(target: "net::router", error = %e, "dropping malformed inbound message");
                    continue;
                }
            };

        let identity = derive_identity(&message.remote);
        message.identity = identity.clone();
        connections.register(identity, handle.clone());

        *last_message_timestamp.write() = Some(chrono::Utc::now());

        let handlers = handlers.read().clone();
        tokio::spawn(async move {
            for handler in handlers {
                handler(message.clone()).await;
            }
        });
    }
}
