//! C8: the public lifecycle controller. Owns every worker task and exposes
//! the send/reply/broadcast surface applications use (§6).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{self, BroadcastQueue};
use crate::config::Config;
use crate::error::{Result, TransportError};
use crate::message::{Identity, Message, MessageBody, MessageRequest};
use crate::nat;
use crate::peer::{BoundPeer, Peer};
use crate::reply_pump::{self, ReplyQueue};
use crate::requests::{self, RequestQueue};
use crate::router::{self, ConnectionTable, Handler, Router};
use crate::socket_cache::{self, SocketCache};

/// Lifecycle states a [`Transport`] moves through, in order, never
/// backwards except `Stopping -> Stopped -> New` is not possible: once
/// `dispose`d a transport cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

struct RunningHandles {
    runtime_cancel: CancellationToken,
    turn_cancel: CancellationToken,
    processor_cancel: CancellationToken,
    listener_local_addr: std::net::SocketAddr,
    turn_client: Option<Arc<turn::client::Client>>,
    cache: Arc<SocketCache>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

/// The peer-to-peer message transport. Construct with [`Transport::new`],
/// drive through [`Transport::start`]/[`Transport::stop`]/[`Transport::dispose`].
pub struct Transport {
    config: Arc<Config>,
    state: watch::Sender<State>,
    local_peer: Arc<RwLock<Peer>>,
    handlers: Arc<RwLock<Vec<Handler>>>,
    request_queue: RwLock<Option<RequestQueue>>,
    reply_queue: RwLock<Option<ReplyQueue>>,
    broadcast_queue: RwLock<Option<BroadcastQueue>>,
    last_message_timestamp: RwLock<Option<Arc<RwLock<Option<chrono::DateTime<chrono::Utc>>>>>>,
    running: RwLock<Option<RunningHandles>>,
}

impl Transport {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let public_key = config.private_key.public_key();
        let local_peer = Peer::new(public_key, None, None);
        Ok(Arc::new(Self {
            config: Arc::new(config),
            state: watch::Sender::new(State::New),
            local_peer: Arc::new(RwLock::new(local_peer)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            request_queue: RwLock::new(None),
            reply_queue: RwLock::new(None),
            broadcast_queue: RwLock::new(None),
            last_message_timestamp: RwLock::new(None),
            running: RwLock::new(None),
        }))
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// This node's own identity, including the endpoint it resolved to
    /// during [`Transport::start`]. Meaningless before the first successful
    /// start.
    pub fn as_peer(&self) -> Peer {
        self.local_peer.read().clone()
    }

    /// Registers a callback invoked, in registration order, for every
    /// successfully decoded inbound message (§9). Subscribing after
    /// `start()` is allowed; it simply misses messages decoded earlier.
    pub fn process_message_handler<F>(&self, handler: F)
    where
        F: Fn(Message) -> futures::future::BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Resolves the advertised endpoint, binds the listening socket, and
    /// spawns every background worker (§6). Idempotent only from `New`;
    /// calling twice returns [`TransportError::AlreadyRunning`].
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        match self.state() {
            State::New => {}
            State::Disposed => return Err(TransportError::Disposed),
            _ => return Err(TransportError::AlreadyRunning),
        }
        self.state.send_replace(State::Starting);

        let runtime_cancel = CancellationToken::new();
        let turn_cancel = runtime_cancel.child_token();
        let processor_cancel = runtime_cancel.child_token();

        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| TransportError::Bind(std::net::SocketAddr::from(([0, 0, 0, 0], self.config.listen_port)), e))?;
        let listener_local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let public_key = self.config.private_key.public_key();
        let resolution = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            resolution = nat::resolve(&self.config, listener_local_addr.port(), public_key, turn_cancel.clone()) => resolution?,
        };
        *self.local_peer.write() = resolution.peer;

        let connections = ConnectionTable::default();
        let cache = Arc::new(SocketCache::new());

        let (reply_queue, reply_handle) = reply_pump::spawn(
            self.config.clone(),
            self.local_peer.clone(),
            connections.clone(),
            processor_cancel.clone(),
        );
        let (router, router_handle) = router::spawn(
            listener,
            self.config.clone(),
            self.handlers.clone(),
            connections.clone(),
            reply_queue.clone(),
            processor_cancel.clone(),
        );
        let (request_queue, request_handles) =
            requests::spawn_workers(self.config.clone(), self.local_peer.clone(), processor_cancel.clone());
        let (broadcast_queue, broadcast_handle) = broadcast::spawn(
            self.config.clone(),
            self.local_peer.clone(),
            cache.clone(),
            processor_cancel.clone(),
        );
        let sweeper_handle = socket_cache::spawn_sweeper(
            cache.clone(),
            self.config.outbound_socket_lifetime,
            self.config.outbound_socket_sweep_period,
            processor_cancel.clone(),
        );

        let Router { last_message_timestamp, .. } = router;
        *self.last_message_timestamp.write() = Some(last_message_timestamp);

        let mut joins = request_handles;
        joins.push(reply_handle);
        joins.push(router_handle);
        joins.push(broadcast_handle);
        joins.push(sweeper_handle);

        *self.request_queue.write() = Some(request_queue);
        *self.reply_queue.write() = Some(reply_queue);
        *self.broadcast_queue.write() = Some(broadcast_queue);
        *self.running.write() = Some(RunningHandles {
            runtime_cancel,
            turn_cancel,
            processor_cancel,
            listener_local_addr,
            turn_client: resolution.turn_client,
            cache,
            joins,
        });

        self.state.send_replace(State::Running);
        tracing::info!(target: "net::lifecycle", addr = %listener_local_addr, peer = %self.as_peer().public_key, "transport started");
        Ok(())
    }

    /// Blocks until the transport reaches [`State::Running`] or the watch
    /// channel closes (transport disposed before it ever started).
    pub async fn wait_for_running(&self) {
        let mut receiver = self.state.subscribe();
        while *receiver.borrow() != State::Running {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancels the processor scope first so in-flight work drains, waits up
    /// to `grace`, then cancels everything else and tears down the TURN
    /// allocation and outbound socket cache (§6).
    pub async fn stop(&self, grace: Duration, cancel: CancellationToken) -> Result<()> {
        if self.state() != State::Running {
            return Err(TransportError::NotRunning);
        }
        self.state.send_replace(State::Stopping);

        let Some(mut running) = self.running.write().take() else {
            return Err(TransportError::NotRunning);
        };
        running.processor_cancel.cancel();

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(grace) => {}
            _ = futures::future::join_all(running.joins.drain(..)) => {}
        }

        self.handlers.write().clear();
        running.turn_cancel.cancel();
        running.runtime_cancel.cancel();
        running.cache.clear();
        if let Some(client) = &running.turn_client {
            let _ = client.close().await;
        }
        tracing::info!(target: "net::lifecycle", addr = %running.listener_local_addr, "transport stopped");

        self.state.send_replace(State::Stopped);
        Ok(())
    }

    /// Releases every remaining resource; the transport cannot be started
    /// again afterwards.
    pub fn dispose(&self) {
        if self.state() == State::Disposed {
            return;
        }
        if let Some(running) = self.running.write().take() {
            running.runtime_cancel.cancel();
        }
        self.state.send_replace(State::Disposed);
    }

    /// Timestamp of the most recent successfully decoded inbound message,
    /// or `None` if no message has been received since `start()`.
    pub fn last_message_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_message_timestamp.read().as_ref().and_then(|slot| *slot.read())
    }

    /// Sends `body` to `peer` over a dedicated request socket and completes
    /// once the write has been handed to the wire, expecting no reply
    /// (§4.4: shares `send_with_reply`/`send_with_replies`'s code path with
    /// `expected_replies = 0`).
    pub async fn send(&self, peer: &BoundPeer, body: MessageBody, cancel: CancellationToken) -> Result<()> {
        self.send_with_replies(peer, body, Config::SEND_TIMEOUT, 0, true, cancel).await?;
        Ok(())
    }

    /// Sends a request and awaits exactly one reply, bounded by `timeout`
    /// (§4.4).
    pub async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Message> {
        let replies = self.send_with_replies(peer, body, timeout, 1, false, cancel).await?;
        replies.into_iter().next().ok_or(TransportError::Timeout(timeout))
    }

    /// Sends a request and collects up to `expected_replies` replies,
    /// bounded by `timeout`. If `return_on_timeout` is set, a timeout while
    /// still short of `expected_replies` returns what was collected so far
    /// instead of an error (§4.4).
    pub async fn send_with_replies(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Duration,
        expected_replies: usize,
        return_on_timeout: bool,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>> {
        let queue = self.request_queue_handle()?;
        let (completion, completion_rx) = oneshot::channel();
        queue.enqueue(MessageRequest {
            request_id: rand::random(),
            body,
            target: peer.clone(),
            enqueued_at: std::time::Instant::now(),
            timeout,
            expected_replies,
            return_on_timeout,
            completion,
        })?;
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = completion_rx => result.map_err(|_| TransportError::NotRunning)?,
        }
    }

    /// Fans `body` out to every peer in `peers`, fire-and-forget (§4.7).
    pub fn broadcast(&self, peers: Vec<BoundPeer>, body: MessageBody) -> Result<()> {
        self.broadcast_queue_handle()?.broadcast(peers, body);
        Ok(())
    }

    /// Sends `body` back to whichever live connection owns `identity`,
    /// awaiting the bounded reply-send completion (§4.6).
    pub async fn reply(&self, identity: Identity, body: MessageBody, cancel: CancellationToken) -> Result<()> {
        let queue = self.reply_queue_handle()?;
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = queue.reply(identity, body) => result,
        }
    }

    fn request_queue_handle(&self) -> Result<RequestQueue> {
        self.request_queue.read().clone().ok_or(TransportError::NotRunning)
    }

    fn reply_queue_handle(&self) -> Result<ReplyQueue> {
        self.reply_queue.read().clone().ok_or(TransportError::NotRunning)
    }

    fn broadcast_queue_handle(&self) -> Result<BroadcastQueue> {
        self.broadcast_queue.read().clone().ok_or(TransportError::NotRunning)
    }
}
