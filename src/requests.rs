//! C4: unbounded FIFO of outbound request descriptors consumed by N
//! workers that each open an ephemeral request socket, send, collect
//! expected replies, and complete a future (§4.4).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, FrameGroupCodec, VersionValidator};
use crate::config::Config;
use crate::error::TransportError;
use crate::message::{Message, MessageRequest};
use crate::peer::Peer;

/// Accepts any remote version equal to the local one; otherwise defers to
/// the trusted-signer set / user callback exactly as §4.1 specifies.
pub(crate) struct RequestValidator {
    config: Arc<Config>,
}

impl VersionValidator for RequestValidator {
    fn validate(&self, _identity: &[u8], _remote: &Peer, remote_version: &crate::peer::AppProtocolVersion) -> bool {
        validate_version(&self.config, remote_version)
    }
}

pub(crate) fn validate_version(config: &Config, remote_version: &crate::peer::AppProtocolVersion) -> bool {
    if *remote_version == config.app_protocol_version {
        return true;
    }
    if let Some(trusted) = &config.trusted_version_signers {
        if !remote_version.is_trusted(Some(trusted)) {
            return false;
        }
    }
    match &config.different_version_callback {
        Some(callback) => callback(remote_version),
        None => false,
    }
}

/// Producer handle held by `Transport`; cloning is cheap (wraps an mpsc sender).
#[derive(Clone)]
pub(crate) struct RequestQueue {
    sender: mpsc::UnboundedSender<MessageRequest>,
}

impl RequestQueue {
    pub fn enqueue(&self, request: MessageRequest) -> Result<(), TransportError> {
        self.sender.send(request).map_err(|_| TransportError::NotRunning)
    }
}

/// Spawns `config.workers` worker tasks consuming the request channel and
/// returns the producer-side queue plus their join handles.
pub(crate) fn spawn_workers(
    config: Arc<Config>,
    local_peer: Arc<RwLock<Peer>>,
    cancel: CancellationToken,
) -> (RequestQueue, Vec<tokio::task::JoinHandle<()>>) {
    let (sender, receiver) = mpsc::unbounded_channel::<MessageRequest>();
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let receiver = receiver.clone();
        let config = config.clone();
        let local_peer = local_peer.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            worker_loop(worker_id, receiver, config, local_peer, cancel).await;
        }));
    }
    (RequestQueue { sender }, handles)
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageRequest>>>,
    config: Arc<Config>,
    local_peer: Arc<RwLock<Peer>>,
    cancel: CancellationToken,
) {
    loop {
        let request = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                request = receiver.recv() => request,
            }
        };
        let Some(request) = request else { return };
        tracing::debug!(target: "net::requests", worker_id, request_id = request.request_id, "dispatching request");
        let outcome = handle_request(&request, &config, &local_peer, &cancel).await;
        // The oneshot receiver may already be gone if the caller cancelled;
        // that is not this worker's problem.
        let _ = request.completion.send(outcome);
    }
}

async fn handle_request(
    request: &MessageRequest,
    config: &Arc<Config>,
    local_peer: &Arc<RwLock<Peer>>,
    cancel: &CancellationToken,
) -> Result<Vec<Message>, TransportError> {
    let addr = request.target.resolve().await?;
    let tcp = tokio::select! {
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        result = TcpStream::connect(addr) => result?,
    };
    let mut framed = Framed::new(tcp, FrameGroupCodec::default());

    let local_peer_snapshot = local_peer.read().clone();
    let frames = codec::encode(
        &request.body,
        &config.private_key,
        &local_peer_snapshot,
        chrono::Utc::now(),
        &config.app_protocol_version,
        None,
    )?;

    send_with_timeout(&mut framed, frames, request.timeout, cancel).await?;

    let mut replies = Vec::with_capacity(request.expected_replies);
    let validator = RequestValidator { config: config.clone() };
    for _ in 0..request.expected_replies {
        match recv_with_timeout(&mut framed, request.timeout, cancel).await {
            Ok(Some(raw)) => {
                let message =
                    codec::decode(raw, false, config.message_lifespan, &config.app_protocol_version, &validator)?;
                replies.push(message);
            }
            Ok(None) => break,
            Err(TransportError::Timeout(_)) if request.return_on_timeout => break,
            Err(e) => return Err(e),
        }
    }
    Ok(replies)
}

async fn send_with_timeout(
    framed: &mut Framed<TcpStream, FrameGroupCodec>,
    frames: codec::FrameGroup,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    use futures::SinkExt as _;
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, framed.send(frames)) => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(timeout)),
        },
    }
}

async fn recv_with_timeout(
    framed: &mut Framed<TcpStream, FrameGroupCodec>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<codec::FrameGroup>, TransportError> {
    use futures::StreamExt as _;
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, framed.next()) => match result {
            Ok(Some(Ok(frames))) => Ok(Some(frames)),
            Ok(Some(Err(e))) => Err(TransportError::Io(e)),
            Ok(None) => Ok(None),
            Err(_) => Err(TransportError::Timeout(timeout)),
        },
    }
}

