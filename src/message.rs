//! The typed message surface carried over the wire, and the internal
//! descriptor used to enqueue an outbound request.

use std::fmt;
use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::peer::{AppProtocolVersion, BoundPeer, Peer};

/// Opaque routing token assigned by the listening socket on an inbound
/// connection. Required to address a [`crate::transport::Transport::reply`]
/// back to its originator; absent on messages sent through request sockets.
pub type Identity = Vec<u8>;

pub(crate) fn identity_hex(identity: &[u8]) -> String {
    hex::encode(identity)
}

/// A block hash, transaction id, or similar opaque content reference.
pub type Hash = Vec<u8>;

/// The fixed, closed set of message kinds this transport understands.
///
/// Each variant's payload is exactly the set of *body frames* (§4.1) that
/// follow the signature frame on the wire; kinds with no payload (`Ping`,
/// `Pong`, `GetChainStatus`) carry zero body frames.
///
/// This enum itself is never borsh-(de)serialized as a whole: each
/// variant's body frames are encoded individually by
/// [`crate::codec::encode_body`]/[`crate::codec::decode_body`], since
/// `Peer` (carried by `Neighbors`) has no borsh representation of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Ping,
    Pong,
    GetBlockHashes { locator: Vec<Hash>, stop: Option<Hash> },
    BlockHashes { hashes: Vec<Hash> },
    TxIds { ids: Vec<Hash> },
    GetBlocks { hashes: Vec<Hash>, count: u32 },
    GetTxs { ids: Vec<Hash> },
    Blocks { blocks: Vec<Vec<u8>> },
    Tx { payload: Vec<u8> },
    FindNeighbors { target: Vec<u8> },
    Neighbors { peers: Vec<Peer> },
    BlockHeaderMessage { header: Vec<u8> },
    GetChainStatus,
    ChainStatus { genesis_hash: Hash, tip_index: u64, tip_hash: Hash },
    DifferentVersion,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::GetBlockHashes { .. } => MessageKind::GetBlockHashes,
            MessageBody::BlockHashes { .. } => MessageKind::BlockHashes,
            MessageBody::TxIds { .. } => MessageKind::TxIds,
            MessageBody::GetBlocks { .. } => MessageKind::GetBlocks,
            MessageBody::GetTxs { .. } => MessageKind::GetTxs,
            MessageBody::Blocks { .. } => MessageKind::Blocks,
            MessageBody::Tx { .. } => MessageKind::Tx,
            MessageBody::FindNeighbors { .. } => MessageKind::FindNeighbors,
            MessageBody::Neighbors { .. } => MessageKind::Neighbors,
            MessageBody::BlockHeaderMessage { .. } => MessageKind::BlockHeaderMessage,
            MessageBody::GetChainStatus => MessageKind::GetChainStatus,
            MessageBody::ChainStatus { .. } => MessageKind::ChainStatus,
            MessageBody::DifferentVersion => MessageKind::DifferentVersion,
        }
    }
}

/// The small integer enum carried in the type frame (§4.1 frame 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    Pong = 1,
    GetBlockHashes = 2,
    BlockHashes = 3,
    TxIds = 4,
    GetBlocks = 5,
    GetTxs = 6,
    Blocks = 7,
    Tx = 8,
    FindNeighbors = 9,
    Neighbors = 10,
    BlockHeaderMessage = 11,
    GetChainStatus = 12,
    ChainStatus = 13,
    DifferentVersion = 14,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A fully decoded inbound (or freshly constructed outbound) message,
/// carrying the envelope metadata attached by [`crate::codec`] at decode
/// time.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: MessageBody,
    pub remote: Peer,
    pub remote_version: AppProtocolVersion,
    pub timestamp: DateTime<Utc>,
    pub identity: Identity,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Internal descriptor enqueued into the request channel ([`crate::requests`]).
pub(crate) struct MessageRequest {
    pub request_id: u128,
    pub body: MessageBody,
    pub target: BoundPeer,
    pub enqueued_at: std::time::Instant,
    pub timeout: Duration,
    pub expected_replies: usize,
    pub return_on_timeout: bool,
    pub completion: oneshot::Sender<std::result::Result<Vec<Message>, TransportError>>,
}

impl fmt::Debug for MessageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRequest")
            .field("request_id", &self.request_id)
            .field("kind", &self.body.kind())
            .field("target", &self.target.endpoint)
            .field("expected_replies", &self.expected_replies)
            .finish()
    }
}
