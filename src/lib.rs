//! Peer-to-peer message transport for a blockchain node: typed, signed,
//! timestamped messages over TCP, with NAT traversal and request/reply,
//! broadcast, and reply-back-to-originator surfaces (see [`transport::Transport`]).

pub(crate) mod broadcast;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod nat;
pub mod peer;
pub(crate) mod reply_pump;
pub(crate) mod requests;
pub(crate) mod router;
pub(crate) mod socket_cache;
pub mod transport;

pub mod testonly;

pub use config::{Config, ConfigFile, IceServer};
pub use error::{CodecError, NatError, Result, TransportError};
pub use message::{Hash, Identity, Message, MessageBody, MessageKind};
pub use peer::{AppProtocolVersion, BoundPeer, DnsEndPoint, Peer, PublicKey, SecretKey};
pub use transport::{State, Transport};
