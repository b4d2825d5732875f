use std::net::SocketAddr;

use chrono::{DateTime, Utc};

use crate::peer::{AppProtocolVersion, Peer};

/// Errors produced while encoding or decoding a wire message.
///
/// Invariant: any variant here means the bytes on the wire did not match
/// what this crate's own [`crate::codec`] would have produced, or failed a
/// validation check the caller asked for (version, timestamp).
#[derive(thiserror::Error, Debug, Clone)]
pub enum CodecError {
    #[error("message is framed incorrectly: {0}")]
    InvalidMessage(String),

    #[error("message timestamp {timestamp} is outside the configured lifespan")]
    InvalidTimestamp { timestamp: DateTime<Utc> },

    #[error("remote app protocol version is incompatible")]
    DifferentAppProtocolVersion {
        remote_peer: Peer,
        local: AppProtocolVersion,
        remote: AppProtocolVersion,
    },
}

/// Errors surfaced by [`crate::nat`] while resolving the node's advertised endpoint.
#[derive(thiserror::Error, Debug)]
pub enum NatError {
    #[error("failed to resolve a host endpoint: {0}")]
    Dns(#[source] std::io::Error),

    #[error("ICE server {0} could not allocate a TURN session: {1}")]
    TurnAllocate(String, #[source] anyhow::Error),

    #[error("STUN query against {0} failed: {1}")]
    Stun(SocketAddr, #[source] anyhow::Error),

    #[error("neither `host` nor any `ice_servers` entry produced an advertised endpoint")]
    NoUsableEndpoint,
}

/// Top-level error type surfaced by the transport's public operations.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Nat(#[from] NatError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("transport is already running")]
    AlreadyRunning,

    #[error("transport has already been disposed")]
    Disposed,

    #[error("transport is not running")]
    NotRunning,

    #[error("failed to bind listening socket on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is not a bound peer")]
    UnboundPeer(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
