//! C1: bidirectional mapping between a typed [`Message`] and a multi-frame
//! wire message: sign, frame, verify, parse (§4.1).

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::Signature;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CodecError;
use crate::message::{Message, MessageBody, MessageKind};
use crate::peer::{AppProtocolVersion, Peer, PublicKey, SecretKey};

/// A single opaque byte blob within a [`FrameGroup`].
pub type Frame = Vec<u8>;

/// An ordered list of frames making up one wire message (§4.1).
pub type FrameGroup = Vec<Frame>;

/// Tokio-util `Encoder`/`Decoder` that turns a [`FrameGroup`] into a single
/// length-delimited block on the wire, so one `send`/`recv` on a `Framed`
/// stream moves exactly one frame group.
pub struct FrameGroupCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameGroupCodec {
    fn default() -> Self {
        Self { inner: LengthDelimitedCodec::new() }
    }
}

impl Encoder<FrameGroup> for FrameGroupCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: FrameGroup, dst: &mut BytesMut) -> std::io::Result<()> {
        let mut payload = BytesMut::new();
        payload.put_u32(item.len() as u32);
        for frame in item {
            payload.put_u32(frame.len() as u32);
            payload.put_slice(&frame);
        }
        self.inner.encode(payload.freeze(), dst)
    }
}

impl Decoder for FrameGroupCodec {
    type Item = FrameGroup;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<FrameGroup>> {
        let Some(mut payload) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let count = payload.get_u32() as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = payload.get_u32() as usize;
            frames.push(payload.copy_to_bytes(len).to_vec());
        }
        Ok(Some(frames))
    }
}

/// Callback invoked during decode to enforce §4.1's version-validator
/// policy. Returning `Err` fails decode with `DifferentAppProtocolVersion`.
pub trait VersionValidator {
    fn validate(&self, identity: &[u8], remote: &Peer, remote_version: &AppProtocolVersion) -> bool;
}

impl<F: Fn(&[u8], &Peer, &AppProtocolVersion) -> bool> VersionValidator for F {
    fn validate(&self, identity: &[u8], remote: &Peer, remote_version: &AppProtocolVersion) -> bool {
        self(identity, remote, remote_version)
    }
}

/// Encodes `body` into a [`FrameGroup`], signing frames 2..5 + body with
/// `signer`'s private key. `identity` is prepended only for messages sent
/// back out through the listening socket (replies); outbound requests pass
/// `None`.
pub fn encode(
    body: &MessageBody,
    signer: &SecretKey,
    local_peer: &Peer,
    timestamp: DateTime<Utc>,
    version: &AppProtocolVersion,
    identity: Option<&[u8]>,
) -> Result<FrameGroup, CodecError> {
    let version_frame =
        borsh::to_vec(&version_wire(version)).map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
    let type_frame = borsh::to_vec(&body.kind()).map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
    let peer_frame =
        borsh::to_vec(&peer_wire(local_peer)).map_err(|e| CodecError::InvalidMessage(e.to_string()))?;
    let timestamp_frame = timestamp.to_rfc3339().into_bytes();
    let body_frames = encode_body(body)?;

    let mut signing_payload = BytesMut::new();
    signing_payload.put_slice(&version_frame);
    signing_payload.put_slice(&type_frame);
    signing_payload.put_slice(&peer_frame);
    signing_payload.put_slice(&timestamp_frame);
    for frame in &body_frames {
        signing_payload.put_slice(frame);
    }
    let signature = signer.sign(&signing_payload).to_bytes().to_vec();

    let mut frames = Vec::with_capacity(6 + body_frames.len());
    if let Some(identity) = identity {
        frames.push(identity.to_vec());
    }
    frames.push(version_frame);
    frames.push(type_frame);
    frames.push(peer_frame);
    frames.push(timestamp_frame);
    frames.push(signature);
    frames.extend(body_frames);
    Ok(frames)
}

/// Decodes a [`FrameGroup`] back into a [`Message`], per the algorithm in
/// §4.1. `identity_expected` must be `true` for frame groups read off the
/// listening socket and `false` for replies read off a request socket.
/// `local_version` is carried into any `DifferentAppProtocolVersion` error
/// so the caller can compare/log the true local and remote tokens (§7).
pub fn decode(
    mut frames: FrameGroup,
    identity_expected: bool,
    lifespan: Option<std::time::Duration>,
    local_version: &AppProtocolVersion,
    validator: &dyn VersionValidator,
) -> Result<Message, CodecError> {
    let identity = if identity_expected {
        if frames.is_empty() {
            return Err(CodecError::InvalidMessage("missing identity frame".into()));
        }
        frames.remove(0)
    } else {
        Vec::new()
    };

    if frames.len() < 5 {
        return Err(CodecError::InvalidMessage("frame group too short".into()));
    }
    let version_frame = &frames[0];
    let type_frame = &frames[1];
    let peer_frame = &frames[2];
    let timestamp_frame = &frames[3];
    let signature_frame = &frames[4];
    let body_frames = &frames[5..];

    let version: WireAppProtocolVersion = borsh::from_slice(version_frame)
        .map_err(|e| CodecError::InvalidMessage(format!("bad version frame: {e}")))?;
    let version = version.into();
    let kind: MessageKind = borsh::from_slice(type_frame)
        .map_err(|e| CodecError::InvalidMessage(format!("bad type frame: {e}")))?;
    let peer: WirePeer = borsh::from_slice(peer_frame)
        .map_err(|e| CodecError::InvalidMessage(format!("bad peer frame: {e}")))?;
    let peer: Peer = peer.try_into().map_err(CodecError::InvalidMessage)?;
    let timestamp_str = std::str::from_utf8(timestamp_frame)
        .map_err(|_| CodecError::InvalidMessage("timestamp frame is not utf8".into()))?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(timestamp_str)
        .map_err(|e| CodecError::InvalidMessage(format!("bad timestamp frame: {e}")))?
        .with_timezone(&Utc);

    // A `DifferentVersion` message is itself the rejection notice for a
    // version mismatch; gating it on the same version check it is reporting
    // would make it permanently undecodable by the peer it's addressed to.
    if kind != MessageKind::DifferentVersion && !validator.validate(&identity, &peer, &version) {
        return Err(CodecError::DifferentAppProtocolVersion {
            remote_peer: peer,
            local: local_version.clone(),
            remote: version,
        });
    }

    if let Some(lifespan) = lifespan {
        let lifespan = ChronoDuration::from_std(lifespan)
            .map_err(|_| CodecError::InvalidMessage("lifespan overflow".into()))?;
        let now = Utc::now();
        if now - timestamp > lifespan || timestamp > now + lifespan {
            return Err(CodecError::InvalidTimestamp { timestamp });
        }
    }

    let mut signing_payload = BytesMut::new();
    signing_payload.put_slice(version_frame);
    signing_payload.put_slice(type_frame);
    signing_payload.put_slice(peer_frame);
    signing_payload.put_slice(timestamp_frame);
    for frame in body_frames {
        signing_payload.put_slice(frame);
    }
    let signature = signature_frame
        .as_slice()
        .try_into()
        .map(Signature::from_bytes)
        .map_err(|_| CodecError::InvalidMessage("malformed signature frame".into()))?;
    if !peer.public_key.verify(&signing_payload, &signature) {
        return Err(CodecError::InvalidMessage("signature verification failed".into()));
    }

    let body = decode_body(kind, body_frames)?;

    Ok(Message { body, remote: peer, remote_version: version, timestamp, identity })
}

fn encode_body(body: &MessageBody) -> Result<Vec<Frame>, CodecError> {
    let to_err = |e: std::io::Error| CodecError::InvalidMessage(e.to_string());
    Ok(match body {
        MessageBody::Ping | MessageBody::Pong | MessageBody::GetChainStatus | MessageBody::DifferentVersion => {
            vec![]
        }
        MessageBody::GetBlockHashes { locator, stop } => {
            vec![borsh::to_vec(&(locator, stop)).map_err(to_err)?]
        }
        MessageBody::BlockHashes { hashes } => vec![borsh::to_vec(hashes).map_err(to_err)?],
        MessageBody::TxIds { ids } => vec![borsh::to_vec(ids).map_err(to_err)?],
        MessageBody::GetBlocks { hashes, count } => {
            vec![borsh::to_vec(&(hashes, count)).map_err(to_err)?]
        }
        MessageBody::GetTxs { ids } => vec![borsh::to_vec(ids).map_err(to_err)?],
        MessageBody::Blocks { blocks } => blocks.clone(),
        MessageBody::Tx { payload } => vec![payload.clone()],
        MessageBody::FindNeighbors { target } => vec![target.clone()],
        MessageBody::Neighbors { peers } => {
            let wire: Vec<WirePeer> = peers.iter().map(WirePeer::from).collect();
            vec![borsh::to_vec(&wire).map_err(to_err)?]
        }
        MessageBody::BlockHeaderMessage { header } => vec![header.clone()],
        MessageBody::ChainStatus { genesis_hash, tip_index, tip_hash } => {
            vec![borsh::to_vec(&(genesis_hash, tip_index, tip_hash)).map_err(to_err)?]
        }
    })
}

fn decode_body(kind: MessageKind, frames: &[Frame]) -> Result<MessageBody, CodecError> {
    let bad = |msg: &str| CodecError::InvalidMessage(msg.to_string());
    Ok(match kind {
        MessageKind::Ping => MessageBody::Ping,
        MessageKind::Pong => MessageBody::Pong,
        MessageKind::GetChainStatus => MessageBody::GetChainStatus,
        MessageKind::DifferentVersion => MessageBody::DifferentVersion,
        MessageKind::GetBlockHashes => {
            let (locator, stop) = borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?;
            MessageBody::GetBlockHashes { locator, stop }
        }
        MessageKind::BlockHashes => MessageBody::BlockHashes {
            hashes: borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?,
        },
        MessageKind::TxIds => MessageBody::TxIds {
            ids: borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?,
        },
        MessageKind::GetBlocks => {
            let (hashes, count) = borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?;
            MessageBody::GetBlocks { hashes, count }
        }
        MessageKind::GetTxs => MessageBody::GetTxs {
            ids: borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?,
        },
        MessageKind::Blocks => MessageBody::Blocks { blocks: frames.to_vec() },
        MessageKind::Tx => MessageBody::Tx {
            payload: frames.first().ok_or_else(|| bad("missing body frame"))?.clone(),
        },
        MessageKind::FindNeighbors => MessageBody::FindNeighbors {
            target: frames.first().ok_or_else(|| bad("missing body frame"))?.clone(),
        },
        MessageKind::Neighbors => {
            let wire: Vec<WirePeer> = borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                .map_err(|e| bad(&e.to_string()))?;
            let peers = wire
                .into_iter()
                .map(Peer::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| bad(&e))?;
            MessageBody::Neighbors { peers }
        }
        MessageKind::BlockHeaderMessage => MessageBody::BlockHeaderMessage {
            header: frames.first().ok_or_else(|| bad("missing body frame"))?.clone(),
        },
        MessageKind::ChainStatus => {
            let (genesis_hash, tip_index, tip_hash) =
                borsh::from_slice(frames.first().ok_or_else(|| bad("missing body frame"))?)
                    .map_err(|e| bad(&e.to_string()))?;
            MessageBody::ChainStatus { genesis_hash, tip_index, tip_hash }
        }
    })
}

/// Borsh-friendly mirror of [`AppProtocolVersion`] (§4.1 frame 2).
#[derive(borsh::BorshSerialize, borsh::BorshDeserialize)]
struct WireAppProtocolVersion {
    version: i64,
    extra: Vec<u8>,
    signer: Vec<u8>,
    signature: Vec<u8>,
}

fn version_wire(v: &AppProtocolVersion) -> WireAppProtocolVersion {
    WireAppProtocolVersion {
        version: v.version,
        extra: v.extra.clone(),
        signer: v.signer.to_bytes().to_vec(),
        signature: v.signature.clone(),
    }
}

impl From<WireAppProtocolVersion> for AppProtocolVersion {
    fn from(w: WireAppProtocolVersion) -> Self {
        // A malformed signer key cannot be trusted; fall back to a key that
        // verifies against nothing, so the codec rejects it uniformly via
        // signature verification rather than panicking on decode.
        let signer = PublicKey::from_bytes(&w.signer).unwrap_or_else(|_| {
            PublicKey(ed25519_dalek::VerifyingKey::from_bytes(&[0u8; 32]).expect("all-zero key is valid"))
        });
        AppProtocolVersion { version: w.version, extra: w.extra, signer, signature: w.signature }
    }
}

/// Borsh-friendly mirror of [`Peer`] (§4.1 frame 4).
#[derive(borsh::BorshSerialize, borsh::BorshDeserialize)]
struct WirePeer {
    public_key: Vec<u8>,
    endpoint: Option<(String, u16)>,
    public_ip: Option<Vec<u8>>,
}

impl From<&Peer> for WirePeer {
    fn from(p: &Peer) -> Self {
        WirePeer {
            public_key: p.public_key.to_bytes().to_vec(),
            endpoint: p.endpoint.as_ref().map(|e| (e.host.clone(), e.port)),
            public_ip: p.public_ip.map(|ip| match ip {
                std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
                std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
            }),
        }
    }
}

fn peer_wire(p: &Peer) -> WirePeer {
    WirePeer::from(p)
}

impl TryFrom<WirePeer> for Peer {
    type Error = String;

    fn try_from(w: WirePeer) -> Result<Self, Self::Error> {
        let public_key = PublicKey::from_bytes(&w.public_key).map_err(|e| e.to_string())?;
        let public_ip = match w.public_ip {
            None => None,
            Some(bytes) if bytes.len() == 4 => {
                Some(std::net::IpAddr::V4(std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])))
            }
            Some(bytes) if bytes.len() == 16 => {
                let arr: [u8; 16] = bytes.try_into().expect("checked len");
                Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(arr)))
            }
            Some(_) => return Err("malformed public ip frame".into()),
        };
        Ok(Peer {
            public_key,
            endpoint: w.endpoint.map(|(host, port)| crate::peer::DnsEndPoint { host, port }),
            public_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SecretKey;

    fn accept_all(_: &[u8], _: &Peer, _: &AppProtocolVersion) -> bool {
        true
    }

    fn local(version: i64, signer: &SecretKey) -> (Peer, AppProtocolVersion) {
        let peer = Peer::new(signer.public_key(), None, None);
        let version = AppProtocolVersion::signed(version, vec![], signer);
        (peer, version)
    }

    #[test]
    fn round_trips_ping() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let now = Utc::now();
        let frames = encode(&MessageBody::Ping, &signer, &peer, now, &version, None).unwrap();
        let msg = decode(frames, false, None, &version, &accept_all).unwrap();
        assert_eq!(msg.body, MessageBody::Ping);
        assert_eq!(msg.remote, peer);
    }

    #[test]
    fn round_trips_blocks_with_multiple_body_frames() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let body = MessageBody::Blocks { blocks: vec![vec![1, 2, 3], vec![4, 5]] };
        let frames = encode(&body, &signer, &peer, Utc::now(), &version, None).unwrap();
        let msg = decode(frames, false, None, &version, &accept_all).unwrap();
        assert_eq!(msg.body, body);
    }

    #[test]
    fn identity_frame_is_echoed_and_stripped() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let identity = vec![9, 9, 9];
        let frames = encode(&MessageBody::Ping, &signer, &peer, Utc::now(), &version, Some(&identity)).unwrap();
        let msg = decode(frames, true, None, &version, &accept_all).unwrap();
        assert_eq!(msg.identity, identity);
    }

    #[test]
    fn tampering_any_frame_breaks_signature_verification() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let mut frames = encode(&MessageBody::Ping, &signer, &peer, Utc::now(), &version, None).unwrap();
        // frame 3 (index 2) is the peer frame.
        frames[2].push(0xff);
        let err = decode(frames, false, None, &version, &accept_all).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage(_)));
    }

    #[test]
    fn timestamp_outside_lifespan_is_rejected() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let old = Utc::now() - ChronoDuration::hours(1);
        let frames = encode(&MessageBody::Ping, &signer, &peer, old, &version, None).unwrap();
        let err = decode(frames, false, Some(std::time::Duration::from_secs(60)), &version, &accept_all).unwrap_err();
        assert!(matches!(err, CodecError::InvalidTimestamp { .. }));
    }

    #[test]
    fn timestamp_within_lifespan_is_accepted() {
        let signer = SecretKey::generate();
        let (peer, version) = local(1, &signer);
        let frames = encode(&MessageBody::Ping, &signer, &peer, Utc::now(), &version, None).unwrap();
        decode(frames, false, Some(std::time::Duration::from_secs(60)), &version, &accept_all).unwrap();
    }

    #[test]
    fn version_validator_rejection_surfaces_different_app_protocol_version() {
        let signer = SecretKey::generate();
        let (peer, version) = local(2, &signer);
        let local_version = AppProtocolVersion::signed(1, vec![], &signer);
        let frames = encode(&MessageBody::Ping, &signer, &peer, Utc::now(), &version, None).unwrap();
        let reject = |_: &[u8], _: &Peer, _: &AppProtocolVersion| false;
        let err = decode(frames, false, None, &local_version, &reject).unwrap_err();
        match err {
            CodecError::DifferentAppProtocolVersion { remote_peer, local, remote } => {
                assert_eq!(remote_peer, peer);
                assert_eq!(local, local_version);
                assert_eq!(remote, version);
            }
            other => panic!("expected DifferentAppProtocolVersion, got {other:?}"),
        }
    }

    #[test]
    fn frame_group_codec_round_trips_through_bytes() {
        let mut codec = FrameGroupCodec::default();
        let group: FrameGroup = vec![vec![1, 2, 3], vec![], vec![4]];
        let mut buf = BytesMut::new();
        codec.encode(group.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, group);
    }
}
