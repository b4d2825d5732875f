//! Peer identity and the signed application-protocol-version token that
//! every message carries for compatibility gating.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// A network endpoint reachable by host/IP and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsEndPoint {
    pub host: String,
    pub port: u16,
}

impl DnsEndPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for DnsEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A remote participant identified by a public key, optionally with a
/// reachable endpoint and an observed public IP.
///
/// Only a [`Peer`] with `endpoint.is_some()` is addressable; see
/// [`BoundPeer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub endpoint: Option<DnsEndPoint>,
    pub public_ip: Option<IpAddr>,
}

impl Peer {
    pub fn new(public_key: PublicKey, endpoint: Option<DnsEndPoint>, public_ip: Option<IpAddr>) -> Self {
        Self { public_key, endpoint, public_ip }
    }

    /// Upgrades this peer to a [`BoundPeer`] if it carries an endpoint.
    pub fn bound(&self) -> Option<BoundPeer> {
        self.endpoint.clone().map(|endpoint| BoundPeer {
            public_key: self.public_key.clone(),
            endpoint,
            public_ip: self.public_ip,
        })
    }
}

/// A [`Peer`] whose endpoint is known; the only kind that can be addressed
/// by [`crate::transport::Transport::send`] and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPeer {
    pub public_key: PublicKey,
    pub endpoint: DnsEndPoint,
    pub public_ip: Option<IpAddr>,
}

impl BoundPeer {
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        addrs.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved for peer endpoint")
        })
    }

    pub fn as_peer(&self) -> Peer {
        Peer {
            public_key: self.public_key.clone(),
            endpoint: Some(self.endpoint.clone()),
            public_ip: self.public_ip,
        }
    }
}

/// Thin, serializable wrapper around an [`ed25519_dalek::VerifyingKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(pub VerifyingKey);

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ed25519_dalek::SignatureError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ed25519_dalek::SignatureError::new())?;
        Ok(Self(VerifyingKey::from_bytes(&arr)?))
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        use ed25519_dalek::Verifier as _;
        self.0.verify(message, signature).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.to_bytes()).into_string())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Local signing identity. Never serialized; held only in [`crate::config::Config`].
#[derive(Clone)]
pub struct SecretKey(pub SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer as _;
        self.0.sign(message)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").field("public_key", &self.public_key()).finish()
    }
}

/// A signed token identifying the application-level wire protocol a peer speaks.
///
/// `signature` covers `(version, extra)` and is produced by `signer`'s
/// private key; `signer` need not be the sending peer's own key, since a
/// network operator may distribute a version token signed by a trusted
/// authority to every node it operates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProtocolVersion {
    pub version: i64,
    pub extra: Vec<u8>,
    pub signer: PublicKey,
    pub signature: Vec<u8>,
}

impl fmt::Display for AppProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)
    }
}

impl AppProtocolVersion {
    /// Builds and signs a version token with `signer`'s private key.
    pub fn signed(version: i64, extra: Vec<u8>, signer: &SecretKey) -> Self {
        let payload = Self::signing_payload(version, &extra);
        let signature = signer.sign(&payload).to_bytes().to_vec();
        Self { version, extra, signer: signer.public_key(), signature }
    }

    fn signing_payload(version: i64, extra: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + extra.len());
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(extra);
        buf
    }

    /// Verifies `signature` was produced by `signer` over `(version, extra)`.
    pub fn verify(&self) -> bool {
        let payload = Self::signing_payload(self.version, &self.extra);
        match self.signature.as_slice().try_into().ok().map(Signature::from_bytes) {
            Some(sig) => self.signer.verify(&payload, &sig),
            None => false,
        }
    }

    /// A version token is trusted if its signer is in `trusted` or if
    /// `trusted` is `None` (meaning "trust any signer").
    pub fn is_trusted(&self, trusted: Option<&std::collections::HashSet<PublicKey>>) -> bool {
        match trusted {
            None => true,
            Some(set) => set.contains(&self.signer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_protocol_version_round_trips_signature() {
        let key = SecretKey::generate();
        let version = AppProtocolVersion::signed(1, vec![1, 2, 3], &key);
        assert!(version.verify());
    }

    #[test]
    fn tampered_version_signature_fails_verification() {
        let key = SecretKey::generate();
        let mut version = AppProtocolVersion::signed(1, vec![], &key);
        version.version = 2;
        assert!(!version.verify());
    }

    #[test]
    fn trust_any_when_signer_set_absent() {
        let key = SecretKey::generate();
        let version = AppProtocolVersion::signed(1, vec![], &key);
        assert!(version.is_trusted(None));
    }
}
