//! Test-only helpers: deterministic keys, a loopback two-transport
//! harness, and a generic wait-for-condition loop so scenario tests don't
//! hand-roll polling.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::peer::{AppProtocolVersion, BoundPeer, DnsEndPoint, SecretKey};
use crate::transport::Transport;

/// Derives a reproducible ed25519 keypair from `seed`, so scenario tests
/// can refer to "alice" and "bob" instead of random keys.
pub fn secret_key_from_seed(seed: u8) -> SecretKey {
    SecretKey::from_bytes(&[seed; 32])
}

/// Builds a [`Config`] listening on an ephemeral loopback port, signed
/// with a key derived from `seed`.
pub fn loopback_config(seed: u8) -> Config {
    let key = secret_key_from_seed(seed);
    let version = AppProtocolVersion::signed(1, vec![], &key);
    Config::new(key, version).with_host("127.0.0.1").with_listen_port(0)
}

/// Starts `transport` and blocks until it reports [`crate::transport::State::Running`],
/// panicking if that doesn't happen within `max_wait`. Mirrors this crate's
/// actor-free `wait_or_timeout` pattern without depending on an actor runtime.
pub async fn start_and_wait(transport: &Arc<Transport>, max_wait: Duration) {
    transport.start(CancellationToken::new()).await.expect("transport failed to start");
    tokio::time::timeout(max_wait, transport.wait_for_running())
        .await
        .expect("transport did not reach Running in time");
}

/// Resolves `transport`'s own bound peer once it is running.
pub fn bound_peer(transport: &Transport) -> BoundPeer {
    transport.as_peer().bound().expect("running transport always has an endpoint")
}

/// Builds a [`BoundPeer`] pointing at an arbitrary loopback `port` signed
/// by `key`, bypassing NAT resolution entirely. Useful when a test wants
/// to address a transport before it has announced its own endpoint.
pub fn loopback_peer(key: &SecretKey, port: u16) -> BoundPeer {
    BoundPeer { public_key: key.public_key(), endpoint: DnsEndPoint::new("127.0.0.1", port), public_ip: None }
}

/// Polls `cond` every `interval` until it returns `ControlFlow::Break`,
/// bounded by `max_wait`.
pub async fn wait_or_timeout<C, F, T>(
    interval: Duration,
    max_wait: Duration,
    mut cond: C,
) -> Result<T, tokio::time::error::Elapsed>
where
    C: FnMut() -> F,
    F: std::future::Future<Output = ControlFlow<T>>,
{
    let mut ticker = tokio::time::interval(interval);
    tokio::time::timeout(max_wait, async {
        loop {
            ticker.tick().await;
            if let ControlFlow::Break(res) = cond().await {
                break res;
            }
        }
    })
    .await
}
