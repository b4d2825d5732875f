//! C2: resolve the node's advertised public endpoint via either a
//! configured host or an ICE server pool (TURN allocation + STUN-derived
//! public address) (§4.2).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use stun::message::Getter as _;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, IceServer};
use crate::error::NatError;
use crate::peer::{DnsEndPoint, Peer, PublicKey};

const STUN_QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// What C2 produced: the peer to advertise, plus (if TURN allocation was
/// used) the live TURN client so the lifecycle controller can keep it
/// alive and tear it down on `stop()`.
pub struct Resolution {
    pub peer: Peer,
    pub turn_client: Option<Arc<turn::client::Client>>,
}

/// Runs the §4.2 algorithm once at start. `turn_cancel` governs any
/// background renewal/re-allocation the underlying TURN client performs.
pub async fn resolve(
    config: &Config,
    listen_port: u16,
    public_key: PublicKey,
    turn_cancel: CancellationToken,
) -> Result<Resolution, NatError> {
    if let Some(host) = &config.host {
        let _ = turn_cancel; // no TURN client to babysit on the host-configured path.
        return Ok(Resolution {
            peer: Peer::new(public_key, Some(DnsEndPoint::new(host.clone(), listen_port)), None),
            turn_client: None,
        });
    }

    let mut last_err = None;
    for server in &config.ice_servers {
        match try_ice_server(server, listen_port, public_key.clone()).await {
            Ok(resolution) => return Ok(resolution),
            Err(e) => {
                tracing::warn!(target: "net::nat", server = %server.url, error = %e, "ICE server did not yield a usable endpoint");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(NatError::NoUsableEndpoint))
}

async fn try_ice_server(
    server: &IceServer,
    listen_port: u16,
    public_key: PublicKey,
) -> Result<Resolution, NatError> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(NatError::Dns)?;
    let local_addr = socket.local_addr().map_err(NatError::Dns)?;

    let client_config = turn::client::ClientConfig {
        stun_serv_addr: server.url.clone(),
        turn_serv_addr: server.url.clone(),
        username: server.username.clone().unwrap_or_default(),
        password: server.credential.clone().unwrap_or_default(),
        realm: String::new(),
        software: String::new(),
        rto_in_ms: 0,
        conn: Arc::new(socket),
        vnet: None,
    };

    let client = Arc::new(
        turn::client::Client::new(client_config)
            .await
            .map_err(|e| NatError::TurnAllocate(server.url.clone(), e.into()))?,
    );
    client
        .listen()
        .await
        .map_err(|e| NatError::TurnAllocate(server.url.clone(), e.into()))?;
    let relay_conn = client
        .allocate()
        .await
        .map_err(|e| NatError::TurnAllocate(server.url.clone(), e.into()))?;
    let relay_addr = relay_conn
        .local_addr()
        .map_err(|e| NatError::TurnAllocate(server.url.clone(), anyhow::Error::from(e)))?;

    let stun_addr = lookup_host(&server.url, true)
        .await
        .ok_or_else(|| NatError::TurnAllocate(server.url.clone(), anyhow::anyhow!("ICE server has no IPv4 address")))?;
    let public_ip = query_public_ip(stun_addr).await.ok();

    // "Not behind NAT" iff the address the STUN server observed us from
    // matches our own local bind address.
    let behind_nat = public_ip.map(|ip| ip != local_addr.ip()).unwrap_or(true);

    if !behind_nat {
        if let Some(ip) = public_ip {
            return Ok(Resolution {
                peer: Peer::new(public_key, Some(DnsEndPoint::new(ip.to_string(), listen_port)), Some(ip)),
                turn_client: Some(client),
            });
        }
    }

    Ok(Resolution {
        peer: Peer::new(public_key, None, public_ip.or(Some(relay_addr.ip()))),
        turn_client: Some(client),
    })
}

/// Resolves a `"<domain/ip>:<port>"`-shaped server address via DNS,
/// preferring an IPv4 record when `want_ipv4` is set.
async fn lookup_host(addr: &str, want_ipv4: bool) -> Option<SocketAddr> {
    for addr in tokio::net::lookup_host(addr).await.ok()? {
        if want_ipv4 == addr.is_ipv4() {
            return Some(addr);
        }
    }
    None
}

/// Sends a STUN BINDING request to `addr` and returns the IP this machine
/// is observed to have from the outside.
async fn query_public_ip(addr: SocketAddr) -> Result<IpAddr, NatError> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| NatError::Stun(addr, e.into()))?;
    socket.connect(addr).await.map_err(|e| NatError::Stun(addr, e.into()))?;
    let mut client = stun::client::ClientBuilder::new()
        .with_conn(Arc::new(socket))
        .build()
        .map_err(|e| NatError::Stun(addr, e.into()))?;
    let mut msg = stun::message::Message::new();
    msg.new_transaction_id().map_err(|e| NatError::Stun(addr, e.into()))?;
    msg.set_type(stun::message::BINDING_REQUEST);
    msg.build(&[]).map_err(|e| NatError::Stun(addr, e.into()))?;

    let (send, mut recv) = tokio::sync::mpsc::unbounded_channel();
    client
        .send(&msg, Some(Arc::new(send)))
        .await
        .map_err(|e| NatError::Stun(addr, e.into()))?;

    let ip = tokio::select! {
        _ = tokio::time::sleep(STUN_QUERY_TIMEOUT) => {
            return Err(NatError::Stun(addr, anyhow::anyhow!("STUN query timed out")));
        }
        event = recv.recv() => match event {
            None => return Err(NatError::Stun(addr, anyhow::anyhow!("STUN client closed before responding"))),
            Some(event) => {
                let mut raddr = stun::xoraddr::XorMappedAddress::default();
                raddr
                    .get_from(&event.event_body.map_err(|e| NatError::Stun(addr, e.into()))?)
                    .map_err(|e| NatError::Stun(addr, e.into()))?;
                raddr.ip
            }
        }
    };
    let _ = client.close().await;
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SecretKey;

    #[tokio::test]
    async fn host_configured_bypasses_ice_entirely() {
        let key = SecretKey::generate();
        let version = crate::peer::AppProtocolVersion::signed(1, vec![], &key);
        let config = Config::new(key.clone(), version).with_host("node.example.invalid");
        let resolution = resolve(&config, 4001, key.public_key(), CancellationToken::new()).await.unwrap();
        assert_eq!(
            resolution.peer.endpoint,
            Some(DnsEndPoint::new("node.example.invalid", 4001))
        );
        assert!(resolution.turn_client.is_none());
    }

    #[tokio::test]
    async fn no_host_and_no_ice_servers_fails() {
        let key = SecretKey::generate();
        let version = crate::peer::AppProtocolVersion::signed(1, vec![], &key);
        let config = Config::new(key.clone(), version);
        let err = resolve(&config, 0, key.public_key(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, NatError::NoUsableEndpoint));
    }
}
