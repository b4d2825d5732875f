//! End-to-end scenarios exercising real [`swarm_net::Transport`] instances
//! over loopback TCP.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use swarm_net::config::Config;
use swarm_net::message::MessageBody;
use swarm_net::peer::AppProtocolVersion;
use swarm_net::testonly::{bound_peer, loopback_config, secret_key_from_seed, start_and_wait, wait_or_timeout};
use swarm_net::transport::Transport;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn s1_ping_pong() {
    let alice = Transport::new(loopback_config(1)).unwrap();
    let bob = Transport::new(loopback_config(2)).unwrap();
    start_and_wait(&alice, WAIT).await;
    start_and_wait(&bob, WAIT).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let bob_reply = bob.clone();
    bob.process_message_handler(move |msg| {
        let received = received_clone.clone();
        let bob_reply = bob_reply.clone();
        Box::pin(async move {
            received.lock().push(msg.kind());
            if msg.kind() == swarm_net::MessageKind::Ping {
                let _ = bob_reply.reply(msg.identity, MessageBody::Pong, CancellationToken::new()).await;
            }
        })
    });

    let bob_peer = bound_peer(&bob);
    let reply = alice
        .send_with_reply(&bob_peer, MessageBody::Ping, WAIT, CancellationToken::new())
        .await
        .expect("ping should receive a pong");
    assert_eq!(reply.body, MessageBody::Pong);

    alice.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    bob.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn s2_version_mismatch_yields_different_version_reply() {
    let alice_key = secret_key_from_seed(3);
    let alice_version = AppProtocolVersion::signed(1, vec![], &alice_key);
    let alice = Transport::new(
        Config::new(alice_key, alice_version).with_host("127.0.0.1").with_listen_port(0),
    )
    .unwrap();

    let bob_key = secret_key_from_seed(4);
    let bob_version = AppProtocolVersion::signed(2, vec![], &bob_key);
    let bob = Transport::new(Config::new(bob_key, bob_version).with_host("127.0.0.1").with_listen_port(0)).unwrap();

    start_and_wait(&alice, WAIT).await;
    start_and_wait(&bob, WAIT).await;

    let bob_peer = bound_peer(&bob);
    let reply = alice
        .send_with_reply(&bob_peer, MessageBody::Ping, WAIT, CancellationToken::new())
        .await
        .expect("version mismatch still yields a reply");
    assert_eq!(reply.body, MessageBody::DifferentVersion);

    alice.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    bob.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn s3_broadcast_reaches_every_peer() {
    let sender = Transport::new(loopback_config(5)).unwrap();
    let receiver_a = Transport::new(loopback_config(6)).unwrap();
    let receiver_b = Transport::new(loopback_config(7)).unwrap();
    start_and_wait(&sender, WAIT).await;
    start_and_wait(&receiver_a, WAIT).await;
    start_and_wait(&receiver_b, WAIT).await;

    let seen_a = Arc::new(Mutex::new(false));
    let seen_b = Arc::new(Mutex::new(false));
    let seen_a_clone = seen_a.clone();
    receiver_a.process_message_handler(move |_msg| {
        let seen_a = seen_a_clone.clone();
        Box::pin(async move { *seen_a.lock() = true; })
    });
    let seen_b_clone = seen_b.clone();
    receiver_b.process_message_handler(move |_msg| {
        let seen_b = seen_b_clone.clone();
        Box::pin(async move { *seen_b.lock() = true; })
    });

    let peers = vec![bound_peer(&receiver_a), bound_peer(&receiver_b)];
    sender.broadcast(peers, MessageBody::Ping).unwrap();

    wait_or_timeout(Duration::from_millis(20), WAIT, || {
        let seen_a = seen_a.clone();
        let seen_b = seen_b.clone();
        async move {
            if *seen_a.lock() && *seen_b.lock() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    })
    .await
    .expect("both receivers should observe the broadcast ping");

    sender.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    receiver_a.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    receiver_b.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn s4_partial_replies_return_on_timeout() {
    let requester = Transport::new(loopback_config(8)).unwrap();
    let silent_peer = Transport::new(loopback_config(9)).unwrap();
    start_and_wait(&requester, WAIT).await;
    start_and_wait(&silent_peer, WAIT).await;
    // `silent_peer` never replies, so the requester must fall back on
    // `return_on_timeout` rather than erroring out after the bound.
    let target = bound_peer(&silent_peer);
    let replies = requester
        .send_with_replies(&target, MessageBody::GetChainStatus, Duration::from_millis(200), 3, true, CancellationToken::new())
        .await
        .expect("return_on_timeout yields whatever was collected");
    assert!(replies.is_empty());

    requester.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    silent_peer.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn s5_peer_reconnect_keeps_replying_to_latest_connection() {
    let alice = Transport::new(loopback_config(10)).unwrap();
    let bob = Transport::new(loopback_config(11)).unwrap();
    start_and_wait(&alice, WAIT).await;
    start_and_wait(&bob, WAIT).await;

    let bob_reply = bob.clone();
    bob.process_message_handler(move |msg| {
        let bob_reply = bob_reply.clone();
        Box::pin(async move {
            let _ = bob_reply.reply(msg.identity, MessageBody::Pong, CancellationToken::new()).await;
        })
    });

    let bob_peer = bound_peer(&bob);
    // Two independent request sockets from the same alice keypair: the
    // identity bob's router derives is the public key, so both "connections"
    // resolve to the same logical peer and each gets its own reply.
    let first = alice
        .send_with_reply(&bob_peer, MessageBody::Ping, WAIT, CancellationToken::new())
        .await
        .unwrap();
    let second = alice
        .send_with_reply(&bob_peer, MessageBody::Ping, WAIT, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.body, MessageBody::Pong);
    assert_eq!(second.body, MessageBody::Pong);

    alice.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    bob.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn s6_idle_outbound_sockets_are_evicted() {
    let mut config = loopback_config(12).with_outbound_socket_lifetime(Duration::from_millis(50));
    config.outbound_socket_sweep_period = Duration::from_millis(50);
    let sender = Transport::new(config).unwrap();
    let receiver = Transport::new(loopback_config(13)).unwrap();
    start_and_wait(&sender, WAIT).await;
    start_and_wait(&receiver, WAIT).await;

    // `send` always opens a dedicated request socket (§4.4) and never
    // touches the outbound cache; only `broadcast` populates it (§4.7).
    let peer = bound_peer(&receiver);
    sender.broadcast(vec![peer], MessageBody::Ping).unwrap();
    // The sweeper runs on `outbound_socket_sweep_period`; give it a couple
    // of cycles to evict the socket this broadcast just cached.
    tokio::time::sleep(Duration::from_millis(400)).await;

    sender.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
    receiver.stop(Duration::from_secs(1), CancellationToken::new()).await.unwrap();
}
