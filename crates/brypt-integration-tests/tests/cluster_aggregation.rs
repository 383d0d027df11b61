//! Cluster-wide requests aggregate their responses under a deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brypt_await::DEFAULT_AWAIT_TIMEOUT;
use brypt_integration_tests::{establish_session, test_node, TestNode};
use brypt_message::{CommandType, Destination, MessageEnvelope};

const CLUSTER_SIZE: usize = 16;

fn cluster(await_timeout: Duration) -> (TestNode, Vec<TestNode>) {
    let hub = test_node(await_timeout);
    let peers: Vec<TestNode> = (0..CLUSTER_SIZE)
        .map(|index| {
            let peer = test_node(await_timeout);
            establish_session(&hub, &peer, 36000 + index as u16);
            peer
        })
        .collect();
    assert_eq!(hub.service.active_count(), CLUSTER_SIZE);
    (hub, peers)
}

/// Answer every request the peer's sink has collected.
fn respond_all(hub: &TestNode, peer: &TestNode) {
    for (_, request) in peer.sink.parcels() {
        let token = *request.await_token().expect("tracker key");
        let proxy = peer.service.find(&hub.identifier).expect("session");
        let frame = proxy
            .pack_signed(
                MessageEnvelope::builder()
                    .destination(Destination::Unicast(hub.identifier.clone()))
                    .route("/query")
                    .command(CommandType::Query, 1)
                    .payload(b"pong".to_vec())
                    .bind_awaitable(token),
            )
            .expect("signed response");
        assert!(proxy.schedule_send_any(frame));
    }
}

#[test]
fn test_full_cluster_response_aggregation() {
    let (hub, peers) = cluster(DEFAULT_AWAIT_TIMEOUT);

    let responses = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (_, expected) = hub
        .service
        .request(
            Destination::Cluster,
            "/query",
            b"ping",
            {
                let responses = responses.clone();
                Arc::new(move |_, payload| {
                    assert_eq!(payload, b"pong");
                    responses.fetch_add(1, Ordering::SeqCst);
                })
            },
            {
                let errors = errors.clone();
                Arc::new(move |_, _, _| {
                    errors.fetch_add(1, Ordering::SeqCst);
                })
            },
        )
        .expect("request staged");
    assert_eq!(expected, CLUSTER_SIZE);

    for peer in &peers {
        respond_all(&hub, peer);
    }

    // One sweep past the check interval releases the fulfilled entry.
    assert_eq!(hub.tracking.check_tracked(), 1);
    assert_eq!(responses.load(Ordering::SeqCst), CLUSTER_SIZE);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[test]
fn test_partial_cluster_times_out_missing_responders() {
    let (hub, peers) = cluster(Duration::from_millis(400));

    let responses = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (_, expected) = hub
        .service
        .request(
            Destination::Cluster,
            "/query",
            b"ping",
            {
                let responses = responses.clone();
                Arc::new(move |_, _| {
                    responses.fetch_add(1, Ordering::SeqCst);
                })
            },
            {
                let errors = errors.clone();
                Arc::new(move |_, _, error| {
                    assert_eq!(error, brypt_await::AwaitError::Timeout);
                    errors.fetch_add(1, Ordering::SeqCst);
                })
            },
        )
        .expect("request staged");
    assert_eq!(expected, CLUSTER_SIZE);

    for peer in peers.iter().take(10) {
        respond_all(&hub, peer);
    }

    // Before the deadline nothing is released.
    assert_eq!(hub.tracking.check_tracked(), 0);

    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(hub.tracking.check_tracked(), 1);
    assert_eq!(responses.load(Ordering::SeqCst), 10);
    assert_eq!(errors.load(Ordering::SeqCst), CLUSTER_SIZE - 10);
}

#[test]
fn test_every_expected_responder_resolves_exactly_once() {
    let (hub, peers) = cluster(Duration::from_millis(300));

    let outcomes = Arc::new(AtomicUsize::new(0));
    hub.service
        .request(
            Destination::Cluster,
            "/query",
            b"ping",
            {
                let outcomes = outcomes.clone();
                Arc::new(move |_, _| {
                    outcomes.fetch_add(1, Ordering::SeqCst);
                })
            },
            {
                let outcomes = outcomes.clone();
                Arc::new(move |_, _, _| {
                    outcomes.fetch_add(1, Ordering::SeqCst);
                })
            },
        )
        .expect("request staged");

    for peer in peers.iter().take(7) {
        respond_all(&hub, peer);
    }
    std::thread::sleep(Duration::from_millis(400));
    hub.tracking.check_tracked();

    // Exactly one callback per expected responder, response or error.
    assert_eq!(outcomes.load(Ordering::SeqCst), CLUSTER_SIZE);
}
