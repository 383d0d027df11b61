//! Two runtimes complete the security exchange over live endpoints.

use std::sync::Arc;
use std::time::Duration;

use brypt_integration_tests::wait_until;
use brypt_message::{MessageContext, MessageEnvelope};
use brypt_network::loopback::LoopbackHub;
use brypt_node::{NodeConfig, NodeRuntime, ProtocolConfig};
use brypt_peer::MessageSink;
use brypt_types::{ConnectionHandleGenerator, Protocol};

struct NullSink;

impl MessageSink for NullSink {
    fn collect(&self, _context: MessageContext, _envelope: MessageEnvelope) {}
}

fn runtime(
    dir: &tempfile::TempDir,
    name: &str,
    hub: &LoopbackHub,
    bindings: Vec<String>,
    bootstraps: Vec<String>,
) -> Arc<NodeRuntime> {
    let config = NodeConfig {
        peers_file: dir.path().join(format!("{name}-peers.json")),
        protocols: vec![ProtocolConfig {
            kind: Protocol::Tcp,
            interface: "127.0.0.1".to_string(),
            bindings,
            bootstraps,
        }],
        ..NodeConfig::default()
    };

    let runtime = NodeRuntime::setup(config, Arc::new(NullSink)).expect("setup");
    // Swap the stream driver for the in-memory hub shared by the test's
    // nodes, so no real sockets are involved.
    let hub = hub.clone();
    runtime
        .manager()
        .register_driver(Protocol::Tcp, Box::new(move || hub.driver()));
    runtime
}

#[test]
fn test_two_nodes_authorize_over_endpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = LoopbackHub::new(Arc::new(ConnectionHandleGenerator::new()));

    let server = runtime(
        &dir,
        "server",
        &hub,
        vec!["127.0.0.1:35216".to_string()],
        Vec::new(),
    );
    let client = runtime(
        &dir,
        "client",
        &hub,
        Vec::new(),
        vec!["tcp://127.0.0.1:35216".to_string()],
    );

    server.startup().expect("server startup");
    client.startup().expect("client startup");

    assert!(
        wait_until(Duration::from_secs(5), || {
            server.resolution().active_count() == 1 && client.resolution().active_count() == 1
        }),
        "sessions did not authorize: server={} client={}",
        server.resolution().active_count(),
        client.resolution().active_count(),
    );

    // Each side resolved the other's identifier.
    let observed_by_client = client
        .resolution()
        .find(server.identifier())
        .and_then(|proxy| proxy.identifier());
    assert_eq!(observed_by_client.as_ref(), Some(server.identifier()));

    let observed_by_server = server
        .resolution()
        .find(client.identifier())
        .and_then(|proxy| proxy.identifier());
    assert_eq!(observed_by_server.as_ref(), Some(client.identifier()));

    client.shutdown();
    server.shutdown();
}
