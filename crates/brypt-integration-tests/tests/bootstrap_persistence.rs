//! Known peers persist across a cold restart and drive reconnection.

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

const SERVER_URI: &str = "tcp://127.0.0.1:35216";

fn attach_hub(runtime: &Arc<NodeRuntime>, hub: &LoopbackHub) {
    let hub = hub.clone();
    runtime
        .manager()
        .register_driver(Protocol::Tcp, Box::new(move || hub.driver()));
}

fn client_config(dir: &tempfile::TempDir, bootstraps: Vec<String>) -> NodeConfig {
    NodeConfig {
        peers_file: dir.path().join("client-peers.json"),
        protocols: vec![ProtocolConfig {
            kind: Protocol::Tcp,
            interface: "127.0.0.1".to_string(),
            bindings: Vec::new(),
            bootstraps,
        }],
        ..NodeConfig::default()
    }
}

#[test]
fn test_known_peer_replayed_after_cold_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = LoopbackHub::new(Arc::new(ConnectionHandleGenerator::new()));

    let server_config = NodeConfig {
        peers_file: dir.path().join("server-peers.json"),
        protocols: vec![ProtocolConfig {
            kind: Protocol::Tcp,
            interface: "127.0.0.1".to_string(),
            bindings: vec!["127.0.0.1:35216".to_string()],
            bootstraps: Vec::new(),
        }],
        ..NodeConfig::default()
    };
    let server = NodeRuntime::setup(server_config, Arc::new(NullSink)).expect("server setup");
    attach_hub(&server, &hub);
    server.startup().expect("server startup");

    // First life: the client learns the server address through the
    // configured bootstrap and persists it on the scheduler flush.
    {
        let client = NodeRuntime::setup(
            client_config(&dir, vec![SERVER_URI.to_string()]),
            Arc::new(NullSink),
        )
        .expect("client setup");
        attach_hub(&client, &hub);
        client.startup().expect("client startup");

        assert!(
            wait_until(Duration::from_secs(5), || {
                client.resolution().active_count() == 1
            }),
            "client never authorized"
        );
        assert!(
            wait_until(Duration::from_secs(5), || {
                client.bootstrap_cache().contains(Protocol::Tcp, SERVER_URI)
            }),
            "bootstrap never recorded"
        );
        client.shutdown();
    }

    let persisted =
        std::fs::read_to_string(dir.path().join("client-peers.json")).expect("peers file");
    assert!(persisted.contains(SERVER_URI), "file: {persisted}");

    // Second life: no configured bootstraps; the persisted contact is
    // the reconnect candidate.
    let revived = NodeRuntime::setup(client_config(&dir, Vec::new()), Arc::new(NullSink))
        .expect("revived setup");
    attach_hub(&revived, &hub);
    revived.startup().expect("revived startup");

    assert!(
        wait_until(Duration::from_secs(5), || {
            revived.resolution().active_count() == 1
        }),
        "revived client never reconnected"
    );

    revived.shutdown();
    server.shutdown();
}
