//! Shared helpers for the end-to-end scenarios under `tests/`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brypt_await::AwaitableTrackingService;
use brypt_event::EventPublisher;
use brypt_identifier::NodeIdentifier;
use brypt_message::{MessageContext, MessageEnvelope};
use brypt_network::{PeerMediator, SendHook};
use brypt_peer::{MessageSink, ResolutionService};
use brypt_types::{EndpointIdentifierGenerator, Protocol, RemoteAddress};
use parking_lot::Mutex;

/// Poll a condition until it holds or the timeout lapses.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Records every application parcel a node's sessions deliver.
#[derive(Default)]
pub struct Collector {
    parcels: Mutex<Vec<(MessageContext, MessageEnvelope)>>,
}

impl Collector {
    pub fn parcels(&self) -> Vec<(MessageContext, MessageEnvelope)> {
        self.parcels.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.parcels.lock().len()
    }
}

impl MessageSink for Collector {
    fn collect(&self, context: MessageContext, envelope: MessageEnvelope) {
        self.parcels.lock().push((context, envelope));
    }
}

/// One node's peer layer, wired for in-process session tests that skip
/// the endpoint workers.
pub struct TestNode {
    pub identifier: NodeIdentifier,
    pub publisher: Arc<EventPublisher>,
    pub tracking: Arc<AwaitableTrackingService>,
    pub sink: Arc<Collector>,
    pub service: Arc<ResolutionService>,
}

/// Build a node with the given awaitable timeout and subscriptions
/// already suspended.
pub fn test_node(await_timeout: Duration) -> TestNode {
    let identifier = NodeIdentifier::generate().expect("node identifier");
    let publisher = Arc::new(EventPublisher::new());
    publisher.suspend_subscriptions();
    let tracking = Arc::new(AwaitableTrackingService::new(await_timeout));
    let sink = Arc::new(Collector::default());
    let service = ResolutionService::new(
        identifier.clone(),
        publisher.clone(),
        tracking.clone(),
        sink.clone(),
    );
    TestNode {
        identifier,
        publisher,
        tracking,
        sink,
        service,
    }
}

/// Establish an authorized session between two nodes over synchronous
/// in-process links, as though one endpoint on each side carried the
/// connection. Returns once both sides are authorized.
pub fn establish_session(initiator: &TestNode, responder: &TestNode, port: u16) {
    let generator = EndpointIdentifierGenerator::new();
    let endpoint_a = generator.next();
    let endpoint_b = generator.next();

    let target = RemoteAddress::new(Protocol::Tcp, &format!("127.0.0.1:{port}"))
        .expect("target address");
    let origin = RemoteAddress::new(Protocol::Tcp, &format!("127.0.0.1:{}", port + 10_000))
        .expect("origin address");

    let opening = initiator
        .service
        .declare_resolving_peer(&target)
        .expect("opening handshake bytes");

    let session_a = initiator.service.link_connection(&target);
    let session_b = responder.service.link_connection(&origin);

    let hook_to_b: SendHook = {
        let session_b = session_b.clone();
        Arc::new(move |frame: Vec<u8>| session_b.schedule_receive(endpoint_b, &frame))
    };
    let hook_to_a: SendHook = {
        let session_a = session_a.clone();
        Arc::new(move |frame: Vec<u8>| session_a.schedule_receive(endpoint_a, &frame))
    };

    session_a.register_endpoint(
        MessageContext::new(endpoint_a, Protocol::Tcp),
        Some(target),
        hook_to_b.clone(),
    );
    session_b.register_endpoint(
        MessageContext::new(endpoint_b, Protocol::Tcp),
        Some(origin),
        hook_to_a,
    );

    assert!(hook_to_b(opening), "opening bytes were not delivered");
}
