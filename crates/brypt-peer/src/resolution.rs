//! Matching connections to node identifiers and owning the peer set.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use brypt_await::{AwaitableTrackingService, ErrorCallback, ResponseCallback};
use brypt_event::{Event, EventPublisher};
use brypt_identifier::NodeIdentifier;
use brypt_message::{
    CommandType, Destination, MessageContext, MessageEnvelope,
};
use brypt_network::{CallbackIteration, PeerMediator, SessionHandler};
use brypt_types::{DisconnectCause, RemoteAddress, TrackerKey};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::proxy::{MessageSink, PeerProxy, ProxyHost};

/// Which peers an iteration or count should cover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerFilter {
    /// Authorized sessions only.
    Active,
    /// Observed peers without an authorized session.
    Inactive,
    /// Every observed peer.
    None,
}

/// Receives synchronous notification of peer session transitions.
pub trait PeerObserver: Send + Sync {
    fn on_remote_connected(&self, identifier: &NodeIdentifier, address: Option<&RemoteAddress>);
    fn on_remote_disconnected(&self, identifier: &NodeIdentifier, cause: DisconnectCause);
}

/// Invoked with each freshly authorized session so the application layer
/// can send its opening message.
pub type ConnectProtocol = Arc<dyn Fn(&Arc<PeerProxy>) + Send + Sync>;

#[derive(Default)]
struct ServiceState {
    /// Proxies awaiting an outbound exchange, indexed by address URI.
    resolving: HashMap<String, Arc<PeerProxy>>,
    /// Every proxy the service has created and still owns.
    observed: Vec<Arc<PeerProxy>>,
    observers: Vec<Weak<dyn PeerObserver>>,
    connect_protocol: Option<ConnectProtocol>,
}

/// Owns every peer proxy and resolves connections to node identifiers.
pub struct ResolutionService {
    local: NodeIdentifier,
    publisher: Arc<EventPublisher>,
    tracking: Arc<AwaitableTrackingService>,
    sink: Arc<dyn MessageSink>,
    state: Mutex<ServiceState>,
    weak_self: Weak<ResolutionService>,
}

impl ResolutionService {
    pub fn new(
        local: NodeIdentifier,
        publisher: Arc<EventPublisher>,
        tracking: Arc<AwaitableTrackingService>,
        sink: Arc<dyn MessageSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            local,
            publisher,
            tracking,
            sink,
            state: Mutex::new(ServiceState::default()),
            weak_self: weak.clone(),
        })
    }

    /// The local node's identifier.
    pub fn local_identifier(&self) -> &NodeIdentifier {
        &self.local
    }

    fn create_proxy(&self) -> Arc<PeerProxy> {
        let host: Weak<dyn ProxyHost> = self.weak_self.clone();
        PeerProxy::new(self.local.clone(), self.publisher.clone(), host)
    }

    /// Register an observer for session transitions. Observers are held
    /// weakly; dropped observers fall out of the set.
    pub fn register_observer(&self, observer: &Arc<dyn PeerObserver>) {
        self.state.lock().observers.push(Arc::downgrade(observer));
    }

    /// Install the hook invoked for each freshly authorized session.
    pub fn set_connect_protocol(&self, protocol: ConnectProtocol) {
        self.state.lock().connect_protocol = Some(protocol);
    }

    /// Associate a node identifier with an address, promoting a pending
    /// resolution for the address or creating a fresh proxy.
    pub fn link_peer(&self, identifier: NodeIdentifier, address: &RemoteAddress) -> Arc<PeerProxy> {
        let mut state = self.state.lock();
        if let Some(proxy) = state.resolving.remove(&address.uri()) {
            proxy.set_identifier(identifier);
            return proxy;
        }
        if let Some(proxy) = state
            .observed
            .iter()
            .find(|proxy| proxy.identifier().as_ref() == Some(&identifier))
        {
            return proxy.clone();
        }

        let proxy = self.create_proxy();
        proxy.set_identifier(identifier);
        state.observed.push(proxy.clone());
        proxy
    }

    /// The proxy for a node, if observed.
    pub fn find(&self, identifier: &NodeIdentifier) -> Option<Arc<PeerProxy>> {
        self.state
            .lock()
            .observed
            .iter()
            .find(|proxy| proxy.identifier().as_ref() == Some(identifier))
            .cloned()
    }

    /// Build, stage, and fan out a request toward a logical destination.
    ///
    /// Returns the tracker key and the number of peers expected to
    /// respond, or `None` when a unicast target is unknown or the
    /// request cannot be built.
    pub fn request(
        &self,
        destination: Destination,
        route: &str,
        payload: &[u8],
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> Option<(TrackerKey, usize)> {
        let targets: Vec<Arc<PeerProxy>> = match &destination {
            Destination::Unicast(identifier) => {
                let proxy = self.find(identifier)?;
                if !proxy.is_authorized() {
                    return None;
                }
                vec![proxy]
            }
            Destination::Cluster | Destination::Network => {
                let mut active = Vec::new();
                self.for_each(PeerFilter::Active, |proxy| {
                    active.push(proxy.clone());
                    CallbackIteration::Continue
                });
                active
            }
        };

        let canonical = MessageEnvelope::builder()
            .source(self.local.clone())
            .destination(destination.clone())
            .route(route)
            .command(CommandType::Query, 0)
            .payload(payload.to_vec())
            .validated_build()
            .ok()?;

        let responders: Vec<NodeIdentifier> = targets
            .iter()
            .filter_map(|proxy| proxy.identifier())
            .collect();
        let expected = responders.len();
        let key = self
            .tracking
            .stage(canonical, &responders, on_response, on_error);

        for proxy in &targets {
            let builder = MessageEnvelope::builder()
                .destination(destination.clone())
                .route(route)
                .command(CommandType::Query, 0)
                .payload(payload.to_vec())
                .bind_awaitable(key);
            match proxy.pack_signed(builder) {
                Some(frame) => {
                    if !proxy.schedule_send_any(frame) {
                        warn!("Request could not be scheduled on any endpoint");
                    }
                }
                None => warn!("Request skipped a peer without an authorized session"),
            }
        }

        debug!(expected, route, "Request staged");
        Some((key, expected))
    }

    /// Walk observed peers matching the filter.
    pub fn for_each<F>(&self, filter: PeerFilter, mut callback: F)
    where
        F: FnMut(&Arc<PeerProxy>) -> CallbackIteration,
    {
        let observed = self.state.lock().observed.clone();
        for proxy in &observed {
            let matched = match filter {
                PeerFilter::Active => proxy.is_authorized(),
                PeerFilter::Inactive => !proxy.is_authorized(),
                PeerFilter::None => true,
            };
            if matched && callback(proxy) == CallbackIteration::Stop {
                break;
            }
        }
    }

    /// Number of authorized sessions.
    pub fn active_count(&self) -> usize {
        let mut count = 0;
        self.for_each(PeerFilter::Active, |_| {
            count += 1;
            CallbackIteration::Continue
        });
        count
    }

    /// Number of observed peers without an authorized session.
    pub fn inactive_count(&self) -> usize {
        let mut count = 0;
        self.for_each(PeerFilter::Inactive, |_| {
            count += 1;
            CallbackIteration::Continue
        });
        count
    }

    /// Number of peers the service has observed.
    pub fn observed_count(&self) -> usize {
        self.state.lock().observed.len()
    }

    /// Number of outbound resolutions in flight.
    pub fn resolving_count(&self) -> usize {
        self.state.lock().resolving.len()
    }

    /// Tear down every session, as on runtime shutdown.
    pub fn withdraw_all(&self, cause: DisconnectCause) {
        let observed = self.state.lock().observed.clone();
        for proxy in observed {
            proxy.withdraw(cause);
        }
    }

    fn notify_connected(&self, identifier: &NodeIdentifier, address: Option<&RemoteAddress>) {
        let observers = self.upgraded_observers();
        for observer in observers {
            observer.on_remote_connected(identifier, address);
        }
    }

    fn notify_disconnected(&self, identifier: &NodeIdentifier, cause: DisconnectCause) {
        let observers = self.upgraded_observers();
        for observer in observers {
            observer.on_remote_disconnected(identifier, cause);
        }
    }

    fn upgraded_observers(&self) -> Vec<Arc<dyn PeerObserver>> {
        let mut state = self.state.lock();
        state.observers.retain(|observer| observer.strong_count() > 0);
        state
            .observers
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl ProxyHost for ResolutionService {
    fn on_authorized(&self, identifier: &NodeIdentifier, address: Option<&RemoteAddress>) {
        debug!(identifier = %identifier, "Peer authorized");
        self.notify_connected(identifier, address);

        let protocol = self.state.lock().connect_protocol.clone();
        if let (Some(protocol), Some(proxy)) = (protocol, self.find(identifier)) {
            protocol(&proxy);
        }
    }

    fn on_teardown(&self, identifier: Option<&NodeIdentifier>, cause: DisconnectCause) {
        if let Some(identifier) = identifier {
            debug!(identifier = %identifier, %cause, "Peer withdrawn");
            self.notify_disconnected(identifier, cause);
        }
    }

    fn on_parcel(&self, context: MessageContext, envelope: MessageEnvelope) {
        // Responses to requests this node staged flow to the tracking
        // service; everything else is application traffic.
        if let Some(token) = envelope.await_token() {
            if self.tracking.is_tracked(token) {
                self.tracking.process(&envelope);
                return;
            }
        }
        self.sink.collect(context, envelope);
    }
}

impl PeerMediator for ResolutionService {
    fn link_connection(&self, address: &RemoteAddress) -> Arc<dyn SessionHandler> {
        let mut state = self.state.lock();
        if let Some(proxy) = state.resolving.remove(&address.uri()) {
            debug!(address = %address, "Connection matched a pending resolution");
            return proxy;
        }

        debug!(address = %address, "Observing a fresh connection");
        let proxy = self.create_proxy();
        state.observed.push(proxy.clone());
        proxy
    }

    fn declare_resolving_peer(&self, address: &RemoteAddress) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if state.resolving.contains_key(&address.uri()) {
            return None;
        }

        let proxy = self.create_proxy();
        let initial = match proxy.declare_resolving() {
            Ok(initial) => initial,
            Err(error) => {
                warn!(address = %address, %error, "Resolution declaration failed");
                return None;
            }
        };

        state.resolving.insert(address.uri(), proxy.clone());
        state.observed.push(proxy);
        self.publisher.publish(Event::PeerResolving {
            address: address.clone(),
        });
        Some(initial)
    }

    fn rescind_resolving_peer(&self, address: &RemoteAddress) {
        let mut state = self.state.lock();
        if let Some(proxy) = state.resolving.remove(&address.uri()) {
            proxy.rescind_resolving();
            state
                .observed
                .retain(|observed| !Arc::ptr_eq(observed, &proxy));
        }
    }
}
