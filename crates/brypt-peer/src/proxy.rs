//! The in-process representative of a remote peer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use brypt_event::{Event, EventPublisher};
use brypt_identifier::NodeIdentifier;
use brypt_message::{MessageBuilder, MessageContext, MessageEnvelope, ValidationVerdict};
use brypt_network::{SendHook, SessionHandler};
use brypt_security::{CipherPackage, HandshakeSynchronizer, SynchronizerStatus};
use brypt_types::{DisconnectCause, EndpointIdentifier, Protocol, RemoteAddress};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{PeerError, Result, FLAG_THRESHOLD};

/// The authentication state of a peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityState {
    /// No exchange has begun.
    Unauthorized,
    /// The handshake synchronizer is mid-exchange.
    Processing,
    /// The session is authenticated; parcels flow.
    Authorized,
    /// The session failed validation and requires re-resolution.
    Flagged,
}

/// Receives validated application parcels from authorized sessions.
pub trait MessageSink: Send + Sync {
    fn collect(&self, context: MessageContext, envelope: MessageEnvelope);
}

/// The owner a proxy reports its transitions to.
pub(crate) trait ProxyHost: Send + Sync {
    fn on_authorized(&self, identifier: &NodeIdentifier, address: Option<&RemoteAddress>);
    fn on_teardown(&self, identifier: Option<&NodeIdentifier>, cause: DisconnectCause);
    fn on_parcel(&self, context: MessageContext, envelope: MessageEnvelope);
}

struct EndpointRoute {
    context: MessageContext,
    address: Option<RemoteAddress>,
    hook: SendHook,
}

struct ProxyState {
    identifier: Option<NodeIdentifier>,
    security: SecurityState,
    synchronizer: Option<HandshakeSynchronizer>,
    cipher: Option<CipherPackage>,
    routes: HashMap<EndpointIdentifier, EndpointRoute>,
    last_nonce: Option<u32>,
    next_nonce: u32,
    failures: u8,
    sent: u64,
    received: u64,
    withdrawal: Option<DisconnectCause>,
}

/// Work gathered under the proxy lock and executed after it is released,
/// so no callback or event ever runs while the session is locked.
enum DeferredAction {
    Send(SendHook, Vec<u8>),
    Connected {
        identifier: NodeIdentifier,
        address: Option<RemoteAddress>,
        protocol: Protocol,
    },
    Disconnected {
        identifier: Option<NodeIdentifier>,
        address: Option<RemoteAddress>,
        protocol: Protocol,
        cause: DisconnectCause,
    },
    Parcel(MessageContext, MessageEnvelope),
}

/// An authenticated session with a remote node across one or more
/// endpoints.
pub struct PeerProxy {
    local: NodeIdentifier,
    publisher: Arc<EventPublisher>,
    host: Weak<dyn ProxyHost>,
    state: Mutex<ProxyState>,
}

impl PeerProxy {
    pub(crate) fn new(
        local: NodeIdentifier,
        publisher: Arc<EventPublisher>,
        host: Weak<dyn ProxyHost>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            publisher,
            host,
            state: Mutex::new(ProxyState {
                identifier: None,
                security: SecurityState::Unauthorized,
                synchronizer: None,
                cipher: None,
                routes: HashMap::new(),
                last_nonce: None,
                next_nonce: 1,
                failures: 0,
                sent: 0,
                received: 0,
                withdrawal: None,
            }),
        })
    }

    /// The remote's identifier, once resolution has established it.
    pub fn identifier(&self) -> Option<NodeIdentifier> {
        self.state.lock().identifier.clone()
    }

    pub(crate) fn set_identifier(&self, identifier: NodeIdentifier) {
        self.state.lock().identifier = Some(identifier);
    }

    pub fn security_state(&self) -> SecurityState {
        self.state.lock().security
    }

    pub fn is_authorized(&self) -> bool {
        self.security_state() == SecurityState::Authorized
    }

    /// Parcels sent to and received from this peer.
    pub fn statistics(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.sent, state.received)
    }

    /// Why the last session ended, if one has.
    pub fn withdrawal_cause(&self) -> Option<DisconnectCause> {
        self.state.lock().withdrawal
    }

    /// The address registered for any endpoint route, preferring the
    /// given endpoint.
    pub fn registered_address(&self, endpoint: EndpointIdentifier) -> Option<RemoteAddress> {
        let state = self.state.lock();
        state
            .routes
            .get(&endpoint)
            .and_then(|route| route.address.clone())
            .or_else(|| {
                state
                    .routes
                    .values()
                    .find_map(|route| route.address.clone())
            })
    }

    /// Begin an outbound exchange, producing the opening handshake bytes.
    pub(crate) fn declare_resolving(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if state.security != SecurityState::Unauthorized {
            return Err(PeerError::InvalidState);
        }
        let mut synchronizer = HandshakeSynchronizer::initiator(self.local.network_string());
        let initial = synchronizer
            .initialize()
            .map_err(|e| PeerError::HandshakeFailure(e.to_string()))?;
        state.synchronizer = Some(synchronizer);
        state.security = SecurityState::Processing;
        Ok(initial)
    }

    /// Abandon an exchange that never completed.
    pub(crate) fn rescind_resolving(&self) {
        let mut state = self.state.lock();
        if state.security == SecurityState::Processing {
            state.synchronizer = None;
            state.security = SecurityState::Unauthorized;
        }
    }

    /// Sign and pack an outgoing parcel under the session key, stamping
    /// the next outgoing nonce. `None` until the session is authorized.
    pub fn pack_signed(&self, builder: MessageBuilder) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let cipher = state.cipher.as_ref()?;
        let key = *cipher.tag_key();
        let nonce = state.next_nonce;

        let envelope = builder
            .source(self.local.clone())
            .nonce(nonce)
            .signing_key(key)
            .validated_build()
            .ok()?;
        state.next_nonce += 1;
        Some(envelope.pack())
    }

    /// Queue bytes on a specific registered endpoint.
    pub fn schedule_send(&self, endpoint: EndpointIdentifier, frame: Vec<u8>) -> bool {
        let hook = {
            let state = self.state.lock();
            let Some(route) = state.routes.get(&endpoint) else {
                return false;
            };
            route.hook.clone()
        };
        let accepted = hook(frame);
        if accepted {
            self.state.lock().sent += 1;
        }
        accepted
    }

    /// Queue bytes on any registered endpoint.
    pub fn schedule_send_any(&self, frame: Vec<u8>) -> bool {
        let endpoint = {
            let state = self.state.lock();
            state.routes.keys().next().copied()
        };
        match endpoint {
            Some(endpoint) => self.schedule_send(endpoint, frame),
            None => false,
        }
    }

    /// Tear the session down, recording why.
    pub fn withdraw(&self, cause: DisconnectCause) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            self.teardown_locked(&mut state, cause, &mut actions);
        }
        self.execute(actions);
    }

    fn teardown_locked(
        &self,
        state: &mut ProxyState,
        cause: DisconnectCause,
        actions: &mut Vec<DeferredAction>,
    ) {
        if !matches!(
            state.security,
            SecurityState::Authorized | SecurityState::Processing
        ) {
            return;
        }
        state.security = match cause {
            DisconnectCause::HandshakeFailure => SecurityState::Flagged,
            _ => SecurityState::Unauthorized,
        };
        state.synchronizer = None;
        state.cipher = None;
        state.last_nonce = None;
        state.withdrawal = Some(cause);

        let (address, protocol) = route_summary(state);
        actions.push(DeferredAction::Disconnected {
            identifier: state.identifier.clone(),
            address,
            protocol,
            cause,
        });
    }

    fn drive_synchronizer(
        &self,
        state: &mut ProxyState,
        endpoint: EndpointIdentifier,
        bytes: &[u8],
        actions: &mut Vec<DeferredAction>,
    ) -> bool {
        let Some(mut synchronizer) = state.synchronizer.take() else {
            return false;
        };

        let output = match synchronizer.synchronize(bytes) {
            Ok(output) => output,
            Err(error) => {
                warn!(%error, "Handshake round failed");
                self.teardown_locked(state, DisconnectCause::HandshakeFailure, actions);
                return false;
            }
        };

        if !output.is_empty() {
            if let Some(route) = state.routes.get(&endpoint) {
                actions.push(DeferredAction::Send(route.hook.clone(), output));
            }
        }

        match synchronizer.status() {
            SynchronizerStatus::Processing => {
                state.synchronizer = Some(synchronizer);
                true
            }
            SynchronizerStatus::Ready => self.complete_exchange(state, endpoint, synchronizer, actions),
            SynchronizerStatus::Error => {
                self.teardown_locked(state, DisconnectCause::HandshakeFailure, actions);
                false
            }
        }
    }

    fn complete_exchange(
        &self,
        state: &mut ProxyState,
        endpoint: EndpointIdentifier,
        synchronizer: HandshakeSynchronizer,
        actions: &mut Vec<DeferredAction>,
    ) -> bool {
        let announced = synchronizer
            .peer_identifier()
            .and_then(|text| NodeIdentifier::from_network_string(text).ok());
        let Some(identifier) = announced else {
            warn!("Handshake announced an invalid node identifier");
            self.teardown_locked(state, DisconnectCause::HandshakeFailure, actions);
            return false;
        };

        let cipher = match synchronizer.finalize() {
            Ok(cipher) => cipher,
            Err(error) => {
                warn!(%error, "Cipher package finalization failed");
                self.teardown_locked(state, DisconnectCause::HandshakeFailure, actions);
                return false;
            }
        };

        state.cipher = Some(cipher);
        state.identifier = Some(identifier.clone());
        state.security = SecurityState::Authorized;
        state.failures = 0;
        state.last_nonce = None;
        state.next_nonce = 1;

        let (route_address, protocol) = route_summary(state);
        let address = state
            .routes
            .get(&endpoint)
            .and_then(|route| route.address.clone())
            .or(route_address);
        debug!(identifier = %identifier, "Session authorized");
        actions.push(DeferredAction::Connected {
            identifier,
            address,
            protocol,
        });
        true
    }

    fn process_parcel(
        &self,
        state: &mut ProxyState,
        endpoint: EndpointIdentifier,
        bytes: &[u8],
        actions: &mut Vec<DeferredAction>,
    ) -> bool {
        let key = match &state.cipher {
            Some(cipher) => *cipher.tag_key(),
            None => return false,
        };

        let (mut verdict, envelope) = brypt_message::validate(bytes, Some(&key), state.last_nonce);
        if let (ValidationVerdict::Success, Some(envelope)) = (verdict, envelope) {
            if state.identifier.as_ref() == Some(envelope.source()) {
                state.last_nonce = Some(envelope.nonce());
                state.received += 1;
                state.failures = 0;
                if let Some(route) = state.routes.get(&endpoint) {
                    actions.push(DeferredAction::Parcel(route.context, envelope));
                }
                return true;
            }
            verdict = ValidationVerdict::UnknownSource;
        }

        state.failures += 1;
        warn!(
            ?verdict,
            failures = state.failures,
            "Dropping parcel that failed validation"
        );
        if state.failures >= FLAG_THRESHOLD {
            self.teardown_locked(state, DisconnectCause::HandshakeFailure, actions);
        }
        false
    }

    fn execute(&self, actions: Vec<DeferredAction>) {
        for action in actions {
            match action {
                DeferredAction::Send(hook, frame) => {
                    if hook(frame) {
                        self.state.lock().sent += 1;
                    }
                }
                DeferredAction::Connected {
                    identifier,
                    address,
                    protocol,
                } => {
                    if let Some(host) = self.host.upgrade() {
                        host.on_authorized(&identifier, address.as_ref());
                    }
                    if let Some(address) = address {
                        self.publisher.publish(Event::PeerConnected {
                            identifier,
                            address,
                            protocol,
                        });
                    }
                }
                DeferredAction::Disconnected {
                    identifier,
                    address,
                    protocol,
                    cause,
                } => {
                    if let Some(host) = self.host.upgrade() {
                        host.on_teardown(identifier.as_ref(), cause);
                    }
                    if let Some(address) = address {
                        self.publisher.publish(Event::PeerDisconnected {
                            identifier: identifier.unwrap_or_else(NodeIdentifier::unknown),
                            address,
                            protocol,
                            cause,
                        });
                    }
                }
                DeferredAction::Parcel(context, envelope) => {
                    if let Some(host) = self.host.upgrade() {
                        host.on_parcel(context, envelope);
                    }
                }
            }
        }
    }
}

fn route_summary(state: &ProxyState) -> (Option<RemoteAddress>, Protocol) {
    let address = state
        .routes
        .values()
        .find_map(|route| route.address.clone());
    let protocol = state
        .routes
        .values()
        .next()
        .map(|route| route.context.protocol())
        .unwrap_or(Protocol::Tcp);
    (address, protocol)
}

impl SessionHandler for PeerProxy {
    fn register_endpoint(
        &self,
        context: MessageContext,
        address: Option<RemoteAddress>,
        hook: SendHook,
    ) {
        let mut state = self.state.lock();
        state.routes.insert(
            context.endpoint(),
            EndpointRoute {
                context,
                address,
                hook,
            },
        );
    }

    fn withdraw_endpoint(&self, endpoint: EndpointIdentifier, cause: DisconnectCause) {
        let mut actions = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.routes.contains_key(&endpoint) {
                return;
            }
            // Tear down before removing the last route so the departure
            // notification still carries the route's address.
            if state.routes.len() == 1 {
                self.teardown_locked(&mut state, cause, &mut actions);
            }
            state.routes.remove(&endpoint);
        }
        self.execute(actions);
    }

    fn schedule_receive(&self, endpoint: EndpointIdentifier, bytes: &[u8]) -> bool {
        let mut actions = Vec::new();
        let accepted = {
            let mut state = self.state.lock();
            match state.security {
                SecurityState::Flagged => false,
                SecurityState::Unauthorized => {
                    let mut synchronizer =
                        HandshakeSynchronizer::responder(self.local.network_string());
                    match synchronizer.initialize() {
                        Ok(_) => {
                            state.synchronizer = Some(synchronizer);
                            state.security = SecurityState::Processing;
                            self.drive_synchronizer(&mut state, endpoint, bytes, &mut actions)
                        }
                        Err(error) => {
                            warn!(%error, "Responder synchronizer failed to start");
                            false
                        }
                    }
                }
                SecurityState::Processing => {
                    self.drive_synchronizer(&mut state, endpoint, bytes, &mut actions)
                }
                SecurityState::Authorized => {
                    self.process_parcel(&mut state, endpoint, bytes, &mut actions)
                }
            }
        };
        self.execute(actions);
        accepted
    }

    fn node_identifier(&self) -> Option<NodeIdentifier> {
        self.identifier()
    }
}
