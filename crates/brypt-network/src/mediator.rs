//! Traits the peer layer implements so endpoints can hand traffic to
//! sessions without depending on the peer crate.

use std::sync::Arc;

use brypt_identifier::NodeIdentifier;
use brypt_message::MessageContext;
use brypt_types::{DisconnectCause, EndpointIdentifier, RemoteAddress};

/// Schedules one frame onto the connection this hook was created for.
/// Returns whether the frame was accepted into the outgoing queue.
pub type SendHook = Arc<dyn Fn(Vec<u8>) -> bool + Send + Sync>;

/// The per-peer session surface an endpoint talks to.
///
/// Implemented by the peer proxy. Endpoints hold these behind [`std::sync::Weak`]
/// so a withdrawn peer is dropped as soon as its owner releases it.
pub trait SessionHandler: Send + Sync {
    /// Attach an endpoint route to the session: the context identifies
    /// the endpoint, the hook schedules sends on the connection.
    fn register_endpoint(
        &self,
        context: MessageContext,
        address: Option<RemoteAddress>,
        hook: SendHook,
    );

    /// Detach an endpoint route, recording why.
    fn withdraw_endpoint(&self, endpoint: EndpointIdentifier, cause: DisconnectCause);

    /// Deliver received bytes to the session. Returns false when the
    /// bytes were rejected and the connection should be considered
    /// suspect.
    fn schedule_receive(&self, endpoint: EndpointIdentifier, bytes: &[u8]) -> bool;

    /// The node identifier, once resolution has established it.
    fn node_identifier(&self) -> Option<NodeIdentifier>;
}

/// The resolution surface an endpoint uses to match connections to
/// sessions.
///
/// Implemented by the peer resolution service.
pub trait PeerMediator: Send + Sync {
    /// Obtain the session for a newly observed connection, creating a
    /// resolving session if none matches the address.
    fn link_connection(&self, address: &RemoteAddress) -> Arc<dyn SessionHandler>;

    /// Announce an outbound resolution attempt. Returns the opening
    /// handshake bytes the caller must send, or `None` when a resolution
    /// for the address is already in flight.
    fn declare_resolving_peer(&self, address: &RemoteAddress) -> Option<Vec<u8>>;

    /// Cancel a pending outbound resolution.
    fn rescind_resolving_peer(&self, address: &RemoteAddress);
}
