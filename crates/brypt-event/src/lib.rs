//! # brypt-event
//!
//! Deferred event publication for the node runtime.
//!
//! Systems that do not need immediate effects publish through an
//! [`EventPublisher`]; listeners run later on the dispatching thread.
//! Subscriptions are not thread safe by design: only the thread that
//! constructed the publisher may subscribe, and it must suspend
//! subscriptions before the first dispatch. Publishing is substantially
//! more common than subscribing, so after suspension the listener table
//! is immutable and read without locking; only the event queue takes a
//! mutex.

mod publisher;

pub use publisher::EventPublisher;

use brypt_identifier::NodeIdentifier;
use brypt_types::{
    DisconnectCause, EndpointIdentifier, Operation, Protocol, RemoteAddress,
};

/// The kinds of events the runtime can advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerResolving,
    PeerConnected,
    PeerDisconnected,
    EndpointStarted,
    EndpointStopped,
    EndpointFailed,
    RuntimeStarted,
    RuntimeStopped,
}

/// A published event and its payload.
#[derive(Clone, Debug)]
pub enum Event {
    /// A connection is being matched to a node identifier.
    PeerResolving { address: RemoteAddress },
    /// A peer completed the security exchange.
    PeerConnected {
        identifier: NodeIdentifier,
        address: RemoteAddress,
        protocol: Protocol,
    },
    /// A peer session ended.
    PeerDisconnected {
        identifier: NodeIdentifier,
        address: RemoteAddress,
        protocol: Protocol,
        cause: DisconnectCause,
    },
    /// An endpoint worker came up.
    EndpointStarted {
        endpoint: EndpointIdentifier,
        protocol: Protocol,
        operation: Operation,
    },
    /// An endpoint worker shut down.
    EndpointStopped {
        endpoint: EndpointIdentifier,
        protocol: Protocol,
        operation: Operation,
    },
    /// An endpoint exhausted its bind or connect retries.
    EndpointFailed {
        endpoint: EndpointIdentifier,
        protocol: Protocol,
        failure: String,
    },
    /// The runtime finished startup.
    RuntimeStarted,
    /// The runtime shut down.
    RuntimeStopped,
}

impl Event {
    /// The kind listeners subscribe under.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PeerResolving { .. } => EventKind::PeerResolving,
            Event::PeerConnected { .. } => EventKind::PeerConnected,
            Event::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Event::EndpointStarted { .. } => EventKind::EndpointStarted,
            Event::EndpointStopped { .. } => EventKind::EndpointStopped,
            Event::EndpointFailed { .. } => EventKind::EndpointFailed,
            Event::RuntimeStarted => EventKind::RuntimeStarted,
            Event::RuntimeStopped => EventKind::RuntimeStopped,
        }
    }
}
