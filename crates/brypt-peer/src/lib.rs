//! # brypt-peer
//!
//! Peer sessions and their resolution.
//!
//! A [`PeerProxy`] is the in-process representative of a remote node: it
//! owns the security state machine, the per-endpoint route book, and the
//! session keys once the handshake completes. The [`ResolutionService`]
//! owns every proxy, matches inbound and outbound connections to node
//! identifiers, fans requests out across the authorized cluster, and
//! notifies registered observers of session transitions.
//!
//! Endpoints reach sessions only through the mediator traits of
//! `brypt-network`; they hold weak proxy references, and the service
//! holds the strong ones.

pub mod proxy;
pub mod resolution;

pub use proxy::{MessageSink, PeerProxy, SecurityState};
pub use resolution::{ConnectProtocol, PeerFilter, PeerObserver, ResolutionService};

/// Consecutive validation failures before a peer is flagged.
pub const FLAG_THRESHOLD: u8 = 3;

/// Error types for peer session operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// No connection exists for the target node.
    #[error("unknown peer")]
    UnknownPeer,

    /// The security exchange failed and the peer was flagged.
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    /// The session is not in a state that permits the operation.
    #[error("invalid session state")]
    InvalidState,
}

/// Result type alias for peer session operations.
pub type Result<T> = std::result::Result<T, PeerError>;
