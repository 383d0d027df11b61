//! # brypt-types
//!
//! Shared domain types used across the Brypt workspace: transport
//! protocols, network addresses, endpoint identity, and connection state.

pub mod address;
pub mod connection;
pub mod endpoint;
pub mod protocol;

pub use address::{BindingAddress, RemoteAddress};
pub use connection::{
    ConnectionHandle, ConnectionHandleGenerator, ConnectionState, DisconnectCause, StateMask,
};
pub use endpoint::{EndpointIdentifier, EndpointIdentifierGenerator, Operation};
pub use protocol::Protocol;

/// Correlator binding a response envelope to its originating request.
pub type TrackerKey = [u8; 16];

/// Error types for shared domain type construction.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// The address string does not match `<protocol>://<authority>`.
    #[error("malformed address uri: {0}")]
    MalformedUri(String),

    /// The protocol tag is not recognized.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
}

/// Result type alias for shared domain type construction.
pub type Result<T> = std::result::Result<T, TypeError>;
