//! # brypt-network
//!
//! The transport-agnostic endpoint model and the connection registry.
//!
//! An endpoint drives one worker thread over a [`driver::LinkDriver`]:
//! the worker drains queued bind/connect instructions, receives available
//! frames, flushes a bounded batch of outgoing messages, and parks on a
//! condition variable until new work or shutdown. Per-protocol behavior
//! lives entirely in the driver; everything above the driver is shared.
//!
//! Received frames resolve through the [`tracker::ConnectionTracker`] and
//! are delivered to the owning peer session via the mediator traits the
//! peer layer implements. Endpoints hold weak references to sessions and
//! a strong reference to the tracker; the tracker stores identifiers,
//! never sessions.

pub mod driver;
pub mod endpoint;
pub mod loopback;
pub mod manager;
pub mod mediator;
pub mod tcp;
pub mod tracker;

pub use endpoint::{Endpoint, InternalType, LinkEndpoint};
pub use manager::EndpointManager;
pub use mediator::{PeerMediator, SendHook, SessionHandler};
pub use tracker::{
    CallbackIteration, ConnectionDetails, ConnectionTracker, IterationFilter, PromotionFilter,
};

use std::time::Duration;

/// How long a worker parks when it has no work.
pub const CYCLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Send attempts per outgoing message before it is dropped.
pub const MESSAGE_RETRY_LIMIT: u8 = 3;

/// Bind/connect attempts before the endpoint reports failure.
pub const INSTRUCTION_RETRY_LIMIT: u8 = 5;

/// Base delay for bind/connect retry backoff; doubles per attempt.
pub const INSTRUCTION_BACKOFF: Duration = Duration::from_millis(100);

/// Outgoing messages flushed per worker cycle.
pub const MESSAGES_PER_CYCLE: usize = 32;

/// Error types for endpoint and transport operations.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The driver could not bind the requested address.
    #[error("bind failed for {uri}: {reason}")]
    BindFailed { uri: String, reason: String },

    /// The driver could not reach the remote address.
    #[error("connect failed for {uri}: {reason}")]
    ConnectFailed { uri: String, reason: String },

    /// A frame could not be written to the link.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The operation addressed a connection the driver no longer holds.
    #[error("unknown connection: {0}")]
    UnknownConnection(brypt_types::ConnectionHandle),

    /// The endpoint has no driver registered for the protocol.
    #[error("no driver registered for protocol {0}")]
    DriverUnavailable(brypt_types::Protocol),

    /// Underlying transport I/O failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for endpoint and transport operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
