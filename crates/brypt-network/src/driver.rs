//! The link-driver seam between endpoint workers and transports.
//!
//! A driver owns the transport descriptors for one endpoint and exposes
//! frame-level operations; socket polling strategy, framing quirks, and
//! radio timing all stay behind this trait. Workers call [`LinkDriver::poll`]
//! once per cycle with a short deadline so no lock is ever held across a
//! blocking transport call.

use std::time::Duration;

use brypt_types::{BindingAddress, ConnectionHandle, RemoteAddress};

use crate::endpoint::InternalType;
use crate::Result;

/// Something that happened on the link since the last poll.
#[derive(Debug)]
pub enum LinkEvent {
    /// A remote opened a connection (server side).
    Connected(ConnectionHandle, RemoteAddress),
    /// A complete frame arrived. A zero-length frame on a stream link is
    /// a connection state change tick, not application data.
    Frame(ConnectionHandle, Vec<u8>),
    /// The remote closed the connection or the link dropped it.
    Closed(ConnectionHandle),
}

/// Frame-level transport operations for one endpoint.
pub trait LinkDriver: Send {
    /// The concrete transport implementation behind this driver.
    fn internal_type(&self) -> InternalType;

    /// Start accepting connections on the binding (server side).
    fn bind(&mut self, binding: &BindingAddress) -> Result<()>;

    /// Open a connection to the remote (client side).
    fn connect(&mut self, remote: &RemoteAddress) -> Result<ConnectionHandle>;

    /// Gather link events, waiting at most `timeout` for readiness.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<LinkEvent>>;

    /// Write one frame to a connection.
    fn send(&mut self, handle: ConnectionHandle, frame: &[u8]) -> Result<()>;

    /// Drop one connection.
    fn disconnect(&mut self, handle: ConnectionHandle);

    /// Release every descriptor. The driver is unusable afterwards.
    fn close(&mut self);
}

/// Constructs a fresh driver for each endpoint that needs one.
pub type DriverFactory = Box<dyn Fn() -> Box<dyn LinkDriver> + Send + Sync>;
