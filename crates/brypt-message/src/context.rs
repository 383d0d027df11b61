//! Per-endpoint message context.

use brypt_types::{EndpointIdentifier, Protocol};

/// Identifies the endpoint a message arrived through or should leave by.
///
/// A peer proxy stores one context per registered endpoint; it travels
/// with received envelopes so responses can be scheduled on the same
/// link the request used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageContext {
    endpoint: EndpointIdentifier,
    protocol: Protocol,
}

impl MessageContext {
    pub fn new(endpoint: EndpointIdentifier, protocol: Protocol) -> Self {
        Self { endpoint, protocol }
    }

    pub fn endpoint(&self) -> EndpointIdentifier {
        self.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}
