//! Endpoint identity and operating mode.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Identifies one endpoint instance within the local runtime.
///
/// Identifiers are minted by an [`EndpointIdentifierGenerator`] and are
/// unique for the lifetime of the process, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointIdentifier(u32);

impl EndpointIdentifier {
    /// The sentinel identifier for an endpoint that has not been assigned.
    pub const INVALID: EndpointIdentifier = EndpointIdentifier(0);

    /// Whether this identifier was minted by a generator.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EndpointIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint:{}", self.0)
    }
}

/// Monotonic generator for [`EndpointIdentifier`] values.
///
/// The runtime owns one generator and injects it wherever endpoints are
/// constructed; there is no process-global instance.
#[derive(Debug, Default)]
pub struct EndpointIdentifierGenerator {
    next: AtomicU32,
}

impl EndpointIdentifierGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Mint the next endpoint identifier.
    pub fn next(&self) -> EndpointIdentifier {
        EndpointIdentifier(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Whether an endpoint accepts connections or initiates them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Server,
    Client,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Server => f.write_str("server"),
            Operation::Client => f.write_str("client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_monotonic() {
        let generator = EndpointIdentifierGenerator::new();
        let first = generator.next();
        let second = generator.next();
        assert!(first.is_valid());
        assert!(second > first);
    }

    #[test]
    fn test_invalid_identifier() {
        assert!(!EndpointIdentifier::INVALID.is_valid());
    }
}
