//! # brypt-identifier
//!
//! Globally unique node identifiers for the Brypt network.
//!
//! An identifier is a 128-bit payload produced by running OS entropy
//! through the BLAKE3 extendable-output function, protected by a 4-byte
//! domain-separated checksum. The network representation is
//! `bry0:<base58(payload || checksum)>` — 31 to 33 ASCII bytes, safe to
//! embed in the wire envelope because base58 never emits control bytes.

pub mod reserved;

mod identifier;

pub use identifier::{NodeIdentifier, CHECKSUM_SIZE, METADATA, PAYLOAD_SIZE};

/// Error types for identifier construction.
#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    /// The string or buffer does not decode to an allowed identifier.
    #[error("malformed identifier: {0}")]
    Malformed(String),

    /// The OS entropy source failed during generation.
    #[error("identifier generation failed: {0}")]
    Generation(String),
}

/// Result type alias for identifier construction.
pub type Result<T> = std::result::Result<T, IdentifierError>;
