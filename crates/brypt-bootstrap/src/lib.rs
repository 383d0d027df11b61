//! # brypt-bootstrap
//!
//! Persistence of known-peer contact entries.
//!
//! The cache holds a de-duplicated set of bootstrap address strings per
//! protocol and mirrors it to a known-peers file so a restarted node can
//! reconnect to the cluster it left. Session events drive mutation: a
//! completed handshake inserts the peer's address, an orderly departure
//! retains it, and a failed handshake removes it. File trouble is never
//! fatal; the in-memory set survives and the write retries on the next
//! flush.

mod cache;

pub use cache::{BootstrapCache, MAX_FILE_SIZE};

/// Error types for bootstrap persistence.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The known-peers file could not be read or written.
    #[error("file error: {0}")]
    File(String),

    /// The known-peers file exceeds the serialized size cap.
    #[error("file too large: {size} bytes exceeds cap of {cap} bytes")]
    FileTooLarge { size: usize, cap: usize },

    /// The known-peers file does not decode.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result type alias for bootstrap persistence.
pub type Result<T> = std::result::Result<T, BootstrapError>;
