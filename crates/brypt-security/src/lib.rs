//! # brypt-security
//!
//! Session security for peer links: the handshake synchronizer that
//! drives two nodes from first contact to an authenticated session, and
//! the cipher package holding the keys that session runs on.
//!
//! The exchange is a three-round ephemeral X25519 agreement with
//! BLAKE3-derived directional keys and explicit key confirmation:
//!
//! 1. Initiator hello — ephemeral public key + node identifier.
//! 2. Responder hello — ephemeral public key + node identifier + a MAC
//!    over the transcript proving key possession.
//! 3. Initiator confirmation — a MAC over the full transcript.
//!
//! A MAC mismatch at either side aborts the exchange; there is no retry
//! within a synchronizer, the peer must be re-resolved.

pub mod cipher;
pub mod handshake;

pub use cipher::CipherPackage;
pub use handshake::{HandshakeRole, HandshakeSynchronizer, SynchronizerStatus};

/// Key derivation contexts. Each derived key is domain-separated so no
/// two uses of the shared secret can collide.
pub(crate) mod contexts {
    pub const SESSION_ROOT: &str = "brypt v0 session-root";
    pub const INITIATOR_KEY: &str = "brypt v0 session-initiator";
    pub const RESPONDER_KEY: &str = "brypt v0 session-responder";
    pub const ENVELOPE_TAG_KEY: &str = "brypt v0 envelope-tag";
    pub const INITIATOR_CONFIRMATION: &str = "brypt v0 confirm-initiator";
    pub const RESPONDER_CONFIRMATION: &str = "brypt v0 confirm-responder";
}

/// Error types for security operations.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// A handshake frame arrived out of order or in a finished exchange.
    #[error("unexpected handshake frame")]
    UnexpectedFrame,

    /// A handshake frame does not parse.
    #[error("malformed handshake frame: {0}")]
    MalformedFrame(String),

    /// The remote's key confirmation MAC does not verify.
    #[error("key confirmation failed")]
    KeyConfirmationFailed,

    /// The synchronizer is not in a state that permits the operation.
    #[error("invalid synchronizer state")]
    InvalidState,

    /// AEAD open failed: the ciphertext or its associated data is bad.
    #[error("aead decryption failed")]
    AeadFailure,
}

/// Result type alias for security operations.
pub type Result<T> = std::result::Result<T, SecurityError>;
