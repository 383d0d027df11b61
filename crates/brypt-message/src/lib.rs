//! # brypt-message
//!
//! The message envelope and routing grammar for the Brypt network.
//!
//! Every application parcel exchanged between authorized peers is a
//! [`MessageEnvelope`]: a self-delimited chunked byte encoding carrying
//! the source and logical destination, the route to the handler, the
//! command state machine position, the payload, and an authentication tag
//! computed over every packed byte that precedes it.
//!
//! ## Wire format
//!
//! ```text
//! SOH
//!   source    ETX US
//!   dest      ETX US    (may carry a legacy ";<await-hex>" suffix)
//!   await     ETX US    (empty when the parcel is not correlated)
//!   command   ETX US
//!   phase     ETX US
//!   nonce     ETX US
//!   size      ETX US
//!   payload   ETX US
//!   timestamp ETX US
//!   <extensions>      (marked chunks: route path, optional status code)
//! EOT
//! <tag>                 (BLAKE3 keyed hash, 32 bytes; absent when unsigned)
//! ```
//!
//! The separator bytes are ASCII control characters, chosen so they can
//! never collide with base58 identifier bytes or alphanumeric route
//! components; the size chunk makes the arbitrary payload self-delimiting.

pub mod context;
pub mod envelope;
pub mod route;

pub use context::MessageContext;
pub use envelope::{
    validate, CommandType, Destination, MessageBuilder, MessageEnvelope, StatusCode,
    ValidationVerdict, MAX_PAYLOAD_SIZE, TAG_SIZE,
};
pub use route::Path;

/// Start-of-envelope control byte.
pub const SOH: u8 = 0x01;

/// End-of-chunk control byte.
pub const ETX: u8 = 0x03;

/// End-of-envelope control byte.
pub const EOT: u8 = 0x04;

/// Chunk separator control byte.
pub const US: u8 = 0x1F;

/// Error types for envelope construction and decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The byte stream does not parse as an envelope.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The route string fails the path grammar.
    #[error("invalid route: {0}")]
    RouteInvalid(String),

    /// The source identifier is malformed or not allowed.
    #[error("invalid source: {0}")]
    SourceInvalid(String),

    /// The payload exceeds the maximum encodable size.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A required envelope field was never supplied to the builder.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Result type alias for envelope operations.
pub type Result<T> = std::result::Result<T, MessageError>;
