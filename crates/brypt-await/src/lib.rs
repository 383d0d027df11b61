//! # brypt-await
//!
//! Correlates outgoing requests with the responses they gather.
//!
//! A request bound for one or many peers is staged here before it leaves
//! the node. Each staged entry holds the expected responder set and a
//! deadline; responses carrying the entry's tracker key fill slots as
//! they arrive from any endpoint worker. The scheduler sweeps the table
//! on a fixed interval: entries that are complete or past deadline emit
//! their callbacks — one per expected responder, response or error — and
//! are released.

mod service;

pub use service::{AwaitableTrackingService, ErrorCallback, ResponseCallback};

use std::time::Duration;

/// Default time a staged request waits for its responses.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Interval at which the scheduler sweeps the tracked entries.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Why a staged request could not be satisfied by a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AwaitError {
    /// The response source is not in the expected responder set.
    #[error("unexpected responder")]
    UnexpectedResponder,

    /// The responder's slot was already filled.
    #[error("duplicate response")]
    DuplicateResponse,

    /// The deadline passed before the responder answered.
    #[error("timeout")]
    Timeout,
}
