//! # brypt-node
//!
//! The core node runtime: configuration, dependency wiring, the
//! scheduler that drives periodic services, and orderly shutdown.
//!
//! [`runtime::NodeRuntime::setup`] injects every component explicitly —
//! publisher, identifier, tracker, tracking service, resolution service,
//! endpoint manager, bootstrap cache — with no process-global state. One
//! scheduler thread ticks the awaitable sweep, the bootstrap flush, and
//! event dispatch; endpoint workers run on their own threads.

pub mod config;
pub mod runtime;

pub use config::{NodeConfig, ProtocolConfig};
pub use runtime::NodeRuntime;

/// Initialize structured logging from the environment.
///
/// Intended for binaries and integration harnesses; libraries never call
/// this.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "brypt=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Error types for runtime startup and shutdown.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The configured identifier is malformed or generation failed.
    /// Fatal at startup.
    #[error("identifier error: {0}")]
    Identifier(String),

    /// A configured binding or bootstrap does not parse.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The scheduler thread could not be created. Fatal at startup.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Endpoint construction failed.
    #[error(transparent)]
    Network(#[from] brypt_network::NetworkError),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
