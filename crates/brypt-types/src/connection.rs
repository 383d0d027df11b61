//! Connection handles, states, and teardown causes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque token identifying one transport-level connection.
///
/// Handles are minted by the owning endpoint and carry no meaning outside
/// it; the connection tracker uses them purely as map keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn token(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection:{:#x}", self.0)
    }
}

/// Mints process-unique connection handles.
///
/// Every driver in the runtime shares one generator so handles from
/// different endpoints never collide inside the connection tracker.
#[derive(Debug, Default)]
pub struct ConnectionHandleGenerator {
    next: std::sync::atomic::AtomicU64,
}

impl ConnectionHandleGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ConnectionHandle {
        let token = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ConnectionHandle(token + 1)
    }
}

/// The lifecycle state of a tracked connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// The connection exists but the owning node is not yet known.
    Resolving,
    Connected,
    Disconnected,
    Unknown,
}

impl ConnectionState {
    /// The bit this state occupies in a [`StateMask`].
    pub fn mask(self) -> StateMask {
        match self {
            ConnectionState::Resolving => StateMask(0b0001),
            ConnectionState::Connected => StateMask(0b0010),
            ConnectionState::Disconnected => StateMask(0b0100),
            ConnectionState::Unknown => StateMask(0b1000),
        }
    }
}

/// A set of [`ConnectionState`] values, composable with `|` so one pass
/// can match several states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    /// The empty mask: matches nothing.
    pub const NONE: StateMask = StateMask(0);

    /// Matches every state.
    pub const ANY: StateMask = StateMask(0b1111);

    pub fn contains(&self, state: ConnectionState) -> bool {
        self.0 & state.mask().0 != 0
    }
}

impl std::ops::BitOr for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl From<ConnectionState> for StateMask {
    fn from(state: ConnectionState) -> Self {
        state.mask()
    }
}

/// Why a peer session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// The remote closed an established session in good standing.
    SessionClosure,
    /// The local runtime is shutting down.
    NetworkShutdown,
    /// The security exchange failed; the peer was flagged.
    HandshakeFailure,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::SessionClosure => f.write_str("session closure"),
            DisconnectCause::NetworkShutdown => f.write_str("network shutdown"),
            DisconnectCause::HandshakeFailure => f.write_str("handshake failure"),
        }
    }
}
