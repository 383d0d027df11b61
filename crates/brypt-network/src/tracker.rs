//! The connection registry: a multi-indexed map from transport handles to
//! connection details, node identifiers, and address URIs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Instant;

use brypt_identifier::NodeIdentifier;
use brypt_types::{ConnectionHandle, ConnectionState, RemoteAddress, StateMask};
use parking_lot::ReentrantMutex;

/// What a connection looks like to the rest of the runtime.
#[derive(Clone, Debug)]
pub struct ConnectionDetails {
    address: Option<RemoteAddress>,
    identifier: Option<NodeIdentifier>,
    state: ConnectionState,
    updated: Instant,
}

impl ConnectionDetails {
    fn new(address: Option<RemoteAddress>) -> Self {
        Self {
            address,
            identifier: None,
            state: ConnectionState::Resolving,
            updated: Instant::now(),
        }
    }

    pub fn address(&self) -> Option<&RemoteAddress> {
        self.address.as_ref()
    }

    /// The owning node, once the connection has been promoted.
    pub fn identifier(&self) -> Option<&NodeIdentifier> {
        self.identifier.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.updated = Instant::now();
    }

    /// When the details last changed.
    pub fn updated(&self) -> Instant {
        self.updated
    }

    pub fn is_promoted(&self) -> bool {
        self.identifier.is_some()
    }
}

/// Whether an iteration wants promoted entries, unpromoted ones, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PromotionFilter {
    Promoted,
    Unpromoted,
    #[default]
    Any,
}

/// Composable predicate for tracker iteration.
#[derive(Clone, Copy, Debug)]
pub struct IterationFilter {
    /// Connection states to include; compose with `|` to match several.
    pub states: StateMask,
    pub promotion: PromotionFilter,
    /// Only entries whose last update precedes this instant.
    pub updated_before: Option<Instant>,
}

impl Default for IterationFilter {
    fn default() -> Self {
        Self {
            states: StateMask::ANY,
            promotion: PromotionFilter::Any,
            updated_before: None,
        }
    }
}

impl IterationFilter {
    fn matches(&self, details: &ConnectionDetails) -> bool {
        if !self.states.contains(details.state) {
            return false;
        }
        match self.promotion {
            PromotionFilter::Promoted if !details.is_promoted() => return false,
            PromotionFilter::Unpromoted if details.is_promoted() => return false,
            _ => {}
        }
        if let Some(boundary) = self.updated_before {
            if details.updated >= boundary {
                return false;
            }
        }
        true
    }
}

/// Tells an iteration whether to keep walking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackIteration {
    Continue,
    Stop,
}

#[derive(Default)]
struct TrackerState {
    entries: HashMap<ConnectionHandle, ConnectionDetails>,
    identifiers: HashMap<NodeIdentifier, ConnectionHandle>,
    uris: HashMap<String, ConnectionHandle>,
}

/// The registry of live connections.
///
/// The lock is reentrant so iteration callbacks may call back into the
/// tracker; entry data is copied out before each callback runs, so a
/// callback observing the registry never aliases the entry it was handed.
#[derive(Default)]
pub struct ConnectionTracker {
    state: ReentrantMutex<RefCell<TrackerState>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection in the resolving state. Tracking an
    /// already-known handle is a no-op.
    pub fn track(&self, handle: ConnectionHandle, address: Option<RemoteAddress>) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.entries.contains_key(&handle) {
            return;
        }
        if let Some(address) = &address {
            state.uris.insert(address.uri(), handle);
        }
        state.entries.insert(handle, ConnectionDetails::new(address));
    }

    /// Attach the resolved node identifier to a tracked connection.
    /// Fails when the handle was never tracked.
    pub fn promote(&self, handle: ConnectionHandle, identifier: NodeIdentifier) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(details) = state.entries.get_mut(&handle) else {
            return false;
        };
        details.identifier = Some(identifier.clone());
        details.state = ConnectionState::Connected;
        details.updated = Instant::now();
        state.identifiers.insert(identifier, handle);
        true
    }

    /// Remove a connection and its secondary indices.
    pub fn untrack(&self, handle: ConnectionHandle) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(details) = state.entries.remove(&handle) {
            if let Some(identifier) = details.identifier {
                state.identifiers.remove(&identifier);
            }
            if let Some(address) = details.address {
                state.uris.remove(&address.uri());
            }
        }
    }

    /// Refresh the update timestamp of a tracked connection.
    pub fn touch(&self, handle: ConnectionHandle) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match state.entries.get_mut(&handle) {
            Some(details) => {
                details.updated = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The node identifier owning a handle, if promoted.
    pub fn translate_handle(&self, handle: ConnectionHandle) -> Option<NodeIdentifier> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .entries
            .get(&handle)
            .and_then(|details| details.identifier.clone())
    }

    /// The handle carrying a node's connection, if promoted.
    pub fn translate_identifier(&self, identifier: &NodeIdentifier) -> Option<ConnectionHandle> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.identifiers.get(identifier).copied()
    }

    pub fn is_uri_tracked(&self, uri: &str) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.uris.contains_key(uri)
    }

    pub fn size(&self) -> usize {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every entry and index.
    pub fn reset(&self) {
        let guard = self.state.lock();
        *guard.borrow_mut() = TrackerState::default();
    }

    /// Walk matching handles.
    pub fn for_each<F>(&self, filter: IterationFilter, mut callback: F)
    where
        F: FnMut(ConnectionHandle) -> CallbackIteration,
    {
        let guard = self.state.lock();
        let entries = {
            let state = guard.borrow();
            snapshot(&state, filter)
        };
        for (handle, _) in entries {
            if callback(handle) == CallbackIteration::Stop {
                break;
            }
        }
    }

    /// Walk matching entries with read access to their details.
    pub fn read_each<F>(&self, filter: IterationFilter, mut callback: F)
    where
        F: FnMut(ConnectionHandle, &ConnectionDetails) -> CallbackIteration,
    {
        let guard = self.state.lock();
        let entries = {
            let state = guard.borrow();
            snapshot(&state, filter)
        };
        for (handle, details) in entries {
            if callback(handle, &details) == CallbackIteration::Stop {
                break;
            }
        }
    }

    /// Walk matching entries with update access to their details. The
    /// update timestamp refreshes for every entry the callback visits.
    pub fn update_each<F>(&self, filter: IterationFilter, mut callback: F)
    where
        F: FnMut(ConnectionHandle, &mut ConnectionDetails) -> CallbackIteration,
    {
        let guard = self.state.lock();
        let entries = {
            let state = guard.borrow();
            snapshot(&state, filter)
        };
        for (handle, mut details) in entries {
            let verdict = callback(handle, &mut details);
            details.updated = Instant::now();
            if let Some(entry) = guard.borrow_mut().entries.get_mut(&handle) {
                entry.state = details.state;
                entry.updated = details.updated;
            }
            if verdict == CallbackIteration::Stop {
                break;
            }
        }
    }
}

fn snapshot(
    state: &TrackerState,
    filter: IterationFilter,
) -> Vec<(ConnectionHandle, ConnectionDetails)> {
    state
        .entries
        .iter()
        .filter(|(_, details)| filter.matches(details))
        .map(|(handle, details)| (*handle, details.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use brypt_types::Protocol;

    fn address(port: u16) -> RemoteAddress {
        RemoteAddress::new(Protocol::Tcp, &format!("127.0.0.1:{port}")).expect("address")
    }

    #[test]
    fn test_track_is_idempotent() {
        let tracker = ConnectionTracker::new();
        let handle = ConnectionHandle::new(1);
        tracker.track(handle, Some(address(35216)));
        tracker.track(handle, None);
        assert_eq!(tracker.size(), 1);
        assert!(tracker.is_uri_tracked("tcp://127.0.0.1:35216"));
    }

    #[test]
    fn test_promote_requires_tracked_handle() {
        let tracker = ConnectionTracker::new();
        let identifier = NodeIdentifier::generate().expect("identifier");
        assert!(!tracker.promote(ConnectionHandle::new(9), identifier.clone()));

        let handle = ConnectionHandle::new(1);
        tracker.track(handle, None);
        assert!(tracker.promote(handle, identifier));
    }

    #[test]
    fn test_translation_is_bidirectional() {
        let tracker = ConnectionTracker::new();
        let handle = ConnectionHandle::new(7);
        let identifier = NodeIdentifier::generate().expect("identifier");

        tracker.track(handle, Some(address(35216)));
        assert_eq!(tracker.translate_handle(handle), None);

        tracker.promote(handle, identifier.clone());
        assert_eq!(tracker.translate_handle(handle), Some(identifier.clone()));
        assert_eq!(tracker.translate_identifier(&identifier), Some(handle));
    }

    #[test]
    fn test_untrack_clears_indices() {
        let tracker = ConnectionTracker::new();
        let handle = ConnectionHandle::new(7);
        let identifier = NodeIdentifier::generate().expect("identifier");

        tracker.track(handle, Some(address(35216)));
        tracker.promote(handle, identifier.clone());
        tracker.untrack(handle);

        assert!(tracker.is_empty());
        assert_eq!(tracker.translate_identifier(&identifier), None);
        assert!(!tracker.is_uri_tracked("tcp://127.0.0.1:35216"));
    }

    #[test]
    fn test_state_mask_iteration() {
        let tracker = ConnectionTracker::new();
        for token in 0..4u64 {
            tracker.track(ConnectionHandle::new(token), None);
        }
        let connected = ConnectionHandle::new(0);
        tracker.promote(connected, NodeIdentifier::generate().expect("identifier"));

        let filter = IterationFilter {
            states: ConnectionState::Connected.mask() | ConnectionState::Resolving.mask(),
            ..Default::default()
        };
        let mut visited = 0;
        tracker.read_each(filter, |_, _| {
            visited += 1;
            CallbackIteration::Continue
        });
        assert_eq!(visited, 4);

        let filter = IterationFilter {
            states: ConnectionState::Connected.mask(),
            ..Default::default()
        };
        let mut connected_only = Vec::new();
        tracker.read_each(filter, |handle, _| {
            connected_only.push(handle);
            CallbackIteration::Continue
        });
        assert_eq!(connected_only, vec![connected]);
    }

    #[test]
    fn test_stop_halts_iteration() {
        let tracker = ConnectionTracker::new();
        for token in 0..8u64 {
            tracker.track(ConnectionHandle::new(token), None);
        }
        let mut visited = 0;
        tracker.for_each(IterationFilter::default(), |_| {
            visited += 1;
            CallbackIteration::Stop
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_update_each_writes_back_state() {
        let tracker = ConnectionTracker::new();
        let handle = ConnectionHandle::new(3);
        tracker.track(handle, None);

        tracker.update_each(IterationFilter::default(), |_, details| {
            details.set_state(ConnectionState::Disconnected);
            CallbackIteration::Continue
        });

        let mut state = None;
        tracker.read_each(IterationFilter::default(), |_, details| {
            state = Some(details.state());
            CallbackIteration::Continue
        });
        assert_eq!(state, Some(ConnectionState::Disconnected));
    }

    #[test]
    fn test_callback_reentry_is_permitted() {
        let tracker = ConnectionTracker::new();
        tracker.track(ConnectionHandle::new(1), None);

        tracker.read_each(IterationFilter::default(), |_, _| {
            // Re-entering through a callback must not deadlock.
            assert_eq!(tracker.size(), 1);
            tracker.track(ConnectionHandle::new(2), None);
            CallbackIteration::Continue
        });
        assert_eq!(tracker.size(), 2);
    }

    #[test]
    fn test_reset() {
        let tracker = ConnectionTracker::new();
        tracker.track(ConnectionHandle::new(1), Some(address(35216)));
        tracker.reset();
        assert!(tracker.is_empty());
        assert!(!tracker.is_uri_tracked("tcp://127.0.0.1:35216"));
    }

    #[test]
    fn test_updated_before_filter() {
        let tracker = ConnectionTracker::new();
        tracker.track(ConnectionHandle::new(1), None);
        let boundary = Instant::now();

        let mut stale = 0;
        tracker.read_each(
            IterationFilter {
                updated_before: Some(boundary),
                ..Default::default()
            },
            |_, _| {
                stale += 1;
                CallbackIteration::Continue
            },
        );
        assert_eq!(stale, 1);

        tracker.update_each(IterationFilter::default(), |_, _| CallbackIteration::Continue);
        let mut still_stale = 0;
        tracker.read_each(
            IterationFilter {
                updated_before: Some(boundary),
                ..Default::default()
            },
            |_, _| {
                still_stale += 1;
                CallbackIteration::Continue
            },
        );
        assert_eq!(still_stale, 0);
    }
}
