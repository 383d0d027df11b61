//! The awaitable tracking service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use brypt_identifier::NodeIdentifier;
use brypt_message::MessageEnvelope;
use brypt_types::TrackerKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::AwaitError;

/// Invoked once per received response when an entry completes.
pub type ResponseCallback = Arc<dyn Fn(&NodeIdentifier, &[u8]) + Send + Sync>;

/// Invoked for rejected responses and for responders that never answered.
pub type ErrorCallback = Arc<dyn Fn(TrackerKey, &NodeIdentifier, AwaitError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Pending,
    Fulfilled,
    Expired,
}

enum Slot {
    Unfulfilled,
    Fulfilled(Vec<u8>),
}

struct TrackedEntry {
    request: MessageEnvelope,
    slots: HashMap<NodeIdentifier, Slot>,
    received: usize,
    deadline: Instant,
    state: EntryState,
    on_response: ResponseCallback,
    on_error: ErrorCallback,
}

impl TrackedEntry {
    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }
}

/// Tracks staged requests until their responses arrive or their deadline
/// passes.
///
/// `process` may be called from any endpoint worker; the entry table is
/// guarded by a mutex and callbacks always run outside it.
pub struct AwaitableTrackingService {
    entries: Mutex<HashMap<TrackerKey, TrackedEntry>>,
    timeout: Duration,
}

impl AwaitableTrackingService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Stage a request, recording its expected responders.
    ///
    /// Returns the fresh tracker key the caller must bind into the
    /// outgoing parcels. The request's own source is never expected to
    /// answer and is dropped from the responder set.
    pub fn stage(
        &self,
        request: MessageEnvelope,
        responders: &[NodeIdentifier],
        on_response: ResponseCallback,
        on_error: ErrorCallback,
    ) -> TrackerKey {
        let mut slots = HashMap::new();
        for responder in responders {
            if responder == request.source() {
                continue;
            }
            slots.insert(responder.clone(), Slot::Unfulfilled);
        }

        let entry = TrackedEntry {
            request,
            slots,
            received: 0,
            deadline: Instant::now() + self.timeout,
            state: EntryState::Pending,
            on_response,
            on_error,
        };

        let mut entries = self.entries.lock();
        let key = loop {
            let mut key: TrackerKey = [0u8; 16];
            OsRng.fill_bytes(&mut key);
            if !entries.contains_key(&key) {
                break key;
            }
        };
        debug!(key = %hex_key(&key), expected = entry.slots.len(), "Staged awaitable request");
        entries.insert(key, entry);
        key
    }

    /// Record a response against the entry its tracker key names.
    ///
    /// Rejections are reported through the entry's error callback and
    /// never propagate to the caller; the return value only says whether
    /// the response was absorbed.
    pub fn process(&self, response: &MessageEnvelope) -> bool {
        let Some(key) = response.await_token().copied() else {
            warn!("Dropping response without a tracker key");
            return false;
        };

        let rejection;
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                warn!(key = %hex_key(&key), "Dropping response for an unknown tracker");
                return false;
            };

            match entry.slots.get_mut(response.source()) {
                None => {
                    rejection = (entry.on_error.clone(), AwaitError::UnexpectedResponder);
                }
                Some(Slot::Fulfilled(_)) => {
                    rejection = (entry.on_error.clone(), AwaitError::DuplicateResponse);
                }
                Some(slot) => {
                    *slot = Slot::Fulfilled(response.payload().to_vec());
                    entry.received += 1;
                    if entry.is_complete() {
                        entry.state = EntryState::Fulfilled;
                    }
                    return true;
                }
            }
        }

        let (on_error, error) = rejection;
        debug!(key = %hex_key(&key), %error, "Rejected response");
        on_error(key, response.source(), error);
        false
    }

    /// Sweep the table: expire entries past deadline, then emit the
    /// callbacks of every fulfilled or expired entry and release it.
    ///
    /// Driven by the scheduler on [`crate::CHECK_INTERVAL`]. Returns the
    /// number of entries released.
    pub fn check_tracked(&self) -> usize {
        let now = Instant::now();
        let ready: Vec<(TrackerKey, TrackedEntry)> = {
            let mut entries = self.entries.lock();
            for entry in entries.values_mut() {
                if entry.state == EntryState::Pending && (entry.is_complete() || now >= entry.deadline) {
                    entry.state = if entry.is_complete() {
                        EntryState::Fulfilled
                    } else {
                        EntryState::Expired
                    };
                }
            }
            let keys: Vec<TrackerKey> = entries
                .iter()
                .filter(|(_, entry)| entry.state != EntryState::Pending)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let released = ready.len();
        for (key, entry) in ready {
            debug!(
                key = %hex_key(&key),
                state = ?entry.state,
                received = entry.received,
                expected = entry.slots.len(),
                "Releasing awaitable entry"
            );
            for (responder, slot) in &entry.slots {
                match slot {
                    Slot::Fulfilled(payload) => (entry.on_response)(responder, payload),
                    Slot::Unfulfilled => {
                        (entry.on_error)(key, responder, AwaitError::Timeout);
                    }
                }
            }
        }
        released
    }

    /// Number of entries currently awaiting responses.
    pub fn tracked_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether a tracker key names a live entry.
    pub fn is_tracked(&self, key: &TrackerKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// The source identifier recorded for a staged request, if tracked.
    pub fn staged_source(&self, key: &TrackerKey) -> Option<NodeIdentifier> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.request.source().clone())
    }
}

fn hex_key(key: &TrackerKey) -> String {
    key.iter().map(|byte| format!("{byte:02x}")).collect()
}
