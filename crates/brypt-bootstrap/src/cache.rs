//! The bootstrap cache and its file mirror.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use brypt_event::{Event, EventPublisher};
use brypt_types::{DisconnectCause, Protocol, RemoteAddress};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{BootstrapError, Result};

/// Serialized size cap for the known-peers file.
pub const MAX_FILE_SIZE: usize = 12 * 1024;

#[derive(Serialize, Deserialize)]
struct ProtocolEntries {
    protocol: String,
    bootstraps: Vec<BootstrapTarget>,
}

#[derive(Serialize, Deserialize)]
struct BootstrapTarget {
    target: String,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Protocol, BTreeSet<String>>,
    dirty: bool,
}

/// Per-protocol sets of known-peer addresses, mirrored to disk.
pub struct BootstrapCache {
    peers_file: PathBuf,
    defaults: HashMap<Protocol, BTreeSet<String>>,
    state: Mutex<CacheState>,
}

impl BootstrapCache {
    /// Create a cache backed by a known-peers file, with the configured
    /// default bootstraps as the fallback set.
    pub fn new(peers_file: &Path, defaults: &[(Protocol, String)]) -> Self {
        let mut grouped: HashMap<Protocol, BTreeSet<String>> = HashMap::new();
        for (protocol, target) in defaults {
            grouped
                .entry(*protocol)
                .or_default()
                .insert(target.clone());
        }
        Self {
            peers_file: peers_file.to_path_buf(),
            defaults: grouped,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Load the known-peers file, falling back to the configured
    /// defaults when the file is absent or does not decode.
    pub fn initialize(&self) {
        match self.load() {
            Ok(entries) => {
                let loaded: usize = entries.values().map(BTreeSet::len).sum();
                info!(loaded, path = %self.peers_file.display(), "Bootstrap cache loaded");
                self.state.lock().entries = entries;
            }
            Err(error) => {
                warn!(
                    %error,
                    path = %self.peers_file.display(),
                    "Falling back to default bootstraps"
                );
                self.state.lock().entries = self.defaults.clone();
            }
        }
    }

    fn load(&self) -> Result<HashMap<Protocol, BTreeSet<String>>> {
        let metadata = std::fs::metadata(&self.peers_file)
            .map_err(|e| BootstrapError::File(e.to_string()))?;
        if metadata.len() as usize > MAX_FILE_SIZE {
            return Err(BootstrapError::FileTooLarge {
                size: metadata.len() as usize,
                cap: MAX_FILE_SIZE,
            });
        }

        let content = std::fs::read_to_string(&self.peers_file)
            .map_err(|e| BootstrapError::File(e.to_string()))?;
        let decoded: Vec<ProtocolEntries> =
            serde_json::from_str(&content).map_err(|e| BootstrapError::Decode(e.to_string()))?;

        let mut entries: HashMap<Protocol, BTreeSet<String>> = HashMap::new();
        for group in decoded {
            let Ok(protocol) = group.protocol.parse::<Protocol>() else {
                warn!(protocol = %group.protocol, "Skipping unknown protocol entry");
                continue;
            };
            let set = entries.entry(protocol).or_default();
            for bootstrap in group.bootstraps {
                if RemoteAddress::from_uri(&bootstrap.target).is_err() {
                    warn!(target = %bootstrap.target, "Skipping unparseable bootstrap");
                    continue;
                }
                set.insert(bootstrap.target);
            }
        }
        Ok(entries)
    }

    /// Record a peer contact address.
    pub fn insert(&self, protocol: Protocol, target: &str) {
        let mut state = self.state.lock();
        if state
            .entries
            .entry(protocol)
            .or_default()
            .insert(target.to_string())
        {
            debug!(%protocol, %target, "Bootstrap recorded");
            state.dirty = true;
        }
    }

    /// Forget a peer contact address.
    pub fn remove(&self, protocol: Protocol, target: &str) {
        let mut state = self.state.lock();
        if state
            .entries
            .get_mut(&protocol)
            .is_some_and(|set| set.remove(target))
        {
            debug!(%protocol, %target, "Bootstrap dropped");
            state.dirty = true;
        }
    }

    pub fn contains(&self, protocol: Protocol, target: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(&protocol)
            .is_some_and(|set| set.contains(target))
    }

    /// The reconnect candidates stored for a protocol.
    pub fn bootstraps(&self, protocol: Protocol) -> Vec<String> {
        self.state
            .lock()
            .entries
            .get(&protocol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total stored addresses across protocols.
    pub fn count(&self) -> usize {
        self.state.lock().entries.values().map(BTreeSet::len).sum()
    }

    /// Write the cache to the known-peers file when it has changed since
    /// the last flush. File errors leave the in-memory set intact and the
    /// dirty flag raised so the next flush retries.
    pub fn flush(&self) -> Result<()> {
        let serialized = {
            let state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }

            let mut groups: Vec<ProtocolEntries> = state
                .entries
                .iter()
                .map(|(protocol, set)| ProtocolEntries {
                    protocol: protocol.tag().to_string(),
                    bootstraps: set
                        .iter()
                        .map(|target| BootstrapTarget {
                            target: target.clone(),
                        })
                        .collect(),
                })
                .collect();
            groups.sort_by(|lhs, rhs| lhs.protocol.cmp(&rhs.protocol));
            serde_json::to_string_pretty(&groups)
                .map_err(|e| BootstrapError::Decode(e.to_string()))?
        };

        if serialized.len() > MAX_FILE_SIZE {
            warn!(
                size = serialized.len(),
                cap = MAX_FILE_SIZE,
                "Skipping bootstrap write over the size cap"
            );
            return Err(BootstrapError::FileTooLarge {
                size: serialized.len(),
                cap: MAX_FILE_SIZE,
            });
        }

        match std::fs::write(&self.peers_file, serialized) {
            Ok(()) => {
                self.state.lock().dirty = false;
                Ok(())
            }
            Err(error) => {
                warn!(%error, path = %self.peers_file.display(), "Bootstrap write failed");
                Err(BootstrapError::File(error.to_string()))
            }
        }
    }

    /// Apply one session event to the cache.
    ///
    /// Completed handshakes insert; orderly departures retain; a failed
    /// handshake removes the contact so it is not replayed on restart.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::PeerConnected {
                address, protocol, ..
            } => {
                self.insert(*protocol, &address.uri());
            }
            Event::PeerDisconnected {
                address,
                protocol,
                cause,
                ..
            } => match cause {
                DisconnectCause::SessionClosure | DisconnectCause::NetworkShutdown => {}
                DisconnectCause::HandshakeFailure => {
                    self.remove(*protocol, &address.uri());
                }
            },
            _ => {}
        }
    }

    /// Subscribe the cache to session events.
    pub fn subscribe(self: &Arc<Self>, publisher: &EventPublisher) {
        let cache = self.clone();
        publisher.subscribe(brypt_event::EventKind::PeerConnected, move |event| {
            cache.apply(event);
        });
        let cache = self.clone();
        publisher.subscribe(brypt_event::EventKind::PeerDisconnected, move |event| {
            cache.apply(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use brypt_identifier::NodeIdentifier;

    use super::*;

    fn target(port: u16) -> String {
        format!("tcp://127.0.0.1:{port}")
    }

    fn cache_at(dir: &tempfile::TempDir) -> BootstrapCache {
        BootstrapCache::new(&dir.path().join("peers.json"), &[])
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = BootstrapCache::new(
            &dir.path().join("peers.json"),
            &[(Protocol::Tcp, target(35216))],
        );
        cache.initialize();
        assert!(cache.contains(Protocol::Tcp, &target(35216)));
    }

    #[test]
    fn test_flush_and_cold_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");

        let cache = BootstrapCache::new(&path, &[]);
        cache.initialize();
        cache.insert(Protocol::Tcp, &target(35216));
        cache.insert(Protocol::LoRa, "lora://915:71");
        cache.flush().expect("flush");

        let reloaded = BootstrapCache::new(&path, &[]);
        reloaded.initialize();
        assert!(reloaded.contains(Protocol::Tcp, &target(35216)));
        assert_eq!(reloaded.bootstraps(Protocol::LoRa), vec!["lora://915:71"]);
    }

    #[test]
    fn test_flush_skips_when_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_at(&dir);
        cache.initialize();
        // Nothing changed, so no file appears.
        cache.flush().expect("flush");
        assert!(!dir.path().join("peers.json").exists());
    }

    #[test]
    fn test_insert_deduplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_at(&dir);
        cache.insert(Protocol::Tcp, &target(35216));
        cache.insert(Protocol::Tcp, &target(35216));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_unknown_protocol_entries_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        std::fs::write(
            &path,
            r#"[
                { "protocol": "udp", "bootstraps": [{ "target": "udp://1.2.3.4:1" }] },
                { "protocol": "tcp", "bootstraps": [{ "target": "tcp://127.0.0.1:35216" }] }
            ]"#,
        )
        .expect("write");

        let cache = BootstrapCache::new(&path, &[]);
        cache.initialize();
        assert_eq!(cache.count(), 1);
        assert!(cache.contains(Protocol::Tcp, &target(35216)));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        std::fs::write(&path, "not json at all").expect("write");

        let cache = BootstrapCache::new(&path, &[(Protocol::Tcp, target(1))]);
        cache.initialize();
        assert!(cache.contains(Protocol::Tcp, &target(1)));
    }

    #[test]
    fn test_session_events_drive_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_at(&dir);
        let identifier = NodeIdentifier::generate().expect("identifier");
        let address = RemoteAddress::from_uri(&target(35216)).expect("address");

        cache.apply(&Event::PeerConnected {
            identifier: identifier.clone(),
            address: address.clone(),
            protocol: Protocol::Tcp,
        });
        assert!(cache.contains(Protocol::Tcp, &target(35216)));

        // An orderly departure keeps the contact for reconnection.
        cache.apply(&Event::PeerDisconnected {
            identifier: identifier.clone(),
            address: address.clone(),
            protocol: Protocol::Tcp,
            cause: DisconnectCause::SessionClosure,
        });
        assert!(cache.contains(Protocol::Tcp, &target(35216)));

        // A failed handshake drops it.
        cache.apply(&Event::PeerDisconnected {
            identifier,
            address,
            protocol: Protocol::Tcp,
            cause: DisconnectCause::HandshakeFailure,
        });
        assert!(!cache.contains(Protocol::Tcp, &target(35216)));
    }

    #[test]
    fn test_oversized_file_rejected_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        std::fs::write(&path, vec![b' '; MAX_FILE_SIZE + 1]).expect("write");

        let cache = BootstrapCache::new(&path, &[(Protocol::Tcp, target(1))]);
        cache.initialize();
        // Fallback to defaults, oversized content ignored.
        assert!(cache.contains(Protocol::Tcp, &target(1)));
    }
}
