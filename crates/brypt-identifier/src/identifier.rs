//! The node identifier type and its representations.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::reserved;
use crate::{IdentifierError, Result};

/// Size of the identifier payload in bytes (128 bits).
pub const PAYLOAD_SIZE: usize = 16;

/// Size of the integrity checksum appended to the payload.
pub const CHECKSUM_SIZE: usize = 4;

/// Metadata prefix of the network representation: `bry` is reserved for
/// the Brypt network, `0` is the identifier version.
pub const METADATA: &str = "bry0:";

/// Checksum derivation context. The checksum hash is domain-separated
/// from the payload hash so the two can never be confused.
const CHECKSUM_CONTEXT: &str = "brypt v0 identifier-checksum";

/// A validated node identifier.
///
/// Identifiers are immutable and cheap to clone. Equality follows the
/// network's rules: two identifiers are equal only when both are valid
/// and their payloads are byte-identical, so the invalid sentinel
/// compares unequal to everything, including itself.
#[derive(Clone, Debug)]
pub struct NodeIdentifier {
    payload: [u8; PAYLOAD_SIZE],
    network: String,
    valid: bool,
}

impl NodeIdentifier {
    /// Generate a fresh identifier from OS entropy.
    ///
    /// The random source bytes are diffused through the BLAKE3 XOF and
    /// resampled if the result lands on a reserved value.
    pub fn generate() -> Result<Self> {
        let mut payload = [0u8; PAYLOAD_SIZE];
        loop {
            let mut source = [0u8; PAYLOAD_SIZE];
            OsRng
                .try_fill_bytes(&mut source)
                .map_err(|e| IdentifierError::Generation(e.to_string()))?;

            let mut hasher = blake3::Hasher::new();
            hasher.update(&source);
            hasher.finalize_xof().fill(&mut payload);

            if !reserved::is_reserved(&payload) {
                break;
            }
        }

        Ok(Self {
            network: encode(&payload),
            payload,
            valid: true,
        })
    }

    /// Construct from a raw payload, rejecting reserved values.
    pub fn from_payload(payload: [u8; PAYLOAD_SIZE]) -> Result<Self> {
        if reserved::is_reserved(&payload) {
            return Err(IdentifierError::Malformed(
                "payload is a reserved identifier".to_string(),
            ));
        }
        Ok(Self {
            network: encode(&payload),
            payload,
            valid: true,
        })
    }

    /// Decode the `bry0:<base58>` network representation.
    pub fn from_network_string(representation: &str) -> Result<Self> {
        let encoded = representation
            .strip_prefix(METADATA)
            .ok_or_else(|| IdentifierError::Malformed("missing metadata prefix".to_string()))?;

        let decoded = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| IdentifierError::Malformed(format!("base58 decode failed: {e}")))?;

        if decoded.len() != PAYLOAD_SIZE + CHECKSUM_SIZE {
            return Err(IdentifierError::Malformed(format!(
                "decoded length {} does not match expected {}",
                decoded.len(),
                PAYLOAD_SIZE + CHECKSUM_SIZE,
            )));
        }

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&decoded[..PAYLOAD_SIZE]);

        let expected = checksum(&payload);
        if !constant_time_eq(&expected, &decoded[PAYLOAD_SIZE..]) {
            return Err(IdentifierError::Malformed("checksum mismatch".to_string()));
        }

        Self::from_payload(payload)
    }

    /// The sentinel identifier, unequal to every identifier including
    /// itself. Used where a slot must exist before resolution completes.
    pub fn unknown() -> Self {
        Self {
            payload: [0u8; PAYLOAD_SIZE],
            network: String::new(),
            valid: false,
        }
    }

    /// Whether this identifier was produced by a successful generate or
    /// decode.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The raw 128-bit payload.
    pub fn payload(&self) -> &[u8; PAYLOAD_SIZE] {
        &self.payload
    }

    /// The `bry0:<base58>` network representation.
    pub fn network_string(&self) -> &str {
        &self.network
    }
}

fn encode(payload: &[u8; PAYLOAD_SIZE]) -> String {
    let mut buffer = [0u8; PAYLOAD_SIZE + CHECKSUM_SIZE];
    buffer[..PAYLOAD_SIZE].copy_from_slice(payload);
    buffer[PAYLOAD_SIZE..].copy_from_slice(&checksum(payload));

    let mut representation = String::from(METADATA);
    representation.push_str(&bs58::encode(&buffer).into_string());
    representation
}

fn checksum(payload: &[u8; PAYLOAD_SIZE]) -> [u8; CHECKSUM_SIZE] {
    let mut digest = [0u8; CHECKSUM_SIZE];
    let mut hasher = blake3::Hasher::new_derive_key(CHECKSUM_CONTEXT);
    hasher.update(payload);
    hasher.finalize_xof().fill(&mut digest);
    digest
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    lhs.iter()
        .zip(rhs.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

impl PartialEq for NodeIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.valid && other.valid && self.payload == other.payload
    }
}

// Invalid sentinels never enter keyed collections, so the non-reflexive
// sentinel comparison does not affect map behavior.
impl Eq for NodeIdentifier {}

impl Hash for NodeIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.valid.hash(state);
        self.payload.hash(state);
    }
}

impl PartialOrd for NodeIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.valid
            .cmp(&other.valid)
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            f.write_str(&self.network)
        } else {
            f.write_str("[unknown identifier]")
        }
    }
}

impl Serialize for NodeIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.network)
    }
}

impl<'de> Deserialize<'de> for NodeIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let representation = String::deserialize(deserializer)?;
        NodeIdentifier::from_network_string(&representation).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_valid_identifier() {
        let identifier = NodeIdentifier::generate().expect("generate");
        assert!(identifier.is_valid());
        assert!(identifier.network_string().starts_with(METADATA));
    }

    #[test]
    fn test_network_string_roundtrip() {
        let identifier = NodeIdentifier::generate().expect("generate");
        let decoded =
            NodeIdentifier::from_network_string(identifier.network_string()).expect("decode");
        assert_eq!(identifier, decoded);
        assert_eq!(identifier.network_string(), decoded.network_string());
    }

    #[test]
    fn test_network_string_size_bounds() {
        for _ in 0..64 {
            let identifier = NodeIdentifier::generate().expect("generate");
            let size = identifier.network_string().len();
            assert!((31..=33).contains(&size), "unexpected size {size}");
        }
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let identifier = NodeIdentifier::generate().expect("generate");
        let stripped = identifier
            .network_string()
            .strip_prefix(METADATA)
            .expect("prefix");
        assert!(NodeIdentifier::from_network_string(stripped).is_err());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let identifier = NodeIdentifier::generate().expect("generate");
        let mut corrupted: Vec<char> = identifier.network_string().chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == '2' { '3' } else { '2' };
        let corrupted: String = corrupted.into_iter().collect();
        assert!(NodeIdentifier::from_network_string(&corrupted).is_err());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let truncated = format!("{METADATA}{}", bs58::encode(&[0u8; 8]).into_string());
        assert!(NodeIdentifier::from_network_string(&truncated).is_err());
    }

    #[test]
    fn test_reserved_payload_rejected() {
        assert!(NodeIdentifier::from_payload([0u8; PAYLOAD_SIZE]).is_err());
    }

    #[test]
    fn test_unknown_never_compares_equal() {
        let left = NodeIdentifier::unknown();
        let right = NodeIdentifier::unknown();
        assert_ne!(left, right);
        assert_ne!(left, left.clone());

        let valid = NodeIdentifier::generate().expect("generate");
        assert_ne!(left, valid);
    }

    #[test]
    fn test_ordering_places_unknown_first() {
        let unknown = NodeIdentifier::unknown();
        let valid = NodeIdentifier::generate().expect("generate");
        assert!(unknown < valid);
    }

    #[test]
    fn test_serde_string_form() {
        let identifier = NodeIdentifier::generate().expect("generate");
        let json = serde_json::to_string(&identifier).expect("serialize");
        let restored: NodeIdentifier = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(identifier, restored);
    }
}
