//! Reserved identifier values.
//!
//! Reserved payloads are never assigned to a node. The generator resamples
//! when it lands on one, and decoding rejects them outright.

use crate::PAYLOAD_SIZE;

/// The all-zero payload, reserved as the unassigned marker.
pub const UNASSIGNED: [u8; PAYLOAD_SIZE] = [0u8; PAYLOAD_SIZE];

/// Whether a payload is reserved and therefore not assignable.
pub fn is_reserved(payload: &[u8; PAYLOAD_SIZE]) -> bool {
    *payload == UNASSIGNED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned_is_reserved() {
        assert!(is_reserved(&UNASSIGNED));
    }

    #[test]
    fn test_nonzero_payload_is_not_reserved() {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[15] = 1;
        assert!(!is_reserved(&payload));
    }
}
