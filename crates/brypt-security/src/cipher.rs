//! Post-handshake session keys and AEAD state.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::handshake::HandshakeRole;
use crate::{Result, SecurityError};

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Session key size in bytes.
pub const KEY_SIZE: usize = 32;

/// The keys and sequence state of one authenticated session.
///
/// Directional keys prevent reflection: each side seals with its own key
/// and opens with the remote's. The sealing sequence number is carried in
/// front of each ciphertext so the two sides never need to stay in
/// lockstep over lossy links.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherPackage {
    #[zeroize(skip)]
    role: HandshakeRole,
    sealing_key: [u8; KEY_SIZE],
    opening_key: [u8; KEY_SIZE],
    tag_key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    sealed: u64,
}

impl CipherPackage {
    pub(crate) fn new(
        role: HandshakeRole,
        sealing_key: [u8; KEY_SIZE],
        opening_key: [u8; KEY_SIZE],
        tag_key: [u8; KEY_SIZE],
    ) -> Self {
        Self {
            role,
            sealing_key,
            opening_key,
            tag_key,
            sealed: 0,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// The key envelopes are tagged with. Both sides derive the same key.
    pub fn tag_key(&self) -> &[u8; KEY_SIZE] {
        &self.tag_key
    }

    /// Encrypt a payload. The output carries the sequence number followed
    /// by the ciphertext and its authentication tag.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.sealed;
        self.sealed += 1;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.sealing_key));
        let nonce_bytes = sequence_nonce(sequence);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SecurityError::AeadFailure)?;

        let mut sealed = Vec::with_capacity(8 + ciphertext.len());
        sealed.extend_from_slice(&sequence.to_le_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a payload produced by the remote's [`CipherPackage::seal`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 8 {
            return Err(SecurityError::AeadFailure);
        }
        let (sequence_bytes, ciphertext) = sealed.split_at(8);
        let sequence = u64::from_le_bytes(
            sequence_bytes
                .try_into()
                .map_err(|_| SecurityError::AeadFailure)?,
        );

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.opening_key));
        let nonce_bytes = sequence_nonce(sequence);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| SecurityError::AeadFailure)
    }
}

fn sequence_nonce(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}
