//! The handshake synchronizer driving the session security exchange.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::cipher::{CipherPackage, KEY_SIZE};
use crate::{contexts, Result, SecurityError};

/// Frame markers, one per round.
const INITIATOR_HELLO: u8 = 0x01;
const RESPONDER_HELLO: u8 = 0x02;
const INITIATOR_CONFIRMATION: u8 = 0x03;

/// MAC size in a hello or confirmation frame.
const MAC_SIZE: usize = 32;

/// Which side of the exchange a synchronizer drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// The externally visible progress of a synchronizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SynchronizerStatus {
    /// More rounds are required.
    Processing,
    /// The exchange completed; [`HandshakeSynchronizer::finalize`] will
    /// yield the cipher package.
    Ready,
    /// The exchange failed and cannot be resumed.
    Error,
}

enum Stage {
    /// Initiator: hello not yet produced. Responder: awaiting hello.
    Fresh,
    /// Initiator: awaiting the responder hello.
    AwaitResponderHello,
    /// Responder: awaiting the initiator confirmation.
    AwaitConfirmation,
    Complete,
    Failed,
}

struct KeySchedule {
    local: [u8; KEY_SIZE],
    remote: [u8; KEY_SIZE],
    tag: [u8; KEY_SIZE],
    local_confirmation: [u8; KEY_SIZE],
    remote_confirmation: [u8; KEY_SIZE],
}

/// Drives one security exchange from first contact to an authenticated
/// session.
///
/// The synchronizer consumes handshake frames and produces the bytes the
/// caller must schedule back through the originating endpoint. It holds
/// the ephemeral secret only as long as the exchange is in flight.
pub struct HandshakeSynchronizer {
    role: HandshakeRole,
    stage: Stage,
    identifier: String,
    peer_identifier: Option<String>,
    secret: Option<StaticSecret>,
    transcript: Vec<u8>,
    schedule: Option<KeySchedule>,
}

impl HandshakeSynchronizer {
    /// Create the initiating side, announcing the local identifier.
    pub fn initiator(identifier: &str) -> Self {
        Self::new(HandshakeRole::Initiator, identifier)
    }

    /// Create the responding side, announcing the local identifier.
    pub fn responder(identifier: &str) -> Self {
        Self::new(HandshakeRole::Responder, identifier)
    }

    fn new(role: HandshakeRole, identifier: &str) -> Self {
        Self {
            role,
            stage: Stage::Fresh,
            identifier: identifier.to_string(),
            peer_identifier: None,
            secret: Some(StaticSecret::random_from_rng(OsRng)),
            transcript: Vec::new(),
            schedule: None,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn status(&self) -> SynchronizerStatus {
        match self.stage {
            Stage::Complete => SynchronizerStatus::Ready,
            Stage::Failed => SynchronizerStatus::Error,
            _ => SynchronizerStatus::Processing,
        }
    }

    /// The identifier the remote announced, once its hello has arrived.
    pub fn peer_identifier(&self) -> Option<&str> {
        self.peer_identifier.as_deref()
    }

    /// Produce the opening bytes of the exchange.
    ///
    /// Only the initiator emits anything; the responder stays quiet until
    /// the first frame arrives through [`HandshakeSynchronizer::synchronize`].
    pub fn initialize(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.stage, Stage::Fresh) {
            return Err(SecurityError::InvalidState);
        }
        match self.role {
            HandshakeRole::Initiator => {
                let frame = self.hello_frame(INITIATOR_HELLO)?;
                self.transcript.extend_from_slice(&frame);
                self.stage = Stage::AwaitResponderHello;
                Ok(frame)
            }
            HandshakeRole::Responder => Ok(Vec::new()),
        }
    }

    /// Consume one received frame and produce the bytes to send back.
    ///
    /// An empty output with status `Ready` means the exchange finished on
    /// this round; an error poisons the synchronizer.
    pub fn synchronize(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let result = self.advance(frame);
        if result.is_err() {
            self.stage = Stage::Failed;
            self.secret = None;
            self.schedule = None;
        }
        result
    }

    /// Yield the cipher package of a completed exchange.
    pub fn finalize(mut self) -> Result<CipherPackage> {
        if !matches!(self.stage, Stage::Complete) {
            return Err(SecurityError::InvalidState);
        }
        let schedule = self.schedule.take().ok_or(SecurityError::InvalidState)?;
        Ok(CipherPackage::new(
            self.role,
            schedule.local,
            schedule.remote,
            schedule.tag,
        ))
    }

    fn advance(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        match (&self.role, &self.stage) {
            (HandshakeRole::Responder, Stage::Fresh) => self.accept_initiator_hello(frame),
            (HandshakeRole::Initiator, Stage::AwaitResponderHello) => {
                self.accept_responder_hello(frame)
            }
            (HandshakeRole::Responder, Stage::AwaitConfirmation) => self.accept_confirmation(frame),
            _ => Err(SecurityError::UnexpectedFrame),
        }
    }

    fn accept_initiator_hello(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let (their_public, identifier) = parse_hello(frame, INITIATOR_HELLO)?;
        self.peer_identifier = Some(identifier);
        self.transcript.extend_from_slice(frame);

        let response = self.hello_frame(RESPONDER_HELLO)?;
        self.derive_schedule(&their_public)?;
        self.transcript.extend_from_slice(&response);

        // The responder hello carries proof of key possession over the
        // transcript up to and including its own frame.
        let schedule = self.schedule.as_ref().ok_or(SecurityError::InvalidState)?;
        let mac = blake3::keyed_hash(&schedule.local_confirmation, &self.transcript);

        let mut framed = response;
        framed.extend_from_slice(mac.as_bytes());
        self.transcript.extend_from_slice(mac.as_bytes());
        self.stage = Stage::AwaitConfirmation;
        Ok(framed)
    }

    fn accept_responder_hello(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < MAC_SIZE {
            return Err(SecurityError::MalformedFrame("short frame".to_string()));
        }
        let (hello, mac) = frame.split_at(frame.len() - MAC_SIZE);
        let (their_public, identifier) = parse_hello(hello, RESPONDER_HELLO)?;
        self.peer_identifier = Some(identifier);

        self.derive_schedule(&their_public)?;
        self.transcript.extend_from_slice(hello);

        let schedule = self.schedule.as_ref().ok_or(SecurityError::InvalidState)?;
        let expected = blake3::keyed_hash(&schedule.remote_confirmation, &self.transcript);
        if !constant_time_eq(expected.as_bytes(), mac) {
            return Err(SecurityError::KeyConfirmationFailed);
        }
        self.transcript.extend_from_slice(mac);

        let confirmation =
            blake3::keyed_hash(&schedule.local_confirmation, &self.transcript);
        let mut framed = vec![INITIATOR_CONFIRMATION];
        framed.extend_from_slice(confirmation.as_bytes());
        self.stage = Stage::Complete;
        Ok(framed)
    }

    fn accept_confirmation(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let payload = frame
            .strip_prefix(&[INITIATOR_CONFIRMATION])
            .ok_or(SecurityError::UnexpectedFrame)?;
        if payload.len() != MAC_SIZE {
            return Err(SecurityError::MalformedFrame(
                "confirmation length".to_string(),
            ));
        }

        let schedule = self.schedule.as_ref().ok_or(SecurityError::InvalidState)?;
        let expected = blake3::keyed_hash(&schedule.remote_confirmation, &self.transcript);
        if !constant_time_eq(expected.as_bytes(), payload) {
            return Err(SecurityError::KeyConfirmationFailed);
        }
        self.stage = Stage::Complete;
        Ok(Vec::new())
    }

    fn hello_frame(&self, marker: u8) -> Result<Vec<u8>> {
        let secret = self.secret.as_ref().ok_or(SecurityError::InvalidState)?;
        let public = PublicKey::from(secret);
        let identifier = self.identifier.as_bytes();
        if identifier.len() > u8::MAX as usize {
            return Err(SecurityError::MalformedFrame(
                "identifier too long".to_string(),
            ));
        }

        let mut frame = Vec::with_capacity(2 + 32 + identifier.len());
        frame.push(marker);
        frame.extend_from_slice(public.as_bytes());
        frame.push(identifier.len() as u8);
        frame.extend_from_slice(identifier);
        Ok(frame)
    }

    fn derive_schedule(&mut self, their_public: &PublicKey) -> Result<()> {
        let secret = self.secret.take().ok_or(SecurityError::InvalidState)?;
        let shared = Zeroizing::new(*secret.diffie_hellman(their_public).as_bytes());

        let root = Zeroizing::new(blake3::derive_key(contexts::SESSION_ROOT, shared.as_ref()));
        let initiator = blake3::derive_key(contexts::INITIATOR_KEY, root.as_ref());
        let responder = blake3::derive_key(contexts::RESPONDER_KEY, root.as_ref());
        let tag = blake3::derive_key(contexts::ENVELOPE_TAG_KEY, root.as_ref());
        let initiator_confirmation =
            blake3::derive_key(contexts::INITIATOR_CONFIRMATION, root.as_ref());
        let responder_confirmation =
            blake3::derive_key(contexts::RESPONDER_CONFIRMATION, root.as_ref());

        self.schedule = Some(match self.role {
            HandshakeRole::Initiator => KeySchedule {
                local: initiator,
                remote: responder,
                tag,
                local_confirmation: initiator_confirmation,
                remote_confirmation: responder_confirmation,
            },
            HandshakeRole::Responder => KeySchedule {
                local: responder,
                remote: initiator,
                tag,
                local_confirmation: responder_confirmation,
                remote_confirmation: initiator_confirmation,
            },
        });
        Ok(())
    }
}

fn parse_hello(frame: &[u8], marker: u8) -> Result<(PublicKey, String)> {
    let payload = frame
        .strip_prefix(&[marker])
        .ok_or(SecurityError::UnexpectedFrame)?;
    if payload.len() < 33 {
        return Err(SecurityError::MalformedFrame("short hello".to_string()));
    }

    let (key_bytes, rest) = payload.split_at(32);
    let mut public = [0u8; 32];
    public.copy_from_slice(key_bytes);

    let (length, identifier_bytes) = rest
        .split_first()
        .ok_or_else(|| SecurityError::MalformedFrame("missing identifier".to_string()))?;
    if identifier_bytes.len() != *length as usize {
        return Err(SecurityError::MalformedFrame(
            "identifier length mismatch".to_string(),
        ));
    }
    let identifier = String::from_utf8(identifier_bytes.to_vec())
        .map_err(|_| SecurityError::MalformedFrame("identifier is not utf-8".to_string()))?;

    Ok((PublicKey::from(public), identifier))
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange() -> (HandshakeSynchronizer, HandshakeSynchronizer, usize) {
        let mut initiator = HandshakeSynchronizer::initiator("bry0:initiator");
        let mut responder = HandshakeSynchronizer::responder("bry0:responder");
        responder.initialize().expect("responder init");

        let mut rounds = 0;
        let mut frame = initiator.initialize().expect("initiator init");
        loop {
            rounds += 1;
            frame = responder.synchronize(&frame).expect("responder round");
            if frame.is_empty() {
                break;
            }
            frame = initiator.synchronize(&frame).expect("initiator round");
            if frame.is_empty() {
                break;
            }
        }
        (initiator, responder, rounds)
    }

    #[test]
    fn test_exchange_completes_within_three_rounds() {
        let (initiator, responder, rounds) = run_exchange();
        assert!(rounds <= 3, "exchange took {rounds} rounds");
        assert_eq!(initiator.status(), SynchronizerStatus::Ready);
        assert_eq!(responder.status(), SynchronizerStatus::Ready);
    }

    #[test]
    fn test_identifiers_exchanged() {
        let (initiator, responder, _) = run_exchange();
        assert_eq!(initiator.peer_identifier(), Some("bry0:responder"));
        assert_eq!(responder.peer_identifier(), Some("bry0:initiator"));
    }

    #[test]
    fn test_cipher_packages_interoperate() {
        let (initiator, responder, _) = run_exchange();
        let mut alice = initiator.finalize().expect("initiator package");
        let bob = responder.finalize().expect("responder package");

        assert_eq!(alice.tag_key(), bob.tag_key());

        let sealed = alice.seal(b"first parcel", b"").expect("seal");
        assert_eq!(bob.open(&sealed, b"").expect("open"), b"first parcel");
    }

    #[test]
    fn test_tampered_responder_hello_fails() {
        let mut initiator = HandshakeSynchronizer::initiator("bry0:initiator");
        let mut responder = HandshakeSynchronizer::responder("bry0:responder");
        responder.initialize().expect("responder init");

        let hello = initiator.initialize().expect("initiator init");
        let mut response = responder.synchronize(&hello).expect("responder hello");
        let last = response.len() - 1;
        response[last] ^= 0x01;

        assert!(initiator.synchronize(&response).is_err());
        assert_eq!(initiator.status(), SynchronizerStatus::Error);
    }

    #[test]
    fn test_tampered_confirmation_fails() {
        let mut initiator = HandshakeSynchronizer::initiator("bry0:initiator");
        let mut responder = HandshakeSynchronizer::responder("bry0:responder");
        responder.initialize().expect("responder init");

        let hello = initiator.initialize().expect("initiator init");
        let response = responder.synchronize(&hello).expect("responder hello");
        let mut confirmation = initiator.synchronize(&response).expect("confirmation");
        confirmation[1] ^= 0xFF;

        assert!(responder.synchronize(&confirmation).is_err());
        assert_eq!(responder.status(), SynchronizerStatus::Error);
    }

    #[test]
    fn test_out_of_order_frame_rejected() {
        let mut responder = HandshakeSynchronizer::responder("bry0:responder");
        responder.initialize().expect("responder init");
        let confirmation = [INITIATOR_CONFIRMATION; 33];
        assert!(responder.synchronize(&confirmation).is_err());
    }

    #[test]
    fn test_finalize_requires_completion() {
        let initiator = HandshakeSynchronizer::initiator("bry0:initiator");
        assert!(initiator.finalize().is_err());
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut initiator = HandshakeSynchronizer::initiator("bry0:initiator");
        initiator.initialize().expect("first");
        assert!(initiator.initialize().is_err());
    }
}
