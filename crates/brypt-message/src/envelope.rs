//! Message envelope construction, packing, and validation.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use brypt_identifier::NodeIdentifier;
use brypt_types::TrackerKey;

use crate::route::Path;
use crate::{MessageError, Result, EOT, ETX, SOH, US};

/// Maximum payload size an envelope can carry.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 16;

/// Authentication tag size: the BLAKE3 keyed-hash output.
pub const TAG_SIZE: usize = 32;

/// Destination token for a cluster-wide parcel.
const CLUSTER_TOKEN: &str = "cluster";

/// Destination token for a network-wide parcel.
const NETWORK_TOKEN: &str = "network";

/// Extension marker for the route path.
const ROUTE_MARKER: u8 = b'R';

/// Extension marker for a response status code.
const STATUS_MARKER: u8 = b'S';

/// The logical destination of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Destination {
    /// A single node, addressed by identifier.
    Unicast(NodeIdentifier),
    /// Every peer currently authorized to the sender.
    Cluster,
    /// Every reachable node.
    Network,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Unicast(id) => f.write_str(id.network_string()),
            Destination::Cluster => f.write_str(CLUSTER_TOKEN),
            Destination::Network => f.write_str(NETWORK_TOKEN),
        }
    }
}

/// The command a parcel participates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    Connect,
    Election,
    Information,
    Query,
}

impl CommandType {
    fn to_wire(self) -> u8 {
        match self {
            CommandType::Connect => 0,
            CommandType::Election => 1,
            CommandType::Information => 2,
            CommandType::Query => 3,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CommandType::Connect),
            1 => Ok(CommandType::Election),
            2 => Ok(CommandType::Information),
            3 => Ok(CommandType::Query),
            other => Err(MessageError::MalformedMessage(format!(
                "unknown command type {other}"
            ))),
        }
    }
}

/// An optional response status riding the extensions region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
}

/// The outcome of validating a packed envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationVerdict {
    Success,
    /// The chunk stream does not parse.
    DecodeError,
    /// The authentication tag does not match the packed bytes.
    BadAuth,
    /// The nonce does not exceed the last nonce seen from the peer.
    NonceRegression,
    /// The source identifier is malformed or not allowed.
    UnknownSource,
    /// The route fails the path grammar.
    RouteInvalid,
}

/// A validated request or response parcel.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEnvelope {
    source: NodeIdentifier,
    destination: Destination,
    await_token: Option<TrackerKey>,
    route: Path,
    command: CommandType,
    phase: u8,
    payload: Vec<u8>,
    nonce: u32,
    timestamp: u64,
    status: Option<StatusCode>,
    tag: Option<[u8; TAG_SIZE]>,
}

impl MessageEnvelope {
    /// Start building a new envelope.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn source(&self) -> &NodeIdentifier {
        &self.source
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn await_token(&self) -> Option<&TrackerKey> {
        self.await_token.as_ref()
    }

    pub fn route(&self) -> &Path {
        &self.route
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Unix timestamp in milliseconds at build time.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Whether an authentication tag was attached at build time.
    pub fn is_signed(&self) -> bool {
        self.tag.is_some()
    }

    /// Serialize to the chunked wire format.
    pub fn pack(&self) -> Vec<u8> {
        let mut buffer = self.pack_signed_region();
        if let Some(tag) = &self.tag {
            buffer.extend_from_slice(tag);
        }
        buffer
    }

    /// Every packed byte the tag covers: the chunk stream through `EOT`.
    fn pack_signed_region(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(128 + self.payload.len());
        buffer.push(SOH);
        pack_chunk(&mut buffer, self.source.network_string().as_bytes());
        pack_chunk(&mut buffer, self.destination.to_string().as_bytes());
        match &self.await_token {
            Some(token) => pack_chunk(&mut buffer, hex::encode(token).as_bytes()),
            None => pack_chunk(&mut buffer, &[]),
        }
        pack_chunk(&mut buffer, self.command.to_wire().to_string().as_bytes());
        pack_chunk(&mut buffer, self.phase.to_string().as_bytes());
        pack_chunk(&mut buffer, self.nonce.to_string().as_bytes());
        pack_chunk(&mut buffer, self.payload.len().to_string().as_bytes());
        pack_chunk(&mut buffer, &self.payload);
        pack_chunk(&mut buffer, self.timestamp.to_string().as_bytes());
        let mut route_extension = vec![ROUTE_MARKER];
        route_extension.extend_from_slice(self.route.to_string().as_bytes());
        pack_chunk(&mut buffer, &route_extension);
        if let Some(StatusCode(code)) = self.status {
            let mut extension = vec![STATUS_MARKER];
            extension.extend_from_slice(code.to_string().as_bytes());
            pack_chunk(&mut buffer, &extension);
        }
        buffer.push(EOT);
        buffer
    }

    /// Parse the chunked wire format.
    pub fn unpack(buffer: &[u8]) -> Result<Self> {
        let mut reader = ChunkReader::new(buffer)?;

        let source_text = reader.read_text_chunk()?;
        let source = NodeIdentifier::from_network_string(source_text)
            .map_err(|e| MessageError::SourceInvalid(e.to_string()))?;

        let destination_text = reader.read_text_chunk()?.to_string();
        let await_text = reader.read_text_chunk()?.to_string();
        let command = CommandType::from_wire(reader.read_number::<u8>()?)?;
        let phase = reader.read_number::<u8>()?;
        let nonce = reader.read_number::<u32>()?;
        let size = reader.read_number::<usize>()?;
        if size > MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload = reader.read_sized_chunk(size)?.to_vec();
        let timestamp = reader.read_number::<u64>()?;

        let mut route = None;
        let mut status = None;
        while !reader.at_end()? {
            let extension = reader.read_chunk()?;
            match extension.first() {
                Some(&ROUTE_MARKER) => {
                    let text = std::str::from_utf8(&extension[1..]).map_err(|_| {
                        MessageError::RouteInvalid("route is not utf-8".to_string())
                    })?;
                    route = Some(Path::parse(text)?);
                }
                Some(&STATUS_MARKER) => {
                    let code = parse_number::<u16>(&extension[1..])?;
                    status = Some(StatusCode(code));
                }
                _ => {
                    // Unrecognized extensions are tolerated for forward
                    // compatibility; the tag still covers their bytes.
                }
            }
        }
        let route = route.ok_or_else(|| MessageError::RouteInvalid("missing route".to_string()))?;
        let tag = reader.read_tag()?;

        // Legacy senders embed the await token as a ";<hex>" suffix on the
        // destination; migrate it into the await slot.
        let (destination_text, suffix) = match destination_text.split_once(';') {
            Some((token, suffix)) => (token.to_string(), Some(suffix.to_string())),
            None => (destination_text, None),
        };

        let destination = match destination_text.as_str() {
            CLUSTER_TOKEN => Destination::Cluster,
            NETWORK_TOKEN => Destination::Network,
            other => Destination::Unicast(
                NodeIdentifier::from_network_string(other)
                    .map_err(|e| MessageError::MalformedMessage(e.to_string()))?,
            ),
        };

        let await_source = if await_text.is_empty() {
            suffix
        } else {
            Some(await_text)
        };
        let await_token = await_source.map(|text| parse_token(&text)).transpose()?;

        Ok(Self {
            source,
            destination,
            await_token,
            route,
            command,
            phase,
            payload,
            nonce,
            timestamp,
            status,
            tag,
        })
    }

}

/// Unpack and validate a received buffer in one pass.
///
/// The tag is recomputed over the received bytes themselves (never a
/// canonical re-encoding) so any transmission corruption fails closed.
/// Parse failures map onto the corresponding verdicts rather than
/// propagating, so callers drop bad traffic uniformly.
pub fn validate(
    buffer: &[u8],
    key: Option<&[u8; 32]>,
    last_nonce: Option<u32>,
) -> (ValidationVerdict, Option<MessageEnvelope>) {
    let envelope = match MessageEnvelope::unpack(buffer) {
        Ok(envelope) => envelope,
        Err(MessageError::SourceInvalid(_)) => return (ValidationVerdict::UnknownSource, None),
        Err(MessageError::RouteInvalid(_)) => return (ValidationVerdict::RouteInvalid, None),
        Err(_) => return (ValidationVerdict::DecodeError, None),
    };

    if let Some(key) = key {
        if !envelope.is_signed() {
            return (ValidationVerdict::BadAuth, None);
        }
        let split = buffer.len() - TAG_SIZE;
        let expected = blake3::keyed_hash(key, &buffer[..split]);
        if !constant_time_eq(expected.as_bytes(), &buffer[split..]) {
            return (ValidationVerdict::BadAuth, None);
        }
    }

    if let Some(last) = last_nonce {
        if envelope.nonce <= last {
            return (ValidationVerdict::NonceRegression, None);
        }
    }

    (ValidationVerdict::Success, Some(envelope))
}

/// Incrementally assembles a [`MessageEnvelope`].
#[derive(Default)]
pub struct MessageBuilder {
    source: Option<NodeIdentifier>,
    destination: Option<Destination>,
    await_token: Option<TrackerKey>,
    route: Option<String>,
    command: Option<(CommandType, u8)>,
    payload: Vec<u8>,
    nonce: u32,
    status: Option<StatusCode>,
    signing_key: Option<[u8; 32]>,
}

impl MessageBuilder {
    pub fn source(mut self, source: NodeIdentifier) -> Self {
        self.source = Some(source);
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Correlate this parcel with an awaitable request.
    pub fn bind_awaitable(mut self, token: TrackerKey) -> Self {
        self.await_token = Some(token);
        self
    }

    pub fn route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    pub fn command(mut self, command: CommandType, phase: u8) -> Self {
        self.command = Some((command, phase));
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach the session key; the built envelope carries a tag over its
    /// packed form. Omitting the key builds an unsigned envelope usable
    /// only for handshake traffic.
    pub fn signing_key(mut self, key: [u8; 32]) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Build, enforcing every envelope invariant. Construction never
    /// partially succeeds: an error leaves no envelope behind.
    pub fn validated_build(self) -> Result<MessageEnvelope> {
        let source = self.source.ok_or(MessageError::MissingField("source"))?;
        if !source.is_valid() {
            return Err(MessageError::SourceInvalid(
                "source identifier is not allowed".to_string(),
            ));
        }
        let destination = self
            .destination
            .ok_or(MessageError::MissingField("destination"))?;
        if let Destination::Unicast(id) = &destination {
            if !id.is_valid() {
                return Err(MessageError::MalformedMessage(
                    "destination identifier is not allowed".to_string(),
                ));
            }
        }
        let route_text = self.route.ok_or(MessageError::MissingField("route"))?;
        let route = Path::parse(&route_text)?;
        let (command, phase) = self.command.ok_or(MessageError::MissingField("command"))?;

        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| MessageError::MalformedMessage(format!("system time error: {e}")))?
            .as_millis() as u64;

        let mut envelope = MessageEnvelope {
            source,
            destination,
            await_token: self.await_token,
            route,
            command,
            phase,
            payload: self.payload,
            nonce: self.nonce,
            timestamp,
            status: self.status,
            tag: None,
        };

        if let Some(key) = self.signing_key {
            let tag = blake3::keyed_hash(&key, &envelope.pack_signed_region());
            envelope.tag = Some(*tag.as_bytes());
        }

        Ok(envelope)
    }
}

fn pack_chunk(buffer: &mut Vec<u8>, content: &[u8]) {
    buffer.extend_from_slice(content);
    buffer.push(ETX);
    buffer.push(US);
}

fn parse_number<T: std::str::FromStr>(bytes: &[u8]) -> Result<T> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| MessageError::MalformedMessage("numeric chunk does not parse".to_string()))
}

fn parse_token(text: &str) -> Result<TrackerKey> {
    let bytes = hex::decode(text)
        .map_err(|e| MessageError::MalformedMessage(format!("await token hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| MessageError::MalformedMessage("await token length".to_string()))
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Left-to-right cursor over the chunk stream.
struct ChunkReader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(buffer: &'a [u8]) -> Result<Self> {
        if buffer.first() != Some(&SOH) {
            return Err(MessageError::MalformedMessage(
                "missing start byte".to_string(),
            ));
        }
        Ok(Self { buffer, cursor: 1 })
    }

    fn read_chunk(&mut self) -> Result<&'a [u8]> {
        let remaining = &self.buffer[self.cursor..];
        let end = remaining
            .windows(2)
            .position(|pair| pair == [ETX, US])
            .ok_or_else(|| MessageError::MalformedMessage("unterminated chunk".to_string()))?;
        self.cursor += end + 2;
        Ok(&remaining[..end])
    }

    /// Read a chunk whose content length is already known, so content
    /// bytes that collide with the separators are passed through.
    fn read_sized_chunk(&mut self, size: usize) -> Result<&'a [u8]> {
        let remaining = &self.buffer[self.cursor..];
        if remaining.len() < size + 2 || remaining[size] != ETX || remaining[size + 1] != US {
            return Err(MessageError::MalformedMessage(
                "payload chunk does not match its declared size".to_string(),
            ));
        }
        self.cursor += size + 2;
        Ok(&remaining[..size])
    }

    fn read_text_chunk(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.read_chunk()?)
            .map_err(|e| MessageError::MalformedMessage(format!("chunk is not utf-8: {e}")))
    }

    fn read_number<T: std::str::FromStr>(&mut self) -> Result<T> {
        parse_number(self.read_chunk()?)
    }

    fn at_end(&self) -> Result<bool> {
        match self.buffer.get(self.cursor) {
            Some(&EOT) => Ok(true),
            Some(_) => Ok(false),
            None => Err(MessageError::MalformedMessage(
                "missing end byte".to_string(),
            )),
        }
    }

    fn read_tag(&mut self) -> Result<Option<[u8; TAG_SIZE]>> {
        // Caller has observed EOT at the cursor.
        let trailer = &self.buffer[self.cursor + 1..];
        match trailer.len() {
            0 => Ok(None),
            TAG_SIZE => {
                let mut tag = [0u8; TAG_SIZE];
                tag.copy_from_slice(trailer);
                Ok(Some(tag))
            }
            other => Err(MessageError::MalformedMessage(format!(
                "unexpected trailer length {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn session_key() -> [u8; 32] {
        [0x42u8; 32]
    }

    fn build_signed(nonce: u32) -> MessageEnvelope {
        let source = NodeIdentifier::generate().expect("source");
        let destination = NodeIdentifier::generate().expect("destination");
        MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Unicast(destination))
            .route("/query/status")
            .command(CommandType::Query, 0)
            .payload(b"ping".to_vec())
            .nonce(nonce)
            .signing_key(session_key())
            .validated_build()
            .expect("build")
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let envelope = build_signed(1);
        let packed = envelope.pack();
        let restored = MessageEnvelope::unpack(&packed).expect("unpack");
        assert_eq!(envelope, restored);
    }

    #[test]
    fn test_validate_success_with_session_key() {
        let envelope = build_signed(5);
        let (verdict, restored) = validate(&envelope.pack(), Some(&session_key()), Some(4));
        assert_eq!(verdict, ValidationVerdict::Success);
        assert_eq!(restored.expect("envelope"), envelope);
    }

    #[test]
    fn test_any_bit_flip_fails_validation() {
        let envelope = build_signed(1);
        let packed = envelope.pack();

        let mut rng = rand::thread_rng();
        for _ in 0..256 {
            let mut corrupted = packed.clone();
            let index = rng.gen_range(0..corrupted.len());
            let bit = 1u8 << rng.gen_range(0..8);
            corrupted[index] ^= bit;
            let (verdict, _) = validate(&corrupted, Some(&session_key()), None);
            assert_ne!(
                verdict,
                ValidationVerdict::Success,
                "flip at byte {index} bit {bit:#x} survived"
            );
        }
    }

    #[test]
    fn test_tag_flip_is_bad_auth() {
        let envelope = build_signed(1);
        let mut packed = envelope.pack();
        let last = packed.len() - 1;
        packed[last] ^= 0x01;
        let (verdict, _) = validate(&packed, Some(&session_key()), None);
        assert_eq!(verdict, ValidationVerdict::BadAuth);
    }

    #[test]
    fn test_nonce_regression_rejected() {
        let envelope = build_signed(4);
        let (verdict, _) = validate(&envelope.pack(), Some(&session_key()), Some(5));
        assert_eq!(verdict, ValidationVerdict::NonceRegression);

        let (verdict, _) = validate(&envelope.pack(), Some(&session_key()), Some(4));
        assert_eq!(verdict, ValidationVerdict::NonceRegression);
    }

    #[test]
    fn test_unsigned_envelope_rejected_under_session() {
        let source = NodeIdentifier::generate().expect("source");
        let envelope = MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Cluster)
            .route("/exchange")
            .command(CommandType::Connect, 0)
            .validated_build()
            .expect("build");
        assert!(!envelope.is_signed());

        let (verdict, _) = validate(&envelope.pack(), Some(&session_key()), None);
        assert_eq!(verdict, ValidationVerdict::BadAuth);

        // Without a session key the unsigned form is usable for handshakes.
        let (verdict, _) = validate(&envelope.pack(), None, None);
        assert_eq!(verdict, ValidationVerdict::Success);
    }

    #[test]
    fn test_legacy_await_suffix_migrates() {
        let envelope = build_signed(1);
        let token: TrackerKey = [0xAB; 16];

        // Rewrite the destination chunk to carry the legacy suffix. The
        // tag no longer matches, so validate without a key.
        let packed = envelope.pack();
        let destination = envelope.destination().to_string();
        let legacy = format!("{destination};{}", hex::encode(token));
        let needle = [destination.as_bytes(), &[ETX, US]].concat();
        let replacement = [legacy.as_bytes(), &[ETX, US]].concat();
        let position = packed
            .windows(needle.len())
            .position(|window| window == needle)
            .expect("destination chunk");
        let mut rewritten = packed[..position].to_vec();
        rewritten.extend_from_slice(&replacement);
        rewritten.extend_from_slice(&packed[position + needle.len()..]);

        let restored = MessageEnvelope::unpack(&rewritten).expect("unpack");
        assert_eq!(restored.await_token(), Some(&token));
        assert_eq!(restored.destination(), envelope.destination());
    }

    #[test]
    fn test_bound_awaitable_round_trips() {
        let source = NodeIdentifier::generate().expect("source");
        let token: TrackerKey = [0x11; 16];
        let envelope = MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Network)
            .route("/query")
            .command(CommandType::Query, 0)
            .bind_awaitable(token)
            .signing_key(session_key())
            .validated_build()
            .expect("build");

        let restored = MessageEnvelope::unpack(&envelope.pack()).expect("unpack");
        assert_eq!(restored.await_token(), Some(&token));
    }

    #[test]
    fn test_payload_with_separator_bytes() {
        let source = NodeIdentifier::generate().expect("source");
        let payload = vec![SOH, ETX, US, EOT, ETX, US, 0xFF];
        let envelope = MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Cluster)
            .route("/query")
            .command(CommandType::Query, 1)
            .payload(payload.clone())
            .signing_key(session_key())
            .validated_build()
            .expect("build");

        let restored = MessageEnvelope::unpack(&envelope.pack()).expect("unpack");
        assert_eq!(restored.payload(), payload.as_slice());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let source = NodeIdentifier::generate().expect("source");
        let result = MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Cluster)
            .route("/query")
            .command(CommandType::Query, 0)
            .payload(vec![0u8; MAX_PAYLOAD_SIZE + 1])
            .validated_build();
        assert!(matches!(result, Err(MessageError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let result = MessageEnvelope::builder()
            .destination(Destination::Cluster)
            .route("/query")
            .command(CommandType::Query, 0)
            .validated_build();
        assert!(matches!(result, Err(MessageError::MissingField("source"))));
    }

    #[test]
    fn test_status_extension_round_trips() {
        let source = NodeIdentifier::generate().expect("source");
        let envelope = MessageEnvelope::builder()
            .source(source)
            .destination(Destination::Cluster)
            .route("/query")
            .command(CommandType::Query, 1)
            .status(StatusCode::OK)
            .signing_key(session_key())
            .validated_build()
            .expect("build");

        let restored = MessageEnvelope::unpack(&envelope.pack()).expect("unpack");
        assert_eq!(restored.status(), Some(StatusCode::OK));
    }

    #[test]
    fn test_truncated_buffer_is_decode_error() {
        let envelope = build_signed(1);
        let packed = envelope.pack();
        let (verdict, _) = validate(&packed[..packed.len() / 2], Some(&session_key()), None);
        assert!(matches!(
            verdict,
            ValidationVerdict::DecodeError | ValidationVerdict::BadAuth
        ));
    }
}
