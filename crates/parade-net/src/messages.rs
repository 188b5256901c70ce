//! Collaboration message types and the envelope codec.
//!
//! Four structurally different payloads share one wire format. The sender
//! serializes the concrete payload with [`postcard`], tags the bytes with the
//! payload type name and wraps them in an envelope:
//!
//! ```text
//! [version: u8] [postcard Envelope { id, kind, sender, timestamp_ms, payload_type, payload }]
//! ```
//!
//! The receiver reads `kind`, checks that the tag agrees with it and decodes
//! exactly the one payload type selected by `kind`. All enums travel as `u8`
//! codes so an unknown value surfaces as [`DecodeError::UnrecognizedVariant`]
//! instead of a generic parse failure.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::peer::{PeerId, PeerIdError};

/// Current wire-protocol version. Prepended to every serialized envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Wire-coded enums
// ---------------------------------------------------------------------------

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident as $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant in wire-code order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The `u8` this variant travels as.
            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Resolve a wire code, rejecting values this build does not know.
            pub fn from_code(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($code => Ok($name::$variant),)+
                    value => Err(DecodeError::UnrecognizedVariant { field: $field, value }),
                }
            }

            /// Variant name.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

wire_enum! {
    /// Discriminates the payload carried by a [`Message`].
    pub enum MessageKind as "kind" {
        /// Scene entity transform change.
        EntityUpdate = 0,
        /// Shared camera perspective change.
        PerspectiveChange = 1,
        /// Parade playback command.
        ParadeControl = 2,
        /// Text chat.
        Chat = 3,
    }
}

wire_enum! {
    /// What happened to a scene entity.
    pub enum EntityAction as "entity_action" {
        Created = 0,
        Moved = 1,
        Rotated = 2,
        Scaled = 3,
        Deleted = 4,
        /// Transient highlight; never mutates entity state.
        Selected = 5,
    }
}

wire_enum! {
    /// Camera viewpoints participants can switch the shared view to.
    pub enum CameraPerspective as "perspective" {
        Ground = 0,
        Aerial = 1,
        Grandstand = 2,
        Free = 3,
    }
}

wire_enum! {
    /// Parade playback commands.
    pub enum ParadeAction as "parade_action" {
        Start = 0,
        Pause = 1,
        Stop = 2,
        Reset = 3,
        NextPhase = 4,
    }
}

impl MessageKind {
    /// Type name the payload bytes are tagged with on the wire.
    pub fn payload_type(self) -> &'static str {
        match self {
            MessageKind::EntityUpdate => "EntityUpdatePayload",
            MessageKind::PerspectiveChange => "PerspectiveChangePayload",
            MessageKind::ParadeControl => "ParadeControlPayload",
            MessageKind::Chat => "ChatPayload",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Position, orientation and scale of a scene entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Translation in scene units.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Per-axis scale.
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Identity rotation and unit scale at `position`.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// A change to one scene entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdatePayload {
    /// Scene-unique entity name.
    pub entity_id: String,
    /// What happened.
    pub action: EntityAction,
    /// Transform after the action.
    pub transform: Transform,
    /// Time the change was made (Unix ms, sender clock).
    pub timestamp: u64,
}

/// Request to move the shared view to another camera perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerspectiveChangePayload {
    /// Viewpoint to switch to.
    pub perspective: CameraPerspective,
    /// Time of the request (Unix ms, sender clock).
    pub timestamp: u64,
}

/// Parade playback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParadeControlPayload {
    /// Playback command.
    pub action: ParadeAction,
    /// Time the command was issued (Unix ms, sender clock).
    pub timestamp: u64,
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPayload {
    /// Message body, already validated by the sender.
    pub text: String,
    /// Time the line was sent (Unix ms, sender clock).
    pub timestamp: u64,
}

/// The closed set of payloads a [`Message`] can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Carried by [`MessageKind::EntityUpdate`].
    EntityUpdate(EntityUpdatePayload),
    /// Carried by [`MessageKind::PerspectiveChange`].
    PerspectiveChange(PerspectiveChangePayload),
    /// Carried by [`MessageKind::ParadeControl`].
    ParadeControl(ParadeControlPayload),
    /// Carried by [`MessageKind::Chat`].
    Chat(ChatPayload),
}

impl Payload {
    /// The kind tag for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::EntityUpdate(_) => MessageKind::EntityUpdate,
            Payload::PerspectiveChange(_) => MessageKind::PerspectiveChange,
            Payload::ParadeControl(_) => MessageKind::ParadeControl,
            Payload::Chat(_) => MessageKind::Chat,
        }
    }

    /// Timestamp carried inside the payload.
    pub fn timestamp(&self) -> u64 {
        match self {
            Payload::EntityUpdate(p) => p.timestamp,
            Payload::PerspectiveChange(p) => p.timestamp,
            Payload::ParadeControl(p) => p.timestamp,
            Payload::Chat(p) => p.timestamp,
        }
    }
}

impl From<EntityUpdatePayload> for Payload {
    fn from(p: EntityUpdatePayload) -> Self {
        Payload::EntityUpdate(p)
    }
}

impl From<PerspectiveChangePayload> for Payload {
    fn from(p: PerspectiveChangePayload) -> Self {
        Payload::PerspectiveChange(p)
    }
}

impl From<ParadeControlPayload> for Payload {
    fn from(p: ParadeControlPayload) -> Self {
        Payload::ParadeControl(p)
    }
}

impl From<ChatPayload> for Payload {
    fn from(p: ChatPayload) -> Self {
        Payload::Chat(p)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Unique message identifier, random per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u128);

impl MessageId {
    /// A fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// One unit of collaboration traffic. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    sender: PeerId,
    timestamp: u64,
    payload: Payload,
}

impl Message {
    /// Wrap `payload` in a new message from `sender`, stamped now.
    pub fn new(sender: PeerId, payload: impl Into<Payload>) -> Self {
        Self::from_parts(MessageId::random(), sender, now_millis(), payload.into())
    }

    /// Assemble a message from explicit parts.
    pub fn from_parts(id: MessageId, sender: PeerId, timestamp: u64, payload: Payload) -> Self {
        Self {
            id,
            sender,
            timestamp,
            payload,
        }
    }

    /// Random id assigned at creation.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Kind tag, always in agreement with the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Peer that created the message.
    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    /// Creation time (Unix ms, sender clock).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The carried payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consume the message, keeping only the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: [u8; 16],
    kind: u8,
    sender: String,
    timestamp_ms: u64,
    payload_type: String,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntityUpdateWire {
    entity_id: String,
    action: u8,
    position: [f32; 3],
    rotation: [f32; 4],
    scale: [f32; 3],
    timestamp_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PerspectiveChangeWire {
    perspective: u8,
    timestamp_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParadeControlWire {
    action: u8,
    timestamp_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatWire {
    text: String,
    timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons an inbound payload could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    Empty,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Truncated or corrupt bytes.
    #[error("malformed bytes: {0}")]
    Malformed(#[from] postcard::Error),

    /// Bytes left over after a complete structure was read.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// The payload type tag does not belong to the envelope kind.
    #[error("payload tagged {tag:?} cannot carry a {kind} message")]
    TagMismatch {
        /// Kind announced by the envelope.
        kind: MessageKind,
        /// Tag found on the payload bytes.
        tag: String,
    },

    /// An enum code this build does not know.
    #[error("unrecognized {field} value {value}")]
    UnrecognizedVariant {
        /// Which field carried the code.
        field: &'static str,
        /// The unknown code.
        value: u8,
    },

    /// The envelope sender is not a valid peer id.
    #[error("invalid sender: {0}")]
    InvalidSender(#[from] PeerIdError),

    /// The envelope names a different sender than the link it arrived on.
    #[error("envelope claims sender {claimed} but arrived from {link}")]
    SenderMismatch {
        /// Peer on the other end of the link.
        link: PeerId,
        /// Sender written in the envelope.
        claimed: PeerId,
    },
}

/// A [`Message`] could not be serialized.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("could not serialize message: {0}")]
    Serialize(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, postcard::Error> {
    match payload {
        Payload::EntityUpdate(p) => postcard::to_allocvec(&EntityUpdateWire {
            entity_id: p.entity_id.clone(),
            action: p.action.code(),
            position: p.transform.position.to_array(),
            rotation: p.transform.rotation.to_array(),
            scale: p.transform.scale.to_array(),
            timestamp_ms: p.timestamp,
        }),
        Payload::PerspectiveChange(p) => postcard::to_allocvec(&PerspectiveChangeWire {
            perspective: p.perspective.code(),
            timestamp_ms: p.timestamp,
        }),
        Payload::ParadeControl(p) => postcard::to_allocvec(&ParadeControlWire {
            action: p.action.code(),
            timestamp_ms: p.timestamp,
        }),
        Payload::Chat(p) => postcard::to_allocvec(&ChatWire {
            text: p.text.clone(),
            timestamp_ms: p.timestamp,
        }),
    }
}

/// Deserialize `T` and insist that every byte was consumed.
fn take_exact<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, DecodeError> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

fn decode_payload(kind: MessageKind, bytes: &[u8]) -> Result<Payload, DecodeError> {
    let payload = match kind {
        MessageKind::EntityUpdate => {
            let wire: EntityUpdateWire = take_exact(bytes)?;
            Payload::EntityUpdate(EntityUpdatePayload {
                entity_id: wire.entity_id,
                action: EntityAction::from_code(wire.action)?,
                transform: Transform {
                    position: Vec3::from_array(wire.position),
                    rotation: Quat::from_array(wire.rotation),
                    scale: Vec3::from_array(wire.scale),
                },
                timestamp: wire.timestamp_ms,
            })
        }
        MessageKind::PerspectiveChange => {
            let wire: PerspectiveChangeWire = take_exact(bytes)?;
            Payload::PerspectiveChange(PerspectiveChangePayload {
                perspective: CameraPerspective::from_code(wire.perspective)?,
                timestamp: wire.timestamp_ms,
            })
        }
        MessageKind::ParadeControl => {
            let wire: ParadeControlWire = take_exact(bytes)?;
            Payload::ParadeControl(ParadeControlPayload {
                action: ParadeAction::from_code(wire.action)?,
                timestamp: wire.timestamp_ms,
            })
        }
        MessageKind::Chat => {
            let wire: ChatWire = take_exact(bytes)?;
            Payload::Chat(ChatPayload {
                text: wire.text,
                timestamp: wire.timestamp_ms,
            })
        }
    };
    Ok(payload)
}

/// Serialize a [`Message`] into a versioned envelope.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let kind = msg.kind();
    let envelope = Envelope {
        id: msg.id.0.to_le_bytes(),
        kind: kind.code(),
        sender: msg.sender.as_str().to_string(),
        timestamp_ms: msg.timestamp,
        payload_type: kind.payload_type().to_string(),
        payload: encode_payload(&msg.payload)?,
    };
    let body = postcard::to_allocvec(&envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned envelope into a [`Message`].
pub fn decode_message(data: &[u8]) -> Result<Message, DecodeError> {
    let (&version, body) = data.split_first().ok_or(DecodeError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let envelope: Envelope = take_exact(body)?;
    let kind = MessageKind::from_code(envelope.kind)?;
    if envelope.payload_type != kind.payload_type() {
        return Err(DecodeError::TagMismatch {
            kind,
            tag: envelope.payload_type,
        });
    }

    let payload = decode_payload(kind, &envelope.payload)?;
    Ok(Message {
        id: MessageId(u128::from_le_bytes(envelope.id)),
        sender: PeerId::new(envelope.sender)?,
        timestamp: envelope.timestamp_ms,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn vec3() -> impl Strategy<Value = Vec3> {
        prop::array::uniform3(-1.0e6f32..1.0e6f32).prop_map(Vec3::from_array)
    }

    fn transform() -> impl Strategy<Value = Transform> {
        (vec3(), prop::array::uniform4(-1.0f32..1.0f32), vec3()).prop_map(
            |(position, rotation, scale)| Transform {
                position,
                rotation: Quat::from_array(rotation),
                scale,
            },
        )
    }

    fn payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            (
                ".{0,32}",
                prop::sample::select(EntityAction::ALL),
                transform(),
                any::<u64>(),
            )
                .prop_map(|(entity_id, action, transform, timestamp)| {
                    Payload::EntityUpdate(EntityUpdatePayload {
                        entity_id,
                        action,
                        transform,
                        timestamp,
                    })
                }),
            (prop::sample::select(CameraPerspective::ALL), any::<u64>()).prop_map(
                |(perspective, timestamp)| {
                    Payload::PerspectiveChange(PerspectiveChangePayload {
                        perspective,
                        timestamp,
                    })
                }
            ),
            (prop::sample::select(ParadeAction::ALL), any::<u64>()).prop_map(
                |(action, timestamp)| {
                    Payload::ParadeControl(ParadeControlPayload { action, timestamp })
                }
            ),
            (any::<String>(), any::<u64>())
                .prop_map(|(text, timestamp)| Payload::Chat(ChatPayload { text, timestamp })),
        ]
    }

    fn message() -> impl Strategy<Value = Message> {
        (
            any::<u128>(),
            "[A-Za-z0-9][A-Za-z0-9 _.-]{0,23}",
            any::<u64>(),
            payload(),
        )
            .prop_map(|(id, sender, timestamp, payload)| {
                let sender = PeerId::new(sender).unwrap();
                Message::from_parts(MessageId(id), sender, timestamp, payload)
            })
    }

    /// Whatever `decode_message` accepts must be a usable message.
    fn check_decoded(bytes: &[u8]) {
        if let Ok(msg) = decode_message(bytes) {
            assert!(!msg.sender().as_str().trim().is_empty());
            assert_eq!(msg.kind(), msg.payload().kind());
            assert!(encode_message(&msg).is_ok());
        }
    }

    proptest! {
        #[test]
        fn prop_message_roundtrip(msg in message()) {
            let bytes = encode_message(&msg).unwrap();
            prop_assert_eq!(bytes[0], PROTOCOL_VERSION);
            prop_assert_eq!(decode_message(&bytes).unwrap(), msg);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            check_decoded(&bytes);
        }

        #[test]
        fn prop_versioned_garbage_never_panics(tail in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut bytes = vec![PROTOCOL_VERSION];
            bytes.extend(tail);
            check_decoded(&bytes);
        }

        #[test]
        fn prop_corrupted_message_never_panics(
            msg in message(),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = encode_message(&msg).unwrap();
            let at = index.index(bytes.len());
            bytes[at] ^= flip;
            check_decoded(&bytes);
        }
    }
}
