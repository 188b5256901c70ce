//! Peer networking for collaborative parade sessions: peer identity, the
//! message envelope codec, stream framing and the transports that link peers.

pub mod framing;
pub mod memory;
pub mod messages;
pub mod peer;
pub mod tcp;
pub mod transport;

pub use framing::{FrameConfig, FrameError, read_frame, read_typed, write_frame, write_typed};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{
    CameraPerspective, ChatPayload, DecodeError, EncodeError, EntityAction, EntityUpdatePayload,
    Message, MessageId, MessageKind, PROTOCOL_VERSION, ParadeAction, ParadeControlPayload,
    Payload, PerspectiveChangePayload, Transform, decode_message, encode_message, now_millis,
};
pub use peer::{PeerId, PeerIdError};
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::{
    DEFAULT_INVITE_TIMEOUT, DEFAULT_SERVICE_TYPE, EventReceiver, EventSender, InviteResponder,
    Transport, TransportError, TransportEvent, event_channel,
};
