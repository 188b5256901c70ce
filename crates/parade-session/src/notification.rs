//! Outcomes the session reports to the presentation layer.

use parade_net::{CameraPerspective, ParadeAction, PeerId, Transform};

use crate::stage::ParadePhase;

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A peer finished linking.
    PeerJoined(PeerId),
    /// A previously joined peer went away.
    PeerLeft(PeerId),
    /// Bytes from `peer` could not be decoded and were dropped.
    DecodeError {
        peer: PeerId,
        reason: String,
        /// Running number of failures seen from `peer`.
        count: u32,
    },
    /// A transport operation failed. The session state is unchanged.
    TransportError {
        /// `"advertise"`, `"browse"` or `"send"`.
        operation: &'static str,
        reason: String,
    },
    /// An entity was created or its transform replaced.
    EntityApplied {
        entity_id: String,
        transform: Transform,
    },
    /// An entity was deleted.
    EntityRemoved { entity_id: String },
    /// A participant highlighted an entity.
    EntitySelected { entity_id: String, by: PeerId },
    /// A participant switched the shared camera perspective.
    PerspectiveRequested {
        perspective: CameraPerspective,
        by: PeerId,
    },
    /// A participant issued a parade command.
    ParadeControlRequested {
        action: ParadeAction,
        /// Phase after the command was applied.
        phase: ParadePhase,
        by: PeerId,
    },
    /// A chat line arrived.
    ChatReceived { sender: PeerId, text: String },
}
