//! Transport capability interface.
//!
//! A transport advertises the local peer, discovers other peers in the same
//! service namespace, links them and moves opaque byte payloads between them.
//! Everything it observes is reported on one unified [`TransportEvent`]
//! channel, consumed by a single session loop:
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐
//! │ MemoryTransport  │   │ TcpTransport     │
//! │ (in-process hub) │   │ (tokio sockets)  │
//! └────────┬─────────┘   └────────┬─────────┘
//!          └──────────┬───────────┘
//!                     ▼
//!        mpsc::UnboundedReceiver<TransportEvent>
//!                     │
//!                     ▼
//!           SessionController (one owner)
//! ```
//!
//! Delivery is reliable and ordered per link. Nothing is promised across
//! links.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::peer::PeerId;

/// Service namespace used when none is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "military-parade";

/// How long a transport waits for an invitation answer before treating it as
/// a rejection.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sending half of a transport event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the unified event channel a transport reports on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Something the transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// A link to `PeerId` is being established.
    PeerConnecting(PeerId),
    /// A link to `PeerId` is up.
    PeerConnected(PeerId),
    /// A link to `PeerId` went away.
    PeerDisconnected(PeerId),
    /// Bytes arrived on the link from `from`.
    DataReceived {
        /// Link the bytes arrived on.
        from: PeerId,
        /// One complete envelope.
        bytes: Vec<u8>,
    },
    /// A discovered peer asks to join.
    InboundInvite {
        /// Peer asking to join.
        from: PeerId,
        /// Answer channel; dropping it counts as a rejection.
        responder: InviteResponder,
    },
}

/// One-shot answer to an [`TransportEvent::InboundInvite`].
#[derive(Debug)]
pub struct InviteResponder {
    tx: oneshot::Sender<bool>,
}

impl InviteResponder {
    /// Create a responder and the receiver the transport awaits.
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Answer the invitation. Late answers (after a timeout) are discarded.
    pub fn respond(self, accept: bool) {
        let _ = self.tx.send(accept);
    }

    /// Let the peer join.
    pub fn accept(self) {
        self.respond(true);
    }

    /// Turn the peer away; its dialer sees the link close.
    pub fn reject(self) {
        self.respond(false);
    }
}

/// Await an invitation answer, bounded by `timeout`.
///
/// Timeouts and dropped responders both resolve to `false`.
pub async fn await_invite_answer(
    rx: oneshot::Receiver<bool>,
    from: &PeerId,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(_)) => {
            tracing::debug!("Invitation from {from} abandoned");
            false
        }
        Err(_) => {
            tracing::info!("Invitation from {from} timed out after {timeout:?}");
            false
        }
    }
}

/// Errors reported by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Another transport already uses this peer id.
    #[error("peer id {0} already registered")]
    DuplicatePeer(PeerId),

    /// The transport was stopped and cannot be used again.
    #[error("transport stopped")]
    Stopped,

    /// Advertising could not start.
    #[error("advertise failed: {0}")]
    Advertise(String),

    /// Browsing could not start.
    #[error("browse failed: {0}")]
    Browse(String),

    /// A payload could not be queued for sending.
    #[error("send failed: {0}")]
    Send(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface every transport implements.
///
/// All operations return promptly; the actual network work happens on the
/// transport's own tasks and is reported through its [`EventReceiver`].
pub trait Transport: Send {
    /// Identity this transport announces.
    fn local_peer(&self) -> &PeerId;

    /// Make the local peer discoverable.
    fn advertise(&mut self) -> Result<(), TransportError>;

    /// Start looking for advertising peers and invite them.
    fn browse(&mut self) -> Result<(), TransportError>;

    /// Tear down every link, listener and pending invitation.
    fn stop(&mut self);

    /// Queue `bytes` for delivery to each peer in `to`.
    fn send(&mut self, bytes: &[u8], to: &[PeerId]) -> Result<(), TransportError>;
}
