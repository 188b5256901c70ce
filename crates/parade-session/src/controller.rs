//! Session controller: session state, the peer set and the boundary between
//! raw transport events and typed messages.
//!
//! The controller is driven from a single task. It never blocks: transport
//! operations return immediately and everything the transport observes comes
//! back through [`SessionController::handle_event`].
//!
//! ```text
//!            start_hosting()            start_browsing()
//!   Idle ──────────────────▶ Advertising ─────────────┐
//!     │                                               ▼
//!     └──── start_browsing() ──────────────────▶ Browsing
//!                                                     │ PeerConnecting
//!                                                     ▼
//!                                               Connecting(peer)
//!                                                     │ PeerConnected
//!                                                     ▼
//!                                               Connected(peers)
//!   any state ── stop() ──▶ Stopped   (terminal)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::watch;

use parade_net::{
    DecodeError, EncodeError, Message, PeerId, Transport, TransportError, TransportEvent,
    decode_message, encode_message,
};

use crate::chat::ChatRejection;
use crate::notification::Notification;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Externally visible session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Neither hosting nor browsing yet.
    Idle,
    /// Discoverable, waiting for someone to join.
    Advertising,
    /// Looking for hosts, possibly while also advertising.
    Browsing,
    /// A link to this peer is being set up and nobody is linked yet.
    Connecting(PeerId),
    /// Linked peers, sorted.
    Connected(Vec<PeerId>),
    /// Terminal.
    Stopped,
}

/// Receiver for [`SessionState`] changes.
pub type SessionStateWatch = watch::Receiver<SessionState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerConnection {
    Connecting,
    Connected,
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was stopped and cannot be restarted.
    #[error("session stopped")]
    Stopped,

    /// The session runtime is no longer running.
    #[error("session runtime closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("chat rejected: {0}")]
    Chat(#[from] ChatRejection),
}

/// What [`SessionController::broadcast`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Nobody is linked; nothing was encoded or sent.
    NoPeers,
    /// Handed to the transport for this many peers.
    Sent(usize),
}

/// Result of handling one transport event.
#[derive(Debug)]
pub enum ControllerOutput {
    /// Report this to the presentation layer.
    Notify(Notification),
    /// A decoded message, ready for dispatch.
    Deliver(Message),
}

// ---------------------------------------------------------------------------
// InvitePolicy
// ---------------------------------------------------------------------------

/// Decides whether an inbound invitation is accepted.
pub trait InvitePolicy: Send {
    fn accept(&self, from: &PeerId) -> bool;
}

impl<F> InvitePolicy for F
where
    F: Fn(&PeerId) -> bool + Send,
{
    fn accept(&self, from: &PeerId) -> bool {
        self(from)
    }
}

/// Accept every invitation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl InvitePolicy for AcceptAll {
    fn accept(&self, _from: &PeerId) -> bool {
        true
    }
}

/// Accept invitations only from listed peers.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: BTreeSet<PeerId>,
}

impl AllowList {
    /// Accept only the peers in `allowed`; an empty list rejects everyone.
    pub fn new(allowed: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl InvitePolicy for AllowList {
    fn accept(&self, from: &PeerId) -> bool {
        self.allowed.contains(from)
    }
}

// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

/// Owns the transport, the peer set and the session state.
pub struct SessionController<T: Transport> {
    transport: T,
    policy: Box<dyn InvitePolicy>,
    advertising: bool,
    browsing: bool,
    stopped: bool,
    peers: BTreeMap<PeerId, PeerConnection>,
    decode_failures: HashMap<PeerId, u32>,
    state_tx: watch::Sender<SessionState>,
}

impl<T: Transport> SessionController<T> {
    /// A controller that accepts every invitation.
    pub fn new(transport: T) -> Self {
        Self::with_policy(transport, AcceptAll)
    }

    /// A controller that asks `policy` about every inbound invitation.
    pub fn with_policy(transport: T, policy: impl InvitePolicy + 'static) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            transport,
            policy: Box::new(policy),
            advertising: false,
            browsing: false,
            stopped: false,
            peers: BTreeMap::new(),
            decode_failures: HashMap::new(),
            state_tx,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        self.transport.local_peer()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current state, derived from roles and the peer set.
    pub fn state(&self) -> SessionState {
        if self.stopped {
            return SessionState::Stopped;
        }
        let connected = self.connected_peers();
        if !connected.is_empty() {
            return SessionState::Connected(connected);
        }
        if let Some(pending) = self
            .peers
            .iter()
            .find_map(|(peer, c)| (*c == PeerConnection::Connecting).then_some(peer))
        {
            return SessionState::Connecting(pending.clone());
        }
        match (self.advertising, self.browsing) {
            (true, _) => SessionState::Advertising,
            (false, true) => SessionState::Browsing,
            (false, false) => SessionState::Idle,
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> SessionStateWatch {
        self.state_tx.subscribe()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Linked peers, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, c)| **c == PeerConnection::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Number of undecodable payloads received from `peer` so far.
    pub fn decode_failures(&self, peer: &PeerId) -> u32 {
        self.decode_failures.get(peer).copied().unwrap_or(0)
    }

    fn publish_state(&self) {
        let next = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!("Session state {current:?} -> {next:?}");
            *current = next;
            true
        });
    }

    /// Make this peer discoverable. Idempotent.
    pub fn start_hosting(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Err(SessionError::Stopped);
        }
        if self.advertising {
            return Ok(());
        }
        self.transport.advertise().inspect_err(|e| {
            tracing::warn!("Failed to start advertising: {e}");
        })?;
        self.advertising = true;
        tracing::info!("{} is hosting", self.local_peer());
        self.publish_state();
        Ok(())
    }

    /// Look for hosts and invite them. Idempotent.
    pub fn start_browsing(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Err(SessionError::Stopped);
        }
        if self.browsing {
            return Ok(());
        }
        self.transport.browse().inspect_err(|e| {
            tracing::warn!("Failed to start browsing: {e}");
        })?;
        self.browsing = true;
        tracing::info!("{} is browsing", self.local_peer());
        self.publish_state();
        Ok(())
    }

    /// Leave the session for good. Returns a `PeerLeft` for every peer that
    /// was linked.
    pub fn stop(&mut self) -> Vec<Notification> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        self.advertising = false;
        self.browsing = false;
        let left: Vec<Notification> = std::mem::take(&mut self.peers)
            .into_iter()
            .filter(|(_, c)| *c == PeerConnection::Connected)
            .map(|(peer, _)| Notification::PeerLeft(peer))
            .collect();
        self.transport.stop();
        tracing::info!("{} left the session", self.local_peer());
        self.publish_state();
        left
    }

    /// Send `msg` to every linked peer. Fire-and-forget.
    pub fn broadcast(&mut self, msg: &Message) -> Result<BroadcastOutcome, SessionError> {
        let targets = self.connected_peers();
        if targets.is_empty() {
            tracing::debug!("No peers linked, not sending {} {}", msg.kind(), msg.id());
            return Ok(BroadcastOutcome::NoPeers);
        }
        let bytes = encode_message(msg)?;
        self.transport.send(&bytes, &targets).inspect_err(|e| {
            tracing::warn!("Failed to send {} {}: {e}", msg.kind(), msg.id());
        })?;
        tracing::debug!(
            "Sent {} {} ({} bytes) to {} peer(s)",
            msg.kind(),
            msg.id(),
            bytes.len(),
            targets.len()
        );
        Ok(BroadcastOutcome::Sent(targets.len()))
    }

    /// Fold one transport event into the session.
    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<ControllerOutput> {
        if self.stopped {
            if let TransportEvent::InboundInvite { from, responder } = event {
                tracing::debug!("Rejecting invitation from {from}: session stopped");
                responder.reject();
            }
            return Vec::new();
        }

        match event {
            TransportEvent::PeerConnecting(peer) => {
                if !self.peers.contains_key(&peer) {
                    tracing::debug!("Connecting to {peer}");
                    self.peers.insert(peer, PeerConnection::Connecting);
                    self.publish_state();
                }
                Vec::new()
            }
            TransportEvent::PeerConnected(peer) => {
                let previous = self.peers.insert(peer.clone(), PeerConnection::Connected);
                if previous == Some(PeerConnection::Connected) {
                    return Vec::new();
                }
                tracing::info!("{peer} joined");
                self.publish_state();
                vec![ControllerOutput::Notify(Notification::PeerJoined(peer))]
            }
            TransportEvent::PeerDisconnected(peer) => match self.peers.remove(&peer) {
                Some(PeerConnection::Connected) => {
                    tracing::info!("{peer} left");
                    self.publish_state();
                    vec![ControllerOutput::Notify(Notification::PeerLeft(peer))]
                }
                Some(PeerConnection::Connecting) => {
                    tracing::debug!("Link to {peer} was not established");
                    self.publish_state();
                    Vec::new()
                }
                None => Vec::new(),
            },
            TransportEvent::DataReceived { from, bytes } => {
                let output = match self.decode_from(&from, &bytes) {
                    Ok(msg) => ControllerOutput::Deliver(msg),
                    Err(e) => ControllerOutput::Notify(self.record_decode_failure(from, e)),
                };
                vec![output]
            }
            TransportEvent::InboundInvite { from, responder } => {
                let accepted = self.policy.accept(&from);
                if accepted {
                    tracing::info!("Accepting invitation from {from}");
                } else {
                    tracing::info!("Rejecting invitation from {from}");
                }
                responder.respond(accepted);
                Vec::new()
            }
        }
    }

    fn decode_from(&self, from: &PeerId, bytes: &[u8]) -> Result<Message, DecodeError> {
        let msg = decode_message(bytes)?;
        if msg.sender() != from {
            return Err(DecodeError::SenderMismatch {
                link: from.clone(),
                claimed: msg.sender().clone(),
            });
        }
        tracing::trace!("Received {} {} from {from}", msg.kind(), msg.id());
        Ok(msg)
    }

    fn record_decode_failure(&mut self, peer: PeerId, error: DecodeError) -> Notification {
        let count = self.decode_failures.entry(peer.clone()).or_insert(0);
        *count += 1;
        tracing::warn!("Dropping undecodable payload from {peer} (#{count}): {error}");
        Notification::DecodeError {
            peer,
            reason: error.to_string(),
            count: *count,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
