//! The session event loop.
//!
//! [`SessionRuntime::run`] is the only place session state is mutated. It
//! selects over the transport's event channel and commands from any number of
//! [`SessionHandle`]s:
//!
//! ```text
//!  SessionHandle ──SessionCommand──┐
//!  SessionHandle ──SessionCommand──┤
//!                                  ▼
//!  Transport ──TransportEvent──▶ SessionRuntime::run ──Notification──▶ UI
//!                                  │
//!                                  └──watch<SessionState>──▶ UI
//! ```
//!
//! Queries are answered over `oneshot` channels with owned snapshots.

use tokio::sync::{mpsc, oneshot};

use parade_net::{
    CameraPerspective, ChatPayload, EntityAction, EntityUpdatePayload, EventReceiver, Message,
    ParadeAction, ParadeControlPayload, Payload, PeerId, PerspectiveChangePayload, Transform,
    Transport, now_millis,
};

use crate::chat::{ChatConfig, ChatEntry, validate_chat_text};
use crate::controller::{
    BroadcastOutcome, ControllerOutput, SessionController, SessionError, SessionState,
    SessionStateWatch,
};
use crate::dispatcher::EventDispatcher;
use crate::notification::Notification;
use crate::reconciler::EntityState;
use crate::stage::ParadeState;

/// Receiving half of the notification stream.
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Requests a [`SessionHandle`] sends to the runtime.
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin advertising.
    StartHosting,
    /// Begin dialing known hosts.
    StartBrowsing,
    /// Leave the session; the loop keeps answering queries.
    Stop,
    /// Record a local change and send it to every linked peer.
    Broadcast(Payload),
    /// Snapshot of received chat.
    ChatLog(oneshot::Sender<Vec<ChatEntry>>),
    /// Active state of one entity.
    Entity {
        entity_id: String,
        reply: oneshot::Sender<Option<EntityState>>,
    },
    /// Linked peers, sorted.
    Peers(oneshot::Sender<Vec<PeerId>>),
    /// Shared perspective and parade state.
    Stage(oneshot::Sender<(Option<CameraPerspective>, ParadeState)>),
    /// Stop the session and exit the loop.
    Shutdown,
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: SessionStateWatch,
    local: PeerId,
    chat: ChatConfig,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn query<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Latest published state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every later state change.
    pub fn state_changes(&self) -> SessionStateWatch {
        self.state.clone()
    }

    pub fn start_hosting(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StartHosting)
    }

    pub fn start_browsing(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::StartBrowsing)
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop)
    }

    /// Stop the session and end the runtime loop.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Shutdown)
    }

    /// Send an arbitrary payload to every linked peer.
    pub fn broadcast(&self, payload: impl Into<Payload>) -> Result<(), SessionError> {
        self.send(SessionCommand::Broadcast(payload.into()))
    }

    pub fn broadcast_entity_update(
        &self,
        entity_id: impl Into<String>,
        action: EntityAction,
        transform: Transform,
    ) -> Result<(), SessionError> {
        self.broadcast(EntityUpdatePayload {
            entity_id: entity_id.into(),
            action,
            transform,
            timestamp: now_millis(),
        })
    }

    pub fn change_perspective(&self, perspective: CameraPerspective) -> Result<(), SessionError> {
        self.broadcast(PerspectiveChangePayload {
            perspective,
            timestamp: now_millis(),
        })
    }

    pub fn send_parade_control(&self, action: ParadeAction) -> Result<(), SessionError> {
        self.broadcast(ParadeControlPayload {
            action,
            timestamp: now_millis(),
        })
    }

    /// Validate and send a chat line.
    pub fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let text = validate_chat_text(&self.chat, text)?;
        self.broadcast(ChatPayload {
            text,
            timestamp: now_millis(),
        })
    }

    /// Snapshot of received chat, in arrival order.
    pub async fn chat_log(&self) -> Result<Vec<ChatEntry>, SessionError> {
        self.query(SessionCommand::ChatLog).await
    }

    /// Current state of an active entity.
    pub async fn entity(
        &self,
        entity_id: impl Into<String>,
    ) -> Result<Option<EntityState>, SessionError> {
        let entity_id = entity_id.into();
        self.query(|reply| SessionCommand::Entity { entity_id, reply }).await
    }

    /// Linked peers, sorted.
    pub async fn peers(&self) -> Result<Vec<PeerId>, SessionError> {
        self.query(SessionCommand::Peers).await
    }

    /// Shared perspective and parade playback state.
    pub async fn stage(&self) -> Result<(Option<CameraPerspective>, ParadeState), SessionError> {
        self.query(SessionCommand::Stage).await
    }
}

// ---------------------------------------------------------------------------
// SessionRuntime
// ---------------------------------------------------------------------------

/// Single owner of a session's mutable state.
pub struct SessionRuntime<T: Transport> {
    controller: SessionController<T>,
    dispatcher: EventDispatcher,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<T: Transport> SessionRuntime<T> {
    /// Wire a controller to its transport's event stream.
    ///
    /// The runtime exits when every handle is dropped or after
    /// [`SessionHandle::shutdown`].
    pub fn new(
        controller: SessionController<T>,
        events: EventReceiver,
        chat: ChatConfig,
    ) -> (Self, SessionHandle, NotificationReceiver) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: command_tx,
            state: controller.subscribe(),
            local: controller.local_peer().clone(),
            chat,
        };
        let runtime = Self {
            controller,
            dispatcher: EventDispatcher::new(),
            events,
            commands,
            notifications,
        };
        (runtime, handle, notification_rx)
    }

    /// Run until shut down.
    pub async fn run(mut self) {
        tracing::info!("Session runtime for {} started", self.controller.local_peer());
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.on_transport_event(event),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        for notification in self.controller.stop() {
            self.emit(notification);
        }
        tracing::info!("Session runtime for {} exited", self.controller.local_peer());
    }

    fn emit(&self, notification: Notification) {
        tracing::trace!("Notify {notification:?}");
        // The UI may have gone away; the session keeps running regardless.
        let _ = self.notifications.send(notification);
    }

    fn on_transport_event(&mut self, event: parade_net::TransportEvent) {
        for output in self.controller.handle_event(event) {
            match output {
                ControllerOutput::Notify(notification) => self.emit(notification),
                ControllerOutput::Deliver(msg) => {
                    if let Some(notification) = self.dispatcher.dispatch(msg) {
                        self.emit(notification);
                    }
                }
            }
        }
    }

    fn report(&self, operation: &'static str, result: Result<(), SessionError>) {
        match result {
            Ok(()) => {}
            Err(SessionError::Transport(e)) => self.emit(Notification::TransportError {
                operation,
                reason: e.to_string(),
            }),
            Err(e) => tracing::warn!("{operation} refused: {e}"),
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartHosting => {
                let result = self.controller.start_hosting();
                self.report("advertise", result);
            }
            SessionCommand::StartBrowsing => {
                let result = self.controller.start_browsing();
                self.report("browse", result);
            }
            SessionCommand::Stop => {
                for notification in self.controller.stop() {
                    self.emit(notification);
                }
            }
            SessionCommand::Broadcast(payload) => {
                // Scene state freezes with the session.
                if self.controller.is_stopped() {
                    self.report("send", Err(SessionError::Stopped));
                    return;
                }
                let msg = Message::new(self.controller.local_peer().clone(), payload);
                self.dispatcher.record_local(&msg);
                let result = match self.controller.broadcast(&msg) {
                    Ok(BroadcastOutcome::NoPeers) => {
                        tracing::debug!("{} not sent, session has no peers", msg.kind());
                        Ok(())
                    }
                    Ok(BroadcastOutcome::Sent(_)) => Ok(()),
                    Err(e) => Err(e),
                };
                self.report("send", result);
            }
            SessionCommand::ChatLog(reply) => {
                let _ = reply.send(self.dispatcher.chat_log().all_messages());
            }
            SessionCommand::Entity { entity_id, reply } => {
                let state = self.dispatcher.reconciler().state(&entity_id).active().copied();
                let _ = reply.send(state);
            }
            SessionCommand::Peers(reply) => {
                let _ = reply.send(self.controller.connected_peers());
            }
            SessionCommand::Stage(reply) => {
                let stage = self.dispatcher.stage();
                let _ = reply.send((stage.perspective(), stage.parade()));
            }
            SessionCommand::Shutdown => {}
        }
    }
}

#[cfg(test)]
#[path = "scenario_tests.rs"]
mod scenario_tests;
