//! Collaborative session layer: session control, message dispatch,
//! last-writer-wins entity reconciliation, chat and the shared stage state.

pub mod chat;
pub mod controller;
pub mod dispatcher;
pub mod notification;
pub mod reconciler;
pub mod runtime;
pub mod stage;

pub use chat::{
    ChatConfig, ChatEntry, ChatLog, ChatRejection, DEFAULT_MAX_MESSAGE_LENGTH, validate_chat_text,
};
pub use controller::{
    AcceptAll, AllowList, BroadcastOutcome, ControllerOutput, InvitePolicy, SessionController,
    SessionError, SessionState, SessionStateWatch,
};
pub use dispatcher::EventDispatcher;
pub use notification::Notification;
pub use reconciler::{EntityPresence, EntityReconciler, EntityState, Reconciled};
pub use runtime::{NotificationReceiver, SessionCommand, SessionHandle, SessionRuntime};
pub use stage::{ParadePhase, ParadeState, StageState};
