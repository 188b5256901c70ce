//! Routes decoded messages to the consumer that owns their kind.
//!
//! | kind                | consumer             |
//! |---------------------|----------------------|
//! | `EntityUpdate`      | [`EntityReconciler`] |
//! | `PerspectiveChange` | [`StageState`]       |
//! | `ParadeControl`     | [`StageState`]       |
//! | `Chat`              | [`ChatLog`]          |
//!
//! Dispatch is synchronous and happens in decode order.

use parade_net::{Message, MessageKind, Payload};

use crate::chat::{ChatEntry, ChatLog};
use crate::notification::Notification;
use crate::reconciler::{EntityReconciler, Reconciled};
use crate::stage::StageState;

/// Owns every message consumer.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    reconciler: EntityReconciler,
    chat: ChatLog,
    stage: StageState,
    routed: [u64; 4],
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `msg` to its consumer. Returns the notification the consumer
    /// produced, or `None` for stale or duplicate input.
    pub fn dispatch(&mut self, msg: Message) -> Option<Notification> {
        let kind = msg.kind();
        self.routed[kind.code() as usize] += 1;

        let id = msg.id();
        let sender = msg.sender().clone();
        match msg.into_payload() {
            Payload::EntityUpdate(update) => match self.reconciler.apply(&update) {
                Reconciled::Applied(transform) => Some(Notification::EntityApplied {
                    entity_id: update.entity_id,
                    transform,
                }),
                Reconciled::Removed => Some(Notification::EntityRemoved {
                    entity_id: update.entity_id,
                }),
                Reconciled::Selected => Some(Notification::EntitySelected {
                    entity_id: update.entity_id,
                    by: sender,
                }),
                Reconciled::Ignored => None,
            },
            Payload::PerspectiveChange(change) => self
                .stage
                .apply_perspective(&change)
                .then_some(Notification::PerspectiveRequested {
                    perspective: change.perspective,
                    by: sender,
                }),
            Payload::ParadeControl(control) => {
                self.stage
                    .apply_parade(&control)
                    .map(|phase| Notification::ParadeControlRequested {
                        action: control.action,
                        phase,
                        by: sender,
                    })
            }
            Payload::Chat(chat) => {
                let entry = ChatEntry {
                    id,
                    sender: sender.clone(),
                    text: chat.text.clone(),
                    timestamp: chat.timestamp,
                };
                self.chat.append(entry).then_some(Notification::ChatReceived {
                    sender,
                    text: chat.text,
                })
            }
        }
    }

    /// Fold a message sent by this device into local state, without
    /// notifying. Outgoing chat is not logged.
    pub fn record_local(&mut self, msg: &Message) {
        match msg.payload() {
            Payload::EntityUpdate(update) => self.reconciler.record_local(update),
            Payload::PerspectiveChange(change) => {
                self.stage.apply_perspective(change);
            }
            Payload::ParadeControl(control) => {
                self.stage.apply_parade(control);
            }
            Payload::Chat(_) => {}
        }
    }

    /// Messages routed so far for `kind`.
    pub fn routed(&self, kind: MessageKind) -> u64 {
        self.routed[kind.code() as usize]
    }

    pub fn reconciler(&self) -> &EntityReconciler {
        &self.reconciler
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat
    }

    pub fn stage(&self) -> &StageState {
        &self.stage
    }
}
