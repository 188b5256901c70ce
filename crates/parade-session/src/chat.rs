//! Session chat: outgoing validation and the arrival-ordered receive log.
//!
//! Outgoing text is trimmed and checked against [`ChatConfig`] before it is
//! broadcast. Received lines are appended to a [`ChatLog`] in the order they
//! arrive at this device; no attempt is made to agree on an order across
//! peers. A message id seen twice is stored once.

use std::collections::HashSet;

use parade_net::{MessageId, PeerId};

/// Default cap on outgoing chat length, in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 500;

// ---------------------------------------------------------------------------
// ChatConfig
// ---------------------------------------------------------------------------

/// Outgoing chat rules.
#[derive(Debug, Clone, Copy)]
pub struct ChatConfig {
    /// Maximum message length in characters, after trimming.
    pub max_message_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

// ---------------------------------------------------------------------------
// ChatRejection
// ---------------------------------------------------------------------------

/// Reason outgoing chat text was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatRejection {
    /// Empty or whitespace-only.
    #[error("chat message is empty")]
    Empty,
    /// Longer than [`ChatConfig::max_message_length`].
    #[error("chat message has {length} characters, limit is {max}")]
    TooLong { length: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Trim `text` and check it against `config`. Returns the text to send.
pub fn validate_chat_text(config: &ChatConfig, text: &str) -> Result<String, ChatRejection> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ChatRejection::Empty);
    }
    let length = trimmed.chars().count();
    if length > config.max_message_length {
        return Err(ChatRejection::TooLong {
            length,
            max: config.max_message_length,
        });
    }
    Ok(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// ChatLog
// ---------------------------------------------------------------------------

/// One received chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub id: MessageId,
    pub sender: PeerId,
    pub text: String,
    /// Sender-clock timestamp (Unix ms).
    pub timestamp: u64,
}

/// Append-only log of received chat.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    seen: HashSet<MessageId>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry`. Returns `false` if its id was already logged.
    pub fn append(&mut self, entry: ChatEntry) -> bool {
        if !self.seen.insert(entry.id) {
            tracing::debug!("Duplicate chat message {} from {}", entry.id, entry.sender);
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Snapshot of every entry in arrival order.
    pub fn all_messages(&self) -> Vec<ChatEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
