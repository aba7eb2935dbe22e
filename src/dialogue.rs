//! Dialogue message log.
//!
//! Messages are kept in an insertion-ordered indexed map so status patches
//! by id are O(1), with an auxiliary "current thinking message" pointer per
//! role. At most one thinking message per role exists at any time: pushing
//! a message for a role retires that role's previous thinking placeholder.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle status of a message as the pipeline progresses a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Placeholder while recognition/generation is in progress.
    Thinking,
    /// User text recognized but the utterance is not yet dispatched.
    Pending,
    /// Assistant text is final; audio is still streaming/playing.
    TtsStreaming,
    /// Settled.
    Done,
    /// Terminal failure notice.
    Error,
}

/// One chat message.
#[derive(Debug, Clone)]
pub struct DialogueMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// Restored from a previous session's history; excluded from
    /// save-history.
    pub restored: bool,
}

/// A `{role, content}` pair for the generation request's history window.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HistoryTurn {
    pub role: &'static str,
    pub content: String,
}

/// A turn projected for the save-history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SavedTurn {
    pub role: &'static str,
    pub text: String,
}

/// Insertion-ordered message log with per-role thinking pointers.
#[derive(Debug, Default)]
pub struct MessageLog {
    order: Vec<String>,
    by_id: HashMap<String, DialogueMessage>,
    thinking: HashMap<Role, String>,
}

impl MessageLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, retiring any prior thinking message of the same
    /// role. Returns the new message's id.
    pub fn push(&mut self, role: Role, text: impl Into<String>, status: MessageStatus) -> String {
        self.push_message(role, text, status, false)
    }

    /// Append a message restored from session history.
    pub fn push_restored(&mut self, role: Role, text: impl Into<String>) -> String {
        self.push_message(role, text, MessageStatus::Done, true)
    }

    fn push_message(
        &mut self,
        role: Role,
        text: impl Into<String>,
        status: MessageStatus,
        restored: bool,
    ) -> String {
        if let Some(prior) = self.thinking.remove(&role) {
            self.remove(&prior);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let message = DialogueMessage {
            id: id.clone(),
            role,
            text: text.into(),
            status,
            timestamp: Utc::now(),
            restored,
        };
        self.order.push(id.clone());
        self.by_id.insert(id.clone(), message);

        if status == MessageStatus::Thinking {
            self.thinking.insert(role, id.clone());
        }
        id
    }

    /// Update a message's text in place.
    pub fn set_text(&mut self, id: &str, text: impl Into<String>) -> Option<&DialogueMessage> {
        let message = self.by_id.get_mut(id)?;
        message.text = text.into();
        Some(message)
    }

    /// Update a message's status in place. Leaving `Thinking` clears the
    /// role's thinking pointer at the same time.
    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> Option<&DialogueMessage> {
        let role = {
            let message = self.by_id.get_mut(id)?;
            message.status = status;
            message.role
        };
        if status != MessageStatus::Thinking
            && self.thinking.get(&role).map(String::as_str) == Some(id)
        {
            self.thinking.remove(&role);
        }
        self.by_id.get(id)
    }

    /// Update text and status together.
    pub fn patch(
        &mut self,
        id: &str,
        text: impl Into<String>,
        status: MessageStatus,
    ) -> Option<&DialogueMessage> {
        self.set_text(id, text)?;
        self.set_status(id, status)
    }

    /// Remove a message entirely.
    pub fn remove(&mut self, id: &str) -> Option<DialogueMessage> {
        let message = self.by_id.remove(id)?;
        self.order.retain(|m| m.as_str() != id);
        if self.thinking.get(&message.role).map(String::as_str) == Some(id) {
            self.thinking.remove(&message.role);
        }
        Some(message)
    }

    /// Id of the role's current thinking message, if any.
    pub fn thinking_id(&self, role: Role) -> Option<&str> {
        self.thinking.get(&role).map(String::as_str)
    }

    /// Remove the role's thinking message entirely, if any.
    pub fn remove_thinking(&mut self, role: Role) -> Option<DialogueMessage> {
        let id = self.thinking.get(&role)?.clone();
        self.remove(&id)
    }

    /// Look up a message by id.
    pub fn get(&self, id: &str) -> Option<&DialogueMessage> {
        self.by_id.get(id)
    }

    /// All messages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DialogueMessage> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// The trailing window of settled conversation turns sent with the next
    /// generation request: the last `limit` user/assistant messages whose
    /// status is `Done` or `TtsStreaming`.
    ///
    /// A `TtsStreaming` assistant message (text final, audio still playing)
    /// is deliberately included; the previous turn counts as history even
    /// before its stream fully settles.
    pub fn history_window(&self, limit: usize) -> Vec<HistoryTurn> {
        let mut turns: Vec<HistoryTurn> = self
            .iter()
            .filter(|m| {
                matches!(m.role, Role::User | Role::Assistant)
                    && matches!(m.status, MessageStatus::Done | MessageStatus::TtsStreaming)
            })
            .map(|m| HistoryTurn {
                role: match m.role {
                    Role::User => "user",
                    _ => "assistant",
                },
                content: m.text.clone(),
            })
            .collect();
        if turns.len() > limit {
            turns.drain(..turns.len() - limit);
        }
        turns
    }

    /// The session's own turns for save-history: user/assistant messages in
    /// `Done` or `TtsStreaming` status, excluding restored ones.
    pub fn save_projection(&self) -> Vec<SavedTurn> {
        self.iter()
            .filter(|m| {
                !m.restored
                    && matches!(m.role, Role::User | Role::Assistant)
                    && matches!(m.status, MessageStatus::Done | MessageStatus::TtsStreaming)
            })
            .map(|m| SavedTurn {
                role: match m.role {
                    Role::User => "USER",
                    _ => "AGENT",
                },
                text: m.text.clone(),
            })
            .collect()
    }
}
