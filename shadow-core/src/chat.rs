//! Chat channel: messages arrive in any order and are presented by creation time.

use serde::{Deserialize, Serialize};

use crate::identity::{random_suffix, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from_peer_id: NodeId,
    pub text: String,
    /// Milliseconds since the Unix epoch, as stamped by the author.
    pub created_at: i64,
}

impl ChatMessage {
    /// `via` is the node the message arrived from (the author itself for local messages).
    pub fn new(via: &NodeId, from_peer_id: NodeId, text: String, created_at: i64) -> Self {
        Self {
            id: format!("{}-{}-{}", via, created_at, random_suffix()),
            from_peer_id,
            text,
            created_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Messages sorted by `created_at`; arrival order breaks ties.
    pub fn sorted(&self) -> Vec<&ChatMessage> {
        let mut out: Vec<&ChatMessage> = self.messages.iter().collect();
        out.sort_by_key(|m| m.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
