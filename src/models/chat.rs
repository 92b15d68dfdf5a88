use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub is_error: bool,
}

/// Question sent to the backend chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

/// Session-held conversation. Append-only until explicitly cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChatTranscript {
    turns: Vec<ChatTurn>,
}

impl ChatTranscript {
    pub fn push_user(&mut self, text: &str) {
        self.turns.push(ChatTurn {
            role: ChatRole::User,
            text: text.to_string(),
            timestamp: Utc::now(),
            model: None,
            tokens_used: None,
            is_error: false,
        });
    }

    pub fn push_reply(&mut self, reply: &ChatReply) {
        self.turns.push(ChatTurn {
            role: ChatRole::Assistant,
            text: reply.reply.clone(),
            timestamp: Utc::now(),
            model: reply.model.clone(),
            tokens_used: reply.tokens_used,
            is_error: false,
        });
    }

    pub fn push_error(&mut self, message: &str) {
        self.turns.push(ChatTurn {
            role: ChatRole::Assistant,
            text: message.to_string(),
            timestamp: Utc::now(),
            model: None,
            tokens_used: None,
            is_error: true,
        });
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
