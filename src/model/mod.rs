use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::llm::Price;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "bot",
        }
    }

    /// Role string used by chat-completions requests.
    pub fn completion_role(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "assistant",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Pending,
    Finished,
    Failed,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageState::Pending)
    }

    /// The only legal transitions are pending -> finished and pending -> failed.
    pub fn can_transition_to(self, next: MessageState) -> bool {
        self == MessageState::Pending && next.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub state: MessageState,
    pub text: String,
    pub turn_id: String,
    pub turn_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_content_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_distances: Vec<f64>,
}

impl Message {
    /// Moves the message into a terminal state. Illegal transitions are
    /// programming errors and panic.
    pub fn transition(&mut self, next: MessageState) {
        if !self.state.can_transition_to(next) {
            panic!(
                "illegal message state transition {:?} -> {:?} on {}",
                self.state, next, self.id
            );
        }
        self.state = next;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub index: usize,
    pub role: MessageRole,
    pub versions: Vec<Message>,
}

impl Turn {
    /// The last version is the authoritative one for rendering.
    pub fn last_message(&self) -> Option<&Message> {
        self.versions.last()
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.versions.iter().find(|m| m.id == message_id)
    }

    pub fn is_last_message_pending(&self) -> bool {
        self.last_message()
            .is_some_and(|m| m.state == MessageState::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub account_id: String,
    pub user_id: String,
    pub cost: Price,
    pub title: String,
    pub title_customized: bool,
    pub title_generated: bool,
    pub title_regen_requested: bool,
    pub created_at_ms: i64,
}

impl Chat {
    pub fn new(account_id: &str, user_id: &str, created_at_ms: i64) -> Self {
        Chat {
            id: new_id(),
            account_id: account_id.to_string(),
            user_id: user_id.to_string(),
            cost: Price::ZERO,
            title: String::new(),
            title_customized: false,
            title_generated: false,
            title_regen_requested: false,
            created_at_ms,
        }
    }

    pub fn needs_title(&self) -> bool {
        self.title_regen_requested || (!self.title_generated && !self.title_customized)
    }

    pub fn title_with_fallback(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// Bulk conversation content, stored separately from the Chat header so that
/// fast-changing turns do not contend with header updates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContent {
    pub chat_id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl ChatContent {
    pub fn new(chat_id: &str) -> Self {
        ChatContent {
            chat_id: chat_id.to_string(),
            turns: Vec::new(),
        }
    }

    /// Appends a new turn and returns its index. Turn indexes are monotonic
    /// and assigned at creation.
    pub fn append_turn(&mut self, role: MessageRole) -> usize {
        let index = self.turns.len();
        self.turns.push(Turn {
            id: new_id(),
            index,
            role,
            versions: Vec::new(),
        });
        index
    }

    pub fn append_user_message(&mut self, turn_index: usize, text: &str) -> Message {
        let turn = &mut self.turns[turn_index];
        if turn.role != MessageRole::User {
            panic!("cannot append a user message to a {} turn", turn.role.as_str());
        }
        let msg = Message {
            id: new_id(),
            role: MessageRole::User,
            state: MessageState::Finished,
            text: text.to_string(),
            turn_id: turn.id.clone(),
            turn_index,
            embedding: None,
            context_content_ids: Vec::new(),
            context_distances: Vec::new(),
        };
        turn.versions.push(msg.clone());
        msg
    }

    pub fn append_pending_bot_message(&mut self, turn_index: usize) -> Message {
        let turn = &mut self.turns[turn_index];
        if turn.role != MessageRole::Bot {
            panic!("cannot append a bot message to a {} turn", turn.role.as_str());
        }
        let msg = Message {
            id: new_id(),
            role: MessageRole::Bot,
            state: MessageState::Pending,
            text: String::new(),
            turn_id: turn.id.clone(),
            turn_index,
            embedding: None,
            context_content_ids: Vec::new(),
            context_distances: Vec::new(),
        };
        turn.versions.push(msg.clone());
        msg
    }

    pub fn find_message(&self, message_id: &str) -> Option<(&Turn, &Message)> {
        for turn in &self.turns {
            if let Some(msg) = turn.message(message_id) {
                return Some((turn, msg));
            }
        }
        None
    }

    /// Re-resolves a message captured in an earlier transaction against this
    /// (freshly loaded) content. Returns None when the turn or version has
    /// vanished in the meantime; callers must treat that as concurrency loss,
    /// not an error.
    pub fn fresh_message(&mut self, stale: &Message) -> Option<&mut Message> {
        let turn = self.turns.get_mut(stale.turn_index)?;
        turn.versions.iter_mut().find(|m| m.id == stale.id)
    }

    /// First user turn's latest message among turns strictly before
    /// `before_turn_index`.
    pub fn first_user_message(&self, before_turn_index: usize) -> Option<&Message> {
        self.turns
            .iter()
            .take(before_turn_index)
            .find(|t| t.role == MessageRole::User)
            .and_then(Turn::last_message)
    }

    /// Most recent user turn's latest message among turns strictly before
    /// `before_turn_index`.
    pub fn latest_user_message(&self, before_turn_index: usize) -> Option<&Message> {
        self.turns
            .iter()
            .take(before_turn_index)
            .rev()
            .find(|t| t.role == MessageRole::User)
            .and_then(Turn::last_message)
    }

    /// Newest bot turn whose authoritative version is still pending.
    pub fn find_pending_bot_message(&self) -> Option<&Message> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.role == MessageRole::Bot)
            .find(|t| t.is_last_message_pending())
            .and_then(Turn::last_message)
    }

    /// Every version of every user turn that has no embedding yet.
    pub fn unembedded_user_messages(&self) -> Vec<&Message> {
        self.turns
            .iter()
            .filter(|t| t.role == MessageRole::User)
            .flat_map(|t| t.versions.iter())
            .filter(|m| m.embedding.is_none())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmbeddingType {
    TextAda002,
}

impl EmbeddingType {
    /// The embedding type new vectors are computed with; older rows of other
    /// types are ignored by retrieval.
    pub const CURRENT: EmbeddingType = EmbeddingType::TextAda002;

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingType::TextAda002 => "ada002",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ada002" => Ok(EmbeddingType::TextAda002),
            other => Err(anyhow!("unknown embedding type {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
}

/// One stored unit of account knowledge text, eligible for retrieval.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentChunk {
    pub id: String,
    pub account_id: String,
    pub item_id: String,
    pub text: String,
}

/// One vector per (content chunk, embedding type). Immutable once written;
/// re-embedding replaces the row.
#[derive(Clone, Debug, PartialEq)]
pub struct ContentEmbedding {
    pub content_id: String,
    pub embedding_type: EmbeddingType,
    pub account_id: String,
    pub item_id: String,
    pub token_count: u32,
    pub vector: Vec<f32>,
}
