use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod openai;

pub const MODEL_GPT35_TURBO: &str = "gpt-3.5-turbo";
pub const MODEL_GPT4: &str = "gpt-4";
pub const MODEL_EMBEDDING_ADA002: &str = "text-embedding-ada-002";

/// One role-tagged entry of a chat-completions request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn new(role: &str, content: impl Into<String>) -> Self {
        ChatMessage {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatDelta {
    pub role: Option<String>,
    pub text_delta: String,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// When set, the provider is asked for structured output matching this
    /// JSON schema (single-object response, no streaming).
    pub json_schema: Option<serde_json::Value>,
}

impl ChatOptions {
    pub fn new(model: &str, max_tokens: u32, temperature: f32) -> Self {
        ChatOptions {
            model: model.to_string(),
            max_tokens,
            temperature,
            json_schema: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Monetary amount in US dollars.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Price(pub f64);

impl Price {
    pub const ZERO: Price = Price(0.0);
}

impl std::ops::Add for Price {
    type Output = Price;
    fn add(self, rhs: Price) -> Price {
        Price(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Price {
    fn add_assign(&mut self, rhs: Price) {
        self.0 += rhs.0;
    }
}

/// Dollar cost of a call, from per-1K-token list prices.
pub fn cost(model: &str, usage: TokenUsage) -> Price {
    let (prompt_per_1k, completion_per_1k) = match model {
        MODEL_GPT35_TURBO => (0.0015, 0.002),
        MODEL_GPT4 => (0.03, 0.06),
        MODEL_EMBEDDING_ADA002 => (0.0001, 0.0),
        _ => (0.0, 0.0),
    };
    Price(
        f64::from(usage.prompt_tokens) / 1000.0 * prompt_per_1k
            + f64::from(usage.completion_tokens) / 1000.0 * completion_per_1k,
    )
}

/// Crude model-calibrated token estimate. Good enough for budgeting and cost
/// accounting; exact counts are the billing system's problem.
pub fn token_count(text: &str, _model: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

pub fn chat_token_count(messages: &[ChatMessage], model: &str) -> u32 {
    // Each message carries a small framing overhead on the wire.
    messages
        .iter()
        .map(|m| token_count(&m.content, model) + 4)
        .sum()
}

/// Result of one completion call. `usage` is the wire-reported usage when the
/// server sends one, otherwise an estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Text-completion backend. Streaming implementations must forward every
/// delta to `on_delta` as it arrives; an error returned from the callback
/// aborts the stream (cancellation path).
pub trait CompletionProvider {
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
    ) -> Result<Completion>;

    fn complete(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<Completion>;
}

/// Connection settings for the completion + embedding backends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_chat_model() -> String {
    MODEL_GPT35_TURBO.to_string()
}

fn default_embedding_model() -> String {
    MODEL_EMBEDDING_ADA002.to_string()
}

fn default_temperature() -> f32 {
    0.75
}
