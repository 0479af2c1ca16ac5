use anyhow::{anyhow, Result};

use ragchat::embedding::{Embedder, EmbeddingResult};
use ragchat::live::{Channel, LiveBroker};
use ragchat::llm::{
    ChatDelta, ChatMessage, ChatOptions, Completion, CompletionProvider, Price, TokenUsage,
    MODEL_EMBEDDING_ADA002, MODEL_GPT35_TURBO,
};
use ragchat::model::{MessageRole, MessageState};
use ragchat::rollforward::{self, RollforwardWorker};
use ragchat::store;

struct FakeEmbedder;

impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        MODEL_EMBEDDING_ADA002
    }

    fn embed(&self, text: &str) -> Result<EmbeddingResult> {
        // Deterministic 3-dim vector derived from the text.
        let sum: u32 = text.bytes().map(u32::from).sum();
        Ok(EmbeddingResult {
            vector: vec![sum as f32, text.len() as f32, 1.0],
            usage: TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 0,
            },
        })
    }
}

struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        MODEL_EMBEDDING_ADA002
    }

    fn embed(&self, _text: &str) -> Result<EmbeddingResult> {
        Err(anyhow!("embedding service is down"))
    }
}

/// Streams `reply` in two chunks; answers title requests with `title_json`.
struct FakeProvider {
    reply: String,
    title_json: String,
}

impl FakeProvider {
    fn new(reply: &str) -> FakeProvider {
        FakeProvider {
            reply: reply.to_string(),
            title_json: r#"{"title": "Quick Hello"}"#.to_string(),
        }
    }
}

impl CompletionProvider for FakeProvider {
    fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
        on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
    ) -> Result<Completion> {
        let mid = self.reply.len() / 2;
        for chunk in [&self.reply[..mid], &self.reply[mid..]] {
            on_delta(ChatDelta {
                role: None,
                text_delta: chunk.to_string(),
                done: false,
            })?;
        }
        on_delta(ChatDelta {
            role: None,
            text_delta: String::new(),
            done: true,
        })?;
        Ok(Completion {
            text: self.reply.clone(),
            usage: TokenUsage {
                prompt_tokens: 40,
                completion_tokens: 10,
            },
        })
    }

    fn complete(&self, _messages: &[ChatMessage], _opts: &ChatOptions) -> Result<Completion> {
        Ok(Completion {
            text: self.title_json.clone(),
            usage: TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 4,
            },
        })
    }
}

/// Emits part of an answer, then dies mid-stream.
struct ErrorProvider;

impl CompletionProvider for ErrorProvider {
    fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
        on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
    ) -> Result<Completion> {
        on_delta(ChatDelta {
            role: None,
            text_delta: "I was about to".to_string(),
            done: false,
        })?;
        Err(anyhow!("connection reset"))
    }

    fn complete(&self, _messages: &[ChatMessage], _opts: &ChatOptions) -> Result<Completion> {
        Err(anyhow!("connection reset"))
    }
}

fn worker<'a>(
    embedder: &'a dyn Embedder,
    provider: &'a dyn CompletionProvider,
    live: &'a LiveBroker,
) -> RollforwardWorker<'a> {
    RollforwardWorker {
        embedder,
        provider,
        live,
        chat_model: MODEL_GPT35_TURBO.to_string(),
        temperature: 0.75,
    }
}

#[test]
fn send_user_message_creates_user_turn_and_pending_bot_turn() {
    let mut conn = store::open_in_memory().unwrap();

    let (chat, pending) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();

    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    assert_eq!(cc.turns.len(), 2);
    assert_eq!(cc.turns[0].role, MessageRole::User);
    assert_eq!(cc.turns[0].versions[0].text, "Hello there");
    assert_eq!(cc.turns[0].versions[0].state, MessageState::Finished);
    assert_eq!(cc.turns[1].role, MessageRole::Bot);
    assert_eq!(cc.turns[1].versions[0].id, pending.id);
    assert_eq!(cc.turns[1].versions[0].state, MessageState::Pending);
}

#[test]
fn send_user_message_rejects_blank_and_oversized_text() {
    let mut conn = store::open_in_memory().unwrap();

    assert!(rollforward::send_user_message(&mut conn, "acc", "alice", None, "   ").is_err());
    let huge = "x".repeat(64 * 1024);
    assert!(rollforward::send_user_message(&mut conn, "acc", "alice", None, &huge).is_err());
}

#[test]
fn send_user_message_enforces_chat_ownership() {
    let mut conn = store::open_in_memory().unwrap();
    let (chat, _) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "mine").unwrap();

    let err = rollforward::send_user_message(&mut conn, "acc", "bob", Some(&chat.id), "not mine");
    assert!(err.is_err());
    let err = rollforward::send_user_message(&mut conn, "other", "alice", Some(&chat.id), "nope");
    assert!(err.is_err());
}

#[test]
fn rollforward_embeds_answers_and_titles_a_new_chat() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;
    let provider = FakeProvider::new("General Kenobi!");
    let worker = worker(&embedder, &provider, &live);

    let (chat, pending) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();
    worker.run(&mut conn, &chat.id).unwrap();

    let (chat, cc) = store::read_tx(&mut conn, |tx| {
        Ok((
            store::get_chat(tx, &chat.id)?.unwrap(),
            store::get_chat_content(tx, &chat.id)?.unwrap(),
        ))
    })
    .unwrap();

    // Backfill: the user message now carries an embedding.
    assert!(cc.turns[0].versions[0].embedding.is_some());

    // Generation: the pending message finished with the streamed text.
    let bot = cc.turns[1].last_message().unwrap();
    assert_eq!(bot.id, pending.id);
    assert_eq!(bot.state, MessageState::Finished);
    assert_eq!(bot.text, "General Kenobi!");

    // Cost accrued from embedding + completion + title usage.
    assert!(chat.cost > Price::ZERO);

    // Title landed and the regen flag is clear.
    assert_eq!(chat.title, "Quick Hello");
    assert!(chat.title_generated);
    assert!(!chat.title_regen_requested);
    assert!(!chat.needs_title());

    // Live: streamed deltas were published transiently, the final message
    // durably, and the title went to the owner's nav view.
    let channel = Channel::chat(&chat.id);
    let burst = live.latest_transient(&channel, &pending.id).unwrap();
    assert_eq!(burst.payload["text"], "General Kenobi!");
    assert_eq!(live.last_event_id(&channel), 1);
    let finals = live.catch_up(&channel, 0);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].payload["state"], "finished");
    assert_eq!(live.last_event_id(&Channel::nav("alice")), 1);
    assert_eq!(live.last_event_id(&Channel::nav("mod:acc")), 1);
}

#[test]
fn embedding_failure_is_isolated_and_retried_on_the_next_run() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let provider = FakeProvider::new("Still answering.");

    let (chat, _) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();

    let failing = FailingEmbedder;
    worker(&failing, &provider, &live)
        .run(&mut conn, &chat.id)
        .unwrap();

    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    // The answer still finished; only the embedding is missing.
    assert!(cc.turns[0].versions[0].embedding.is_none());
    assert_eq!(
        cc.turns[1].last_message().unwrap().state,
        MessageState::Finished
    );

    let working = FakeEmbedder;
    worker(&working, &provider, &live)
        .run(&mut conn, &chat.id)
        .unwrap();

    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    assert!(cc.turns[0].versions[0].embedding.is_some());
}

#[test]
fn provider_failure_marks_the_message_failed() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;
    let provider = ErrorProvider;
    let worker = worker(&embedder, &provider, &live);

    let (chat, pending) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();
    worker.run(&mut conn, &chat.id).unwrap();

    let (chat, cc) = store::read_tx(&mut conn, |tx| {
        Ok((
            store::get_chat(tx, &chat.id)?.unwrap(),
            store::get_chat_content(tx, &chat.id)?.unwrap(),
        ))
    })
    .unwrap();

    let bot = cc.turns[1].last_message().unwrap();
    assert_eq!(bot.id, pending.id);
    assert_eq!(bot.state, MessageState::Failed);
    assert_eq!(bot.text, "");

    // The partial stream still costs money (estimated usage).
    assert!(chat.cost > Price::ZERO);

    // The failed state was published durably.
    let finals = live.catch_up(&Channel::chat(&chat.id), 0);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].payload["state"], "failed");
}

#[test]
fn empty_completion_marks_the_message_failed() {
    struct EmptyProvider;
    impl CompletionProvider for EmptyProvider {
        fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _opts: &ChatOptions,
            on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
        ) -> Result<Completion> {
            on_delta(ChatDelta {
                role: None,
                text_delta: String::new(),
                done: true,
            })?;
            Ok(Completion {
                text: "   ".to_string(),
                usage: TokenUsage::default(),
            })
        }
        fn complete(&self, _messages: &[ChatMessage], _opts: &ChatOptions) -> Result<Completion> {
            Err(anyhow!("nope"))
        }
    }

    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;
    let provider = EmptyProvider;
    let worker = worker(&embedder, &provider, &live);

    let (chat, _) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();
    worker.run(&mut conn, &chat.id).unwrap();

    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    assert_eq!(
        cc.turns[1].last_message().unwrap().state,
        MessageState::Failed
    );
}

#[test]
fn run_with_nothing_pending_is_a_noop() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;
    let provider = FakeProvider::new("Done already.");
    let worker = worker(&embedder, &provider, &live);

    let (chat, _) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();
    worker.run(&mut conn, &chat.id).unwrap();

    let before = store::read_tx(&mut conn, |tx| {
        Ok((
            store::get_chat(tx, &chat.id)?.unwrap(),
            store::get_chat_content(tx, &chat.id)?.unwrap(),
        ))
    })
    .unwrap();
    let nav_ids_before = live.last_event_id(&Channel::nav("alice"));

    worker.run(&mut conn, &chat.id).unwrap();

    let after = store::read_tx(&mut conn, |tx| {
        Ok((
            store::get_chat(tx, &chat.id)?.unwrap(),
            store::get_chat_content(tx, &chat.id)?.unwrap(),
        ))
    })
    .unwrap();
    assert_eq!(before, after);
    assert_eq!(live.last_event_id(&Channel::nav("alice")), nav_ids_before);
}

#[test]
fn run_on_a_missing_chat_is_a_noop() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;
    let provider = FakeProvider::new("n/a");
    worker(&embedder, &provider, &live)
        .run(&mut conn, "no-such-chat")
        .unwrap();
}

#[test]
fn regenerate_appends_a_version_and_rollforward_fills_it() {
    let mut conn = store::open_in_memory().unwrap();
    let live = LiveBroker::new();
    let embedder = FakeEmbedder;

    let (chat, first_pending) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();
    let provider = FakeProvider::new("Take one.");
    worker(&embedder, &provider, &live)
        .run(&mut conn, &chat.id)
        .unwrap();

    let fresh =
        rollforward::regenerate_bot_message(&mut conn, &chat.id, &first_pending.id).unwrap();
    assert_ne!(fresh.id, first_pending.id);

    let provider = FakeProvider::new("Take two.");
    worker(&embedder, &provider, &live)
        .run(&mut conn, &chat.id)
        .unwrap();

    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    let turn = &cc.turns[1];
    assert_eq!(turn.versions.len(), 2);
    assert_eq!(turn.versions[0].text, "Take one.");
    assert_eq!(turn.versions[1].id, fresh.id);
    assert_eq!(turn.versions[1].state, MessageState::Finished);
    assert_eq!(turn.versions[1].text, "Take two.");
}

#[test]
fn regenerate_rejects_pending_and_user_messages() {
    let mut conn = store::open_in_memory().unwrap();
    let (chat, pending) =
        rollforward::send_user_message(&mut conn, "acc", "alice", None, "Hello there").unwrap();

    // Still pending.
    assert!(rollforward::regenerate_bot_message(&mut conn, &chat.id, &pending.id).is_err());

    // User message.
    let cc = store::read_tx(&mut conn, |tx| store::get_chat_content(tx, &chat.id))
        .unwrap()
        .unwrap();
    let user_id = cc.turns[0].versions[0].id.clone();
    assert!(rollforward::regenerate_bot_message(&mut conn, &chat.id, &user_id).is_err());
}
