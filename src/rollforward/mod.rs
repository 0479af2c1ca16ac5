use anyhow::{anyhow, Result};
use chrono::TimeZone;
use log::{info, warn};
use rusqlite::Connection;
use serde_json::json;

use crate::context::VectorIndex;
use crate::embedding::Embedder;
use crate::jobs::JobQueue;
use crate::live::{Channel, LiveBroker};
use crate::llm::{
    self, ChatMessage, ChatOptions, CompletionProvider, Price, Settings, TokenUsage,
};
use crate::model::{Chat, ChatContent, Message, MessageRole, MessageState};
use crate::prompt;
use crate::store;

pub const JOB_PRODUCE_ANSWER: &str = "produce_answer";

pub const MAX_MESSAGE_TOKENS: u32 = 2048;

/// Queues a rollforward for the chat; concurrent triggers coalesce on the
/// chat ID.
pub fn enqueue_chat_rollforward(queue: &JobQueue, chat_id: &str) -> bool {
    queue.enqueue(JOB_PRODUCE_ANSWER, chat_id)
}

/// Appends the user's message as a new user turn plus a pending bot turn,
/// creating the chat on its first message. The caller is expected to enqueue
/// a rollforward afterwards. Returns the chat header and the pending bot
/// message.
pub fn send_user_message(
    conn: &mut Connection,
    account_id: &str,
    user_id: &str,
    chat_id: Option<&str>,
    text: &str,
) -> Result<(Chat, Message)> {
    if text.trim().is_empty() {
        return Err(anyhow!("message is empty"));
    }
    if llm::token_count(text, llm::MODEL_GPT35_TURBO) > MAX_MESSAGE_TOKENS {
        return Err(anyhow!("message too long"));
    }

    store::write_tx(conn, |tx| {
        let (chat, mut cc) = match chat_id {
            Some(id) => {
                let chat = store::get_chat(tx, id)?
                    .filter(|c| c.account_id == account_id && c.user_id == user_id)
                    .ok_or_else(|| anyhow!("chat not found: {id}"))?;
                let cc = store::get_chat_content(tx, id)?
                    .unwrap_or_else(|| ChatContent::new(id));
                (chat, cc)
            }
            None => {
                let chat = Chat::new(account_id, user_id, store::now_ms());
                let cc = ChatContent::new(&chat.id);
                (chat, cc)
            }
        };

        let user_turn = cc.append_turn(MessageRole::User);
        cc.append_user_message(user_turn, text);
        let bot_turn = cc.append_turn(MessageRole::Bot);
        let pending = cc.append_pending_bot_message(bot_turn);

        store::put_chat(tx, &chat)?;
        store::put_chat_content(tx, &cc)?;
        Ok((chat, pending))
    })
}

/// Appends a fresh pending version to the turn of a finished or failed bot
/// message. History is preserved; the new version becomes authoritative.
pub fn regenerate_bot_message(
    conn: &mut Connection,
    chat_id: &str,
    message_id: &str,
) -> Result<Message> {
    store::write_tx(conn, |tx| {
        let mut cc = store::get_chat_content(tx, chat_id)?
            .ok_or_else(|| anyhow!("chat content not found: {chat_id}"))?;

        let (turn_index, state, role) = {
            let (turn, msg) = cc
                .find_message(message_id)
                .ok_or_else(|| anyhow!("message not found: {message_id}"))?;
            (turn.index, msg.state, turn.role)
        };
        if role != MessageRole::Bot {
            return Err(anyhow!("only bot messages can be regenerated"));
        }
        if !state.is_terminal() {
            return Err(anyhow!("message {message_id} is still pending"));
        }

        let fresh = cc.append_pending_bot_message(turn_index);
        store::put_chat_content(tx, &cc)?;
        Ok(fresh)
    })
}

pub fn request_title_regen(conn: &mut Connection, chat_id: &str) -> Result<()> {
    store::write_tx(conn, |tx| {
        let mut chat = store::get_chat(tx, chat_id)?
            .ok_or_else(|| anyhow!("chat not found: {chat_id}"))?;
        chat.title_regen_requested = true;
        store::put_chat(tx, &chat)
    })
}

pub fn set_custom_title(conn: &mut Connection, chat_id: &str, title: &str) -> Result<()> {
    store::write_tx(conn, |tx| {
        let mut chat = store::get_chat(tx, chat_id)?
            .ok_or_else(|| anyhow!("chat not found: {chat_id}"))?;
        chat.title = title.to_string();
        chat.title_customized = true;
        store::put_chat(tx, &chat)
    })
}

/// What the Discover phase found to do. Computing it twice without
/// intervening writes yields the same sets.
#[derive(Clone, Debug)]
struct Discovery {
    unembedded: Vec<Message>,
    pending: Option<Message>,
    needs_title: bool,
}

pub struct RollforwardWorker<'a> {
    pub embedder: &'a dyn Embedder,
    pub provider: &'a dyn CompletionProvider,
    pub live: &'a LiveBroker,
    pub chat_model: String,
    pub temperature: f32,
}

impl<'a> RollforwardWorker<'a> {
    pub fn new(
        embedder: &'a dyn Embedder,
        provider: &'a dyn CompletionProvider,
        live: &'a LiveBroker,
        settings: &Settings,
    ) -> Self {
        RollforwardWorker {
            embedder,
            provider,
            live,
            chat_model: settings.chat_model.clone(),
            temperature: settings.temperature,
        }
    }

    /// Advances one chat's pending work to completion: embedding backfill,
    /// grounded generation, title generation. Each transactional phase is its
    /// own short transaction; the external calls happen outside any
    /// transaction. Invoked with nothing pending, this is a no-op.
    pub fn run(&self, conn: &mut Connection, chat_id: &str) -> Result<()> {
        // Phase 1: discover.
        let Some(discovery) = store::read_tx(conn, |tx| {
            let Some(chat) = store::get_chat(tx, chat_id)? else {
                return Ok(None);
            };
            let cc = store::get_chat_content(tx, chat_id)?
                .unwrap_or_else(|| ChatContent::new(chat_id));
            Ok(Some(Discovery {
                unembedded: cc
                    .unembedded_user_messages()
                    .into_iter()
                    .cloned()
                    .collect(),
                pending: cc.find_pending_bot_message().cloned(),
                needs_title: chat.needs_title(),
            }))
        })?
        else {
            warn!("rollforward for missing chat {chat_id}, skipping");
            return Ok(());
        };

        info!(
            "rollforward({chat_id}): unembedded={} pending={} needs_title={}",
            discovery.unembedded.len(),
            discovery
                .pending
                .as_ref()
                .map(|m| m.id.as_str())
                .unwrap_or("-"),
            discovery.needs_title,
        );

        if !discovery.unembedded.is_empty() {
            self.backfill_embeddings(conn, chat_id, discovery.unembedded)?;
        }

        let Discovery {
            pending,
            needs_title,
            ..
        } = discovery;
        if pending.is_none() && !needs_title {
            return Ok(());
        }

        if let Some(pending) = pending {
            self.generate_bot_message(conn, chat_id, &pending)?;
        }

        if needs_title {
            self.generate_title(conn, chat_id)?;
        }

        Ok(())
    }

    /// Phases 2-3: compute missing user-message embeddings (one external
    /// call per message, failures isolated) and commit the survivors in a
    /// separate write transaction so the network calls never hold a lock.
    fn backfill_embeddings(
        &self,
        conn: &mut Connection,
        chat_id: &str,
        mut unembedded: Vec<Message>,
    ) -> Result<()> {
        let mut spent = Price::ZERO;
        for msg in &mut unembedded {
            match self.embedder.embed(&msg.text) {
                Ok(res) => {
                    msg.embedding = Some(res.vector);
                    spent += llm::cost(self.embedder.model_name(), res.usage);
                }
                Err(err) => {
                    warn!("embedding failed for message {}: {err:#}", msg.id);
                }
            }
        }

        store::write_tx(conn, |tx| {
            let Some(mut chat) = store::get_chat(tx, chat_id)? else {
                return Ok(());
            };
            let Some(mut cc) = store::get_chat_content(tx, chat_id)? else {
                return Ok(());
            };

            chat.cost += spent;
            for msg in unembedded.iter().filter(|m| m.embedding.is_some()) {
                match cc.fresh_message(msg) {
                    Some(fresh) => {
                        if fresh.embedding.is_none() {
                            fresh.embedding = msg.embedding.clone();
                        }
                    }
                    None => {
                        warn!("message {} vanished before embedding commit", msg.id);
                    }
                }
            }

            store::put_chat(tx, &chat)?;
            store::put_chat_content(tx, &cc)
        })
    }

    /// Phases 4-6: build the grounded prompt, stream the completion while
    /// publishing deltas, then commit the final message state.
    fn generate_bot_message(
        &self,
        conn: &mut Connection,
        chat_id: &str,
        pending: &Message,
    ) -> Result<()> {
        // Phase 4: prepare (read-only).
        let Some((pres, history)) = store::read_tx(conn, |tx| {
            let Some(chat) = store::get_chat(tx, chat_id)? else {
                return Ok(None);
            };
            let Some(cc) = store::get_chat_content(tx, chat_id)? else {
                return Ok(None);
            };

            let index = VectorIndex::load(tx, &chat.account_id)?;
            let pres = prompt::build_system_prompt(
                tx,
                prompt::ANSWER_PROMPT,
                &cc,
                pending.turn_index,
                &index,
                &self.chat_model,
            )?;

            let mut history = vec![ChatMessage::system(&pres.prompt)];
            for turn in cc.turns.iter().take(pending.turn_index) {
                if let Some(msg) = turn.last_message() {
                    history.push(ChatMessage::new(msg.role.completion_role(), &msg.text));
                }
            }
            Ok(Some((pres, history)))
        })?
        else {
            warn!("chat {chat_id} vanished before generation, skipping");
            return Ok(());
        };

        // Phase 5: stream the completion, pushing each delta to live viewers.
        let opts = ChatOptions::new(&self.chat_model, prompt::MAX_RESPONSE_TOKENS, self.temperature);
        let channel = Channel::chat(chat_id);
        let mut streamed_text = String::new();
        let result = self.provider.stream_chat(&history, &opts, &mut |delta| {
            if !delta.text_delta.is_empty() {
                streamed_text.push_str(&delta.text_delta);
                self.live.publish_transient(
                    channel.clone(),
                    &pending.id,
                    json!({
                        "message_id": pending.id,
                        "chat_id": chat_id,
                        "state": "pending",
                        "text": streamed_text,
                    }),
                );
            }
            Ok(())
        });

        let (outcome, usage) = match result {
            Ok(completion) if completion.text.trim().is_empty() => {
                (Err(anyhow!("empty response from model")), completion.usage)
            }
            Ok(completion) => {
                let usage = completion.usage;
                (Ok(completion.text), usage)
            }
            Err(err) => (
                Err(err),
                TokenUsage {
                    prompt_tokens: llm::chat_token_count(&history, &self.chat_model),
                    completion_tokens: llm::token_count(&streamed_text, &self.chat_model),
                },
            ),
        };
        let spent = llm::cost(&self.chat_model, usage);
        if let Err(err) = &outcome {
            warn!("generation failed for message {}: {err:#}", pending.id);
        }

        // Phase 6: commit the final state under a fresh read of the content.
        let final_msg = store::write_tx(conn, |tx| {
            let Some(mut chat) = store::get_chat(tx, chat_id)? else {
                return Ok(None);
            };
            let Some(mut cc) = store::get_chat_content(tx, chat_id)? else {
                return Ok(None);
            };

            chat.cost += spent;

            let committed = match cc.fresh_message(pending) {
                None => {
                    warn!(
                        "bot message {} not found at generation commit, abandoning",
                        pending.id
                    );
                    None
                }
                Some(msg) if msg.state != MessageState::Pending => {
                    warn!(
                        "bot message {} already {:?} at generation commit, abandoning",
                        pending.id, msg.state
                    );
                    None
                }
                Some(msg) => {
                    match &outcome {
                        Ok(text) => {
                            msg.text = text.clone();
                            msg.transition(MessageState::Finished);
                        }
                        Err(_) => {
                            msg.transition(MessageState::Failed);
                        }
                    }
                    msg.context_content_ids = pres.context_content_ids.clone();
                    msg.context_distances = pres.context_distances.clone();
                    Some(msg.clone())
                }
            };

            store::put_chat(tx, &chat)?;
            store::put_chat_content(tx, &cc)?;
            Ok(committed)
        })?;

        if let Some(msg) = final_msg {
            self.live
                .publish_final(channel, &msg.id, serde_json::to_value(&msg)?);
        }

        Ok(())
    }

    /// Phase 7: generate a short title from the user side of the
    /// conversation, with a date-based fallback when generation fails and
    /// the chat is still untitled.
    fn generate_title(&self, conn: &mut Connection, chat_id: &str) -> Result<()> {
        let Some(history) = store::read_tx(conn, |tx| {
            let Some(cc) = store::get_chat_content(tx, chat_id)? else {
                return Ok(None);
            };
            let mut history = vec![ChatMessage::system(prompt::TITLE_SYSTEM_PROMPT)];
            for turn in &cc.turns {
                if turn.role != MessageRole::User {
                    continue;
                }
                if let Some(msg) = turn.last_message() {
                    history.push(ChatMessage::new(msg.role.completion_role(), &msg.text));
                }
            }
            Ok(Some(history))
        })?
        else {
            return Ok(());
        };

        let mut opts =
            ChatOptions::new(&self.chat_model, prompt::MAX_RESPONSE_TOKENS, self.temperature);
        opts.json_schema = Some(prompt::title_schema());

        let (new_title, spent) = match self.provider.complete(&history, &opts) {
            Ok(completion) => {
                let spent = llm::cost(&self.chat_model, completion.usage);
                match prompt::parse_title(&completion.text) {
                    Ok(title) => (Some(title), spent),
                    Err(err) => {
                        warn!("title generation failed for chat {chat_id}: {err:#}");
                        (None, spent)
                    }
                }
            }
            Err(err) => {
                warn!("title generation failed for chat {chat_id}: {err:#}");
                (None, Price::ZERO)
            }
        };

        let updated = store::write_tx(conn, |tx| {
            let Some(mut chat) = store::get_chat(tx, chat_id)? else {
                return Ok(None);
            };

            chat.cost += spent;
            if chat.title_regen_requested || !chat.title_customized {
                let mut title = new_title.clone().unwrap_or_default();
                if !title.is_empty() {
                    chat.title_generated = true;
                }
                if title.is_empty() && chat.title.is_empty() {
                    title = fallback_title(chat.created_at_ms);
                }
                if !title.is_empty() {
                    chat.title = title;
                }
            }
            chat.title_regen_requested = false;

            store::put_chat(tx, &chat)?;
            Ok(Some(chat))
        })?;

        if let Some(chat) = updated {
            self.push_chat_title(&chat);
        }
        Ok(())
    }

    /// Publishes the updated chat header to the owner's and the account
    /// moderators' navigation views.
    fn push_chat_title(&self, chat: &Chat) {
        let payload = json!({
            "chat_id": chat.id,
            "title": chat.title_with_fallback(),
            "title_generated": chat.title_generated,
        });
        self.live.publish_final(
            Channel::nav(&chat.user_id),
            &format!("title:{}", chat.id),
            payload.clone(),
        );
        self.live.publish_final(
            Channel::nav(&format!("mod:{}", chat.account_id)),
            &format!("title:{}", chat.id),
            payload,
        );
    }
}

fn fallback_title(created_at_ms: i64) -> String {
    match chrono::Utc.timestamp_millis_opt(created_at_ms) {
        chrono::LocalResult::Single(dt) => dt.format("Chat %b %d").to_string(),
        _ => "Chat".to_string(),
    }
}
