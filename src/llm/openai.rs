use std::io::{BufRead, BufReader, Read};

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use reqwest::header;
use serde::Serialize;
use serde_json::Value;

use super::{
    chat_token_count, token_count, ChatDelta, ChatMessage, ChatOptions, Completion,
    CompletionProvider, TokenUsage,
};

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    fn send(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        stream: bool,
    ) -> Result<reqwest::blocking::Response> {
        let response_format = opts.json_schema.as_ref().map(|schema| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": schema,
            })
        });
        let req = ChatCompletionsRequest {
            model: &opts.model,
            messages,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            stream,
            response_format,
        };

        let resp = self
            .client
            .post(chat_completions_url(&self.base_url))
            .bearer_auth(&self.api_key)
            .header(
                header::ACCEPT,
                if stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .json(&req)
            .send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("chat completions request failed: HTTP {status} {body}"));
        }
        Ok(resp)
    }
}

impl CompletionProvider for OpenAiCompatibleProvider {
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
    ) -> Result<Completion> {
        let resp = self.send(messages, opts, true)?;

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let parsed = if content_type.contains("text/event-stream") {
            read_chat_completions_sse(resp, on_delta)?
        } else {
            read_chat_completions_json(resp, on_delta)?
        };

        Ok(finish_completion(parsed, messages, opts))
    }

    fn complete(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<Completion> {
        let resp = self.send(messages, opts, false)?;
        let parsed = read_chat_completions_json(resp, &mut |_| Ok(()))?;
        if parsed.text.is_empty() {
            return Err(anyhow!("chat completions response has no text"));
        }
        Ok(finish_completion(parsed, messages, opts))
    }
}

/// Text and (optional) wire-reported usage accumulated from one response.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedCompletion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

fn finish_completion(
    parsed: ParsedCompletion,
    messages: &[ChatMessage],
    opts: &ChatOptions,
) -> Completion {
    let usage = parsed.usage.unwrap_or_else(|| TokenUsage {
        prompt_tokens: chat_token_count(messages, &opts.model),
        completion_tokens: token_count(&parsed.text, &opts.model),
    });
    Completion {
        text: parsed.text,
        usage,
    }
}

fn extract_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(extract_text).collect(),
        Value::Object(map) => {
            let text = map.get("text").map(extract_text).unwrap_or_default();
            if !text.is_empty() {
                return text;
            }
            map.get("content").map(extract_text).unwrap_or_default()
        }
        _ => String::new(),
    }
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    })
}

fn extract_role(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/delta/role")
        .or_else(|| value.pointer("/choices/0/message/role"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn extract_delta_text(value: &Value) -> String {
    for pointer in ["/choices/0/delta/content", "/choices/0/message/content"] {
        if let Some(content) = value.pointer(pointer) {
            let out = extract_text(content);
            if !out.is_empty() {
                return out;
            }
        }
    }
    String::new()
}

/// Parses a `text/event-stream` chat-completions body, forwarding each text
/// delta to `on_delta` and returning the accumulated completion.
pub fn read_chat_completions_sse(
    reader: impl Read,
    on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
) -> Result<ParsedCompletion> {
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    let mut data_lines: Vec<String> = Vec::new();
    let mut out = ParsedCompletion::default();
    let mut done = false;

    fn flush(
        data_lines: &mut Vec<String>,
        out: &mut ParsedCompletion,
        on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
    ) -> Result<bool> {
        if data_lines.is_empty() {
            return Ok(false);
        }
        let payload = data_lines.join("\n");
        data_lines.clear();

        if payload.trim() == "[DONE]" {
            on_delta(ChatDelta {
                role: None,
                text_delta: String::new(),
                done: true,
            })?;
            return Ok(true);
        }

        let value: Value = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };

        if let Some(usage) = extract_usage(&value) {
            out.usage = Some(usage);
        }

        let role = extract_role(&value);
        let text_delta = extract_delta_text(&value);
        if role.is_none() && text_delta.is_empty() {
            return Ok(false);
        }
        out.text.push_str(&text_delta);
        on_delta(ChatDelta {
            role,
            text_delta,
            done: false,
        })?;
        Ok(false)
    }

    loop {
        line.clear();
        if buf_reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end();

        if trimmed.is_empty() {
            if flush(&mut data_lines, &mut out, on_delta)? {
                done = true;
            }
            continue;
        }
        if trimmed.starts_with(':') || trimmed.starts_with("event:") {
            continue;
        }
        if let Some(v) = trimmed.strip_prefix("data:") {
            data_lines.push(v.trim_start().to_string());
        }
    }

    if flush(&mut data_lines, &mut out, on_delta)? {
        done = true;
    }
    if !done {
        // Stream ended without [DONE]; still signal completion to the caller.
        on_delta(ChatDelta {
            role: None,
            text_delta: String::new(),
            done: true,
        })?;
    }

    Ok(out)
}

/// Parses a plain JSON chat-completions body, emitting it as one delta plus a
/// final done event.
pub fn read_chat_completions_json(
    reader: impl Read,
    on_delta: &mut dyn FnMut(ChatDelta) -> Result<()>,
) -> Result<ParsedCompletion> {
    let root: Value = serde_json::from_reader(reader)?;

    let role = extract_role(&root);
    let text = extract_delta_text(&root);

    if role.is_none() && text.is_empty() {
        return Err(anyhow!("chat completions response has no text"));
    }

    on_delta(ChatDelta {
        role,
        text_delta: text.clone(),
        done: false,
    })?;
    on_delta(ChatDelta {
        role: None,
        text_delta: String::new(),
        done: true,
    })?;

    Ok(ParsedCompletion {
        text,
        usage: extract_usage(&root),
    })
}
