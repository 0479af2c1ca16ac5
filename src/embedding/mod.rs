use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// One computed embedding plus what the call cost.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub usage: TokenUsage,
}

/// Embedding-vector backend. Errors are per-call; batch callers must isolate
/// them rather than abort the batch.
pub trait Embedder {
    fn model_name(&self) -> &str;
    fn embed(&self, text: &str) -> Result<EmbeddingResult>;
}

pub fn embeddings_url(base_url: &str) -> String {
    format!("{}/embeddings", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingsUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsUsage {
    prompt_tokens: u32,
}

pub fn parse_embeddings_response(body: &str) -> Result<EmbeddingResult> {
    let parsed: EmbeddingsResponse =
        serde_json::from_str(body).map_err(|e| anyhow!("invalid embeddings json: {e}"))?;

    let mut data = parsed.data;
    if data.len() != 1 {
        return Err(anyhow!("expected 1 embedding, got {}", data.len()));
    }
    let vector = data.remove(0).embedding;
    if vector.is_empty() {
        return Err(anyhow!("embedding service returned an empty vector"));
    }

    Ok(EmbeddingResult {
        vector,
        usage: TokenUsage {
            prompt_tokens: parsed.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: 0,
        },
    })
}

pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model_name: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: String, api_key: String, model_name: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model_name,
        }
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, text: &str) -> Result<EmbeddingResult> {
        let req = EmbeddingsRequest {
            model: &self.model_name,
            input: [text],
            encoding_format: "float",
        };

        let resp = self
            .client
            .post(embeddings_url(&self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("embeddings request failed: HTTP {status} {body}"));
        }

        parse_embeddings_response(&resp.text()?)
    }
}
