use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CompletionRequest, LanguageModel, LlmError, Message};

/// Embedding input is cut to this many characters.
const MAX_EMBEDDING_CHARS: usize = 8000;

/// OpenAI chat completions and embeddings over HTTPS.
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str, model: &str, embedding_model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            embedding_model: embedding_model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {body}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Message, LlmError> {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": request.messages,
        });
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(|t| t.to_openai()).collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        let parsed: CompletionResponse = self
            .post("/chat/completions", &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(LlmError::Empty)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let input: String = text.chars().take(MAX_EMBEDDING_CHARS).collect();
        let body = json!({
            "model": self.embedding_model,
            "input": input,
        });

        let parsed: EmbeddingResponse = self
            .post("/embeddings", &body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or(LlmError::Empty)
    }
}
