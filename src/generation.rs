//! Answer generator implementations.
//!
//! - **[`DisabledGenerator`]**: fails every request with `answer_generation`.
//! - **[`ChatCompletionsGenerator`]**: any OpenAI-compatible
//!   `POST {base_url}/chat/completions` endpoint (OpenAI, NVIDIA NIM, vLLM,
//!   Ollama's OpenAI shim). Sends a single user message built from
//!   [`build_prompt`], with the same retry policy as the embedding
//!   providers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::info;

use docrag_core::embedding::{AnswerGenerator, GenerationRequest, GenerationResponse, TokenUsage};
use docrag_core::error::{Result, RetrievalError, Step};

use crate::config::GenerationConfig;
use crate::embedding::post_with_retry;

/// Build the retrieval-augmented prompt sent as the user message.
pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "Answer the question using the context below. If the context does not \
         contain the information, say that the context has no information about it.\n\n\
         Context:\n{}\n\nQuestion: {}\n\nAnswer:",
        context, question
    )
}

pub struct DisabledGenerator;

#[async_trait]
impl AnswerGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResponse> {
        Err(RetrievalError::processing(
            Step::AnswerGeneration,
            "Answer generator is disabled",
        ))
    }
}

pub struct ChatCompletionsGenerator {
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    /// The API key is optional so local OpenAI-compatible servers work
    /// without one.
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl AnswerGenerator for ChatCompletionsGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = serde_json::json!({
            "model": model,
            "messages": [
                { "role": "user", "content": build_prompt(&request.question, &request.context) }
            ],
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature.unwrap_or(self.temperature),
            "top_p": 0.9,
            "stream": false,
        });

        let json = post_with_retry(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "generator",
            Step::AnswerGeneration,
        )
        .await?;

        let response = parse_chat_response(&json, model)?;
        info!(model = %response.model, "generator responded");
        Ok(response)
    }
}

fn parse_chat_response(json: &serde_json::Value, model: &str) -> Result<GenerationResponse> {
    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            RetrievalError::processing(
                Step::AnswerGeneration,
                "invalid response format from generator",
            )
        })?;

    let token_usage = json
        .get("usage")
        .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok());

    Ok(GenerationResponse {
        text: text.trim().to_string(),
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string(),
        token_usage,
    })
}

/// Create the configured [`AnswerGenerator`].
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(ChatCompletionsGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
