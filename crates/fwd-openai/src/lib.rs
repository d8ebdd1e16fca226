//! OpenAI-compatible chat completions adapter.
//!
//! Implements [`CompletionService`] against `{base_url}/chat/completions`.
//! Any server speaking that API (OpenAI, vLLM, Ollama, ...) works.

use std::time::Duration;

use async_trait::async_trait;
use fwd_core::{
    completion::{parse_completion, Completion, CompletionService},
    config::Config,
    errors::Error,
    Result,
};
use serde_json::{json, Value};
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct OpenAiCompletion {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }

    /// Build from config. `None` when no API key is configured.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        let Some(key) = cfg.openai_api_key.as_deref() else {
            return Ok(None);
        };
        Self::new(
            key,
            cfg.openai_base_url.as_str(),
            cfg.model_id.as_str(),
            cfg.network_timeout,
        )
        .map(Some)
    }

    async fn request(&self, body: &Value) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error: {e}")))?;
        extract_content(&v)
    }
}

fn request_body(model: &str, prompt: &str, system_prompt: Option<&str>) -> Value {
    let mut messages = Vec::new();
    if let Some(sys) = system_prompt.filter(|s| !s.trim().is_empty()) {
        messages.push(json!({ "role": "system", "content": sys }));
    }
    messages.push(json!({ "role": "user", "content": prompt }));
    json!({ "model": model, "messages": messages })
}

fn extract_content(v: &Value) -> Result<String> {
    let text = v
        .pointer("/choices/0/message/content")
        .and_then(|t| t.as_str())
        .unwrap_or("");
    if text.trim().is_empty() {
        return Err(Error::External(
            "openai completion returned empty content".to_string(),
        ));
    }
    Ok(text.to_string())
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn infer(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Completion> {
        let body = request_body(&self.model, prompt, system_prompt);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(&body).await {
                Ok(text) => return Ok(parse_completion(&text)),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "completion failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
