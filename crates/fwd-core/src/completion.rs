//! Port for the conversational completion service (report writing, analysis).

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::Result;

/// What the service returned: plain text, or a fenced JSON block parsed out
/// of the reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Text(String),
    Json(serde_json::Value),
}

impl Completion {
    /// Render as chat text. JSON is pretty-printed.
    pub fn into_text(self) -> String {
        match self {
            Completion::Text(t) => t,
            Completion::Json(v) => serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string()),
        }
    }
}

/// The core treats the service as a black box with its own bounded retries.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn infer(&self, prompt: &str, system_prompt: Option<&str>) -> Result<Completion>;
}

fn json_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("static regex"))
}

/// Extract the first ```json fenced block; fall back to the raw text when
/// there is none or it does not parse.
pub fn parse_completion(raw: &str) -> Completion {
    let Some(caps) = json_fence().captures(raw) else {
        return Completion::Text(raw.to_string());
    };
    let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    match serde_json::from_str(body) {
        Ok(v) => Completion::Json(v),
        Err(e) => {
            tracing::warn!(error = %e, "completion contained invalid json block");
            Completion::Text(raw.to_string())
        }
    }
}
