//! On-demand history: forward recent messages of a chat and analyse them.

use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::{
    domain::ChatId,
    errors::{Error, ResolveError},
    service::ForwardService,
    source::HistoryMessage,
    Result,
};

const ANALYSIS_SYSTEM_PROMPT: &str =
    "You analyse chat messages: summarize what was discussed, then answer the user's question \
     using only the messages given.";
const DEFAULT_QUESTION: &str = "What was discussed?";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryOutcome {
    pub source: ChatId,
    pub display_name: String,
    pub forwarded: usize,
    pub analysis: Option<String>,
}

pub fn format_history_item(
    display_name: &str,
    sender: Option<&str>,
    sent_at: DateTime<Utc>,
    text: &str,
) -> String {
    format!(
        "📜 History from \"{display_name}\":\nSender: {}\nSent: {}\nContent:\n{text}",
        sender.unwrap_or("unknown"),
        sent_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

pub fn analysis_prompt(items: &[String], question: &str) -> String {
    let mut out = String::from("Below is a list of chat messages.\n\nMessages:\n");
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. {item}\n", i + 1));
    }
    out.push_str(&format!("\nQuestion:\n{question}"));
    out
}

impl ForwardService {
    /// Forward up to `limit` recent messages of `reference` into `target`,
    /// oldest first, then answer `question` about them.
    ///
    /// A `limit` of 0 uses the configured default.
    pub async fn history(
        &self,
        reference: &str,
        target: ChatId,
        limit: usize,
        question: Option<&str>,
    ) -> Result<HistoryOutcome> {
        let resolved = self.inner.resolver.resolve(reference).await?;
        let limit = if limit == 0 {
            self.inner.cfg.history_limit
        } else {
            limit
        };

        let mut messages: Vec<HistoryMessage> = match timeout(
            self.inner.cfg.network_timeout,
            self.inner.source.fetch_recent(resolved.source, limit),
        )
        .await
        {
            Ok(r) => r?,
            Err(_) => {
                return Err(Error::Resolve(ResolveError::Transient(format!(
                    "fetching history of {} timed out",
                    resolved.source
                ))))
            }
        };
        messages.sort_by_key(|m| m.sent_at);

        let pacing = self.inner.cfg.history_pacing;
        let mut target = target;
        let mut items = Vec::new();
        for msg in &messages {
            let Some(text) = msg.text.as_deref().filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let body =
                format_history_item(&resolved.display_name, msg.sender.as_deref(), msg.sent_at, text);
            target = self.deliver_text(target, &body).await?;
            items.push(text.to_string());
            if !pacing.is_zero() {
                sleep(pacing).await;
            }
        }
        info!(source = %resolved.source, forwarded = items.len(), "history forwarded");

        let analysis = match &self.inner.completion {
            Some(completion) if !items.is_empty() => {
                let question = question
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .unwrap_or(DEFAULT_QUESTION);
                let prompt = analysis_prompt(&items, question);
                let budget = self.inner.cfg.network_timeout.saturating_mul(3);
                match timeout(budget, completion.infer(&prompt, Some(ANALYSIS_SYSTEM_PROMPT)))
                    .await
                {
                    Ok(Ok(c)) => {
                        let text = c.into_text();
                        self.deliver_text(target, &format!("🔍 Analysis:\n\n{text}"))
                            .await?;
                        Some(text)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "history analysis failed");
                        None
                    }
                    Err(_) => {
                        warn!(?budget, "history analysis timed out");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(HistoryOutcome {
            source: resolved.source,
            display_name: resolved.display_name,
            forwarded: items.len(),
            analysis,
        })
    }
}
