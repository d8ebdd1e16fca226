//! Per-target report jobs.
//!
//! Each target with at least one rule has exactly one recurring job. A tick
//! drains the buffers of every rule delivering into the target, merges them
//! per source and sends one report (or a "no activity" notice).

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::{ChatId, Subscription, SubscriptionId},
    messaging::types::truncate_chars,
    service::ForwardService,
    Result,
};

const FALLBACK_ITEM_CHARS: usize = 300;
const REPORT_SYSTEM_PROMPT: &str =
    "You write concise activity reports for people monitoring chat groups.";

struct JobEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Scheduled report jobs keyed by target.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: HashMap<ChatId, JobEntry>,
}

impl JobTable {
    /// Start a job for `target` unless one exists. Returns whether a job was
    /// started.
    pub(crate) fn ensure(
        &mut self,
        target: ChatId,
        spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>,
    ) -> bool {
        if self.jobs.contains_key(&target) {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = spawn(cancel.clone());
        self.jobs.insert(target, JobEntry { cancel, handle });
        true
    }

    /// Signal the job to stop after its current tick. The task is not
    /// aborted: a repair may be running inside that very tick.
    pub(crate) fn cancel(&mut self, target: ChatId) -> bool {
        match self.jobs.remove(&target) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        self.jobs
            .drain()
            .map(|(_, job)| {
                job.cancel.cancel();
                job.handle
            })
            .collect()
    }

    pub(crate) fn has(&self, target: ChatId) -> bool {
        self.jobs.contains_key(&target)
    }

    pub(crate) fn targets(&self) -> Vec<ChatId> {
        let mut out: Vec<ChatId> = self.jobs.keys().copied().collect();
        out.sort();
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDigest {
    pub source: ChatId,
    pub display_name: String,
    pub items: Vec<String>,
}

/// Everything drained for one target in one tick, merged per source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Digest {
    pub sections: Vec<SourceDigest>,
}

impl Digest {
    pub fn merge(
        subs: &[Subscription],
        mut drained: HashMap<SubscriptionId, Vec<String>>,
    ) -> Self {
        let mut by_source: BTreeMap<ChatId, SourceDigest> = BTreeMap::new();
        for sub in subs {
            let Some(items) = drained.remove(&sub.id) else {
                continue;
            };
            by_source
                .entry(sub.source)
                .or_insert_with(|| SourceDigest {
                    source: sub.source,
                    display_name: sub.display_name.clone(),
                    items: Vec::new(),
                })
                .items
                .extend(items);
        }
        Self {
            sections: by_source.into_values().filter(|s| !s.items.is_empty()).collect(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickOutcome {
    pub items: usize,
    pub sources: Vec<String>,
    pub text: String,
}

pub fn format_window(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => format!("{} ms", d.as_millis()),
        s if s % 3600 == 0 => format!("{} h", s / 3600),
        s if s % 60 == 0 => format!("{} min", s / 60),
        s => format!("{s} s"),
    }
}

pub fn no_activity_notice(window: Duration) -> String {
    format!("📭 No new messages in the last {}.", format_window(window))
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "message"
    } else {
        "messages"
    }
}

pub fn report_header(digest: &Digest, window: Duration) -> String {
    let mut out = format!("📊 Activity report for the last {}", format_window(window));
    for s in &digest.sections {
        let n = s.items.len();
        out.push_str(&format!("\n\"{}\": {n} {}", s.display_name, plural(n)));
    }
    out
}

pub fn report_prompt(digest: &Digest, window: Duration, language: &str) -> String {
    let mut out = format!(
        "Summarize the chat activity below from the last {} in {language}. \
         Keep one section per source, lead with the most important updates and \
         skip small talk.\n",
        format_window(window)
    );
    for s in &digest.sections {
        let n = s.items.len();
        out.push_str(&format!("\nSource \"{}\" ({n} {}):\n", s.display_name, plural(n)));
        for (i, item) in s.items.iter().enumerate() {
            out.push_str(&format!("{}. {item}\n", i + 1));
        }
    }
    out
}

/// Plain listing used when no completion service is available or it fails.
pub fn fallback_report(digest: &Digest) -> String {
    let mut out = String::new();
    for s in &digest.sections {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("\"{}\":\n", s.display_name));
        for item in &s.items {
            out.push_str(&format!("• {}\n", truncate_chars(item, FALLBACK_ITEM_CHARS)));
        }
    }
    out.trim_end().to_string()
}

impl ForwardService {
    /// One aggregation tick for `target`.
    pub async fn run_tick(&self, target: ChatId) -> Result<TickOutcome> {
        let window = self.inner.cfg.report_interval;
        let digest = {
            let st = self.inner.state.lock().await;
            let subs = st.store.for_target(target);
            let drained = self.inner.buffers.drain(subs.iter().map(|s| &s.id));
            Digest::merge(&subs, drained)
        };

        let text = if digest.is_empty() {
            no_activity_notice(window)
        } else {
            let body = self.render_report(&digest, window).await;
            format!("{}\n\n{body}", report_header(&digest, window))
        };

        let delivered_to = self.deliver_text(target, &text).await?;
        info!(
            target = %delivered_to,
            items = digest.item_count(),
            sources = digest.sections.len(),
            "report sent"
        );

        Ok(TickOutcome {
            items: digest.item_count(),
            sources: digest
                .sections
                .iter()
                .map(|s| s.display_name.clone())
                .collect(),
            text,
        })
    }

    async fn render_report(&self, digest: &Digest, window: Duration) -> String {
        let Some(completion) = &self.inner.completion else {
            return fallback_report(digest);
        };
        let prompt = report_prompt(digest, window, &self.inner.cfg.report_language);
        let budget = self.inner.cfg.network_timeout.saturating_mul(3);
        match tokio::time::timeout(budget, completion.infer(&prompt, Some(REPORT_SYSTEM_PROMPT)))
            .await
        {
            Ok(Ok(c)) => {
                let text = c.into_text();
                if text.trim().is_empty() {
                    fallback_report(digest)
                } else {
                    text
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "report completion failed, sending plain listing");
                fallback_report(digest)
            }
            Err(_) => {
                warn!("report completion timed out, sending plain listing");
                fallback_report(digest)
            }
        }
    }

    pub(crate) fn ensure_job(&self, st: &mut crate::service::ServiceState, target: ChatId) {
        let svc = self.clone();
        let started = st.jobs.ensure(target, move |cancel| {
            tokio::spawn(async move { svc.job_loop(target, cancel).await })
        });
        if started {
            info!(%target, "report job scheduled");
        }
    }

    pub async fn has_job(&self, target: ChatId) -> bool {
        self.inner.state.lock().await.jobs.has(target)
    }

    async fn job_loop(self, target: ChatId, cancel: CancellationToken) {
        let period = self.inner.cfg.report_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(period) => {}
            }
            if let Err(e) = self.run_tick(target).await {
                warn!(%target, error = %e, "report tick failed");
            }
        }
        debug!(%target, "report job exited");
    }
}
