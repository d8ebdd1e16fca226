//! Event relay: handler bindings plus the stateless forward path.
//!
//! A binding only records the route of a subscription. The forward path gets
//! a [`Route`] snapshot and never looks at shared state, so a rebinding
//! (e.g. after migration) cannot leave a handler carrying stale ids.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    dispatch::{send_with_retry, RetryPolicy},
    domain::{ChatId, Route, Subscription, SubscriptionId},
    errors::Error,
    messaging::{port::MessagingPort, types::truncate_chars},
    source::{SourceEvent, SourceNetwork},
    Result,
};

/// Binding table. At most one binding per subscription id.
#[derive(Debug, Default)]
pub struct EventRelay {
    bindings: HashMap<SubscriptionId, Route>,
}

impl EventRelay {
    /// Bind `sub`, replacing any previous binding for the same id.
    pub fn register(&mut self, sub: &Subscription) -> Option<Route> {
        self.bindings.insert(sub.id.clone(), sub.route())
    }

    pub fn unregister(&mut self, id: &SubscriptionId) -> Option<Route> {
        self.bindings.remove(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Route> {
        self.bindings.get(id)
    }

    pub fn is_watching(&self, source: ChatId) -> bool {
        self.bindings.values().any(|r| r.source == source)
    }

    pub fn serves_target(&self, target: ChatId) -> bool {
        self.bindings.values().any(|r| r.target == target)
    }

    pub fn routes_for(&self, source: ChatId) -> Vec<Route> {
        self.bindings
            .values()
            .filter(|r| r.source == source)
            .cloned()
            .collect()
    }
}

/// Collaborators of the forward path.
#[derive(Clone)]
pub struct DispatchCtx {
    pub messenger: Arc<dyn MessagingPort>,
    pub source: Arc<dyn SourceNetwork>,
    pub media_dir: PathBuf,
    pub policy: RetryPolicy,
}

pub fn format_text(display_name: &str, text: &str) -> String {
    format!("📨 Message from \"{display_name}\":\n\n{text}")
}

pub fn format_caption(display_name: &str, text: Option<&str>) -> String {
    format!(
        "📷 Photo from \"{display_name}\" | {}",
        text.unwrap_or_default()
    )
}

/// Forward one inbound event along `route`.
///
/// Errors (including `Migrated`) are returned to the caller; nothing here
/// touches subscriptions.
pub async fn forward_event(ctx: &DispatchCtx, route: &Route, event: &SourceEvent) -> Result<()> {
    let text = event.text.as_deref().filter(|t| !t.trim().is_empty());

    if let Some(text) = text {
        let body = format_text(&route.display_name, text);
        let limit = ctx.messenger.capabilities().max_message_len;
        for chunk in crate::messaging::types::split_text(&body, limit) {
            send_with_retry(
                ctx.policy,
                "forward text",
                || ctx.messenger.pace(route.target),
                || ctx.messenger.send_text(route.target, &chunk),
            )
            .await?;
        }
    }

    let Some(media) = &event.media else {
        return Ok(());
    };
    if !media.is_photo {
        debug!(source = %route.source, "skipping non-photo attachment");
        return Ok(());
    }

    let path = match timeout(
        ctx.policy.call_timeout,
        ctx.source.download_media(media, &ctx.media_dir),
    )
    .await
    {
        Ok(Ok(p)) => p,
        Ok(Err(e)) => {
            warn!(source = %route.source, error = %e, "media download failed");
            return Ok(());
        }
        Err(_) => {
            warn!(source = %route.source, "media download timed out");
            return Ok(());
        }
    };

    let max_caption = ctx.messenger.capabilities().max_caption_len;
    let caption = truncate_chars(&format_caption(&route.display_name, text), max_caption);
    let sent = send_with_retry(
        ctx.policy,
        "forward photo",
        || ctx.messenger.pace(route.target),
        || ctx.messenger.send_photo(route.target, &path, &caption),
    )
    .await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %e, "temp media cleanup failed");
    }
    sent.map(|_| ())
}

/// Whether the error means the target moved, and where to.
pub fn migrated_to(err: &Error) -> Option<ChatId> {
    match err {
        Error::Dispatch(crate::errors::DispatchError::Migrated { new_chat }) => Some(*new_chat),
        _ => None,
    }
}
