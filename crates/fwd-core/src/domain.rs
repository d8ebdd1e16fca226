use std::fmt;

use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric, canonical encoding).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Key of a forwarding rule, derived from `(source, target)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn derive(source: ChatId, target: ChatId) -> Self {
        Self(format!("{}_{}", source.0, target.0))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted rule forwarding one source chat into one target chat.
///
/// Field names match the on-disk layout (`forward_configs.json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    #[serde(rename = "source_chat")]
    pub source: ChatId,
    #[serde(rename = "target_chat")]
    pub target: ChatId,
    #[serde(rename = "group_name")]
    pub display_name: String,
}

impl Subscription {
    pub fn new(source: ChatId, target: ChatId, display_name: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId::derive(source, target),
            source,
            target,
            display_name: display_name.into(),
        }
    }

    /// Replace every occurrence of `old` with `new` and recompute the id.
    /// Returns whether anything changed.
    pub fn rewrite_chat(&mut self, old: ChatId, new: ChatId) -> bool {
        let mut changed = false;
        if self.source == old {
            self.source = new;
            changed = true;
        }
        if self.target == old {
            self.target = new;
            changed = true;
        }
        if changed {
            self.id = SubscriptionId::derive(self.source, self.target);
        }
        changed
    }

    pub fn route(&self) -> Route {
        Route {
            source: self.source,
            target: self.target,
            display_name: self.display_name.clone(),
        }
    }
}

/// Everything the stateless dispatch path needs to forward one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub source: ChatId,
    pub target: ChatId,
    pub display_name: String,
}

impl Route {
    pub fn id(&self) -> SubscriptionId {
        SubscriptionId::derive(self.source, self.target)
    }
}
