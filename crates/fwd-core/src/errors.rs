use std::{path::PathBuf, time::Duration};

use crate::domain::{ChatId, SubscriptionId};

/// Core error type for the forwarder.
///
/// Adapter crates should map their specific errors into this type so the core
/// can tell user-facing failures apart from retryable ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("persistence error: {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("subscription already exists: {0}")]
    AlreadyExists(SubscriptionId),

    #[error("subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures while turning a user reference into a canonical source id.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Permanent for the given invite token; never retried.
    #[error("invite link expired")]
    InviteExpired,

    #[error("join failed: {0}")]
    JoinFailed(String),

    /// The source network adapter cannot do this at all.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transient network error: {0}")]
    Transient(String),
}

/// Outcome classes for a failed send to a target chat.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("transient dispatch error: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("destination moved to {new_chat}")]
    Migrated { new_chat: ChatId },

    #[error("dispatch failed: {0}")]
    Permanent(String),
}

impl Error {
    /// Natural-language status for chat replies. Never a raw trace.
    pub fn user_message(&self) -> String {
        match self {
            Error::Resolve(ResolveError::EntityNotFound(r)) => {
                format!("❌ Could not find a chat for \"{r}\"")
            }
            Error::Resolve(ResolveError::InviteExpired) => {
                "❌ The invite link has expired, please get a new one".to_string()
            }
            Error::Resolve(ResolveError::JoinFailed(reason)) => {
                format!("❌ Could not join the chat: {reason}")
            }
            Error::Resolve(ResolveError::Unsupported(reason)) => {
                format!("🚫 Not supported: {reason}")
            }
            Error::Resolve(ResolveError::Transient(_)) => {
                "⚠️ The chat network is not responding, please try again shortly".to_string()
            }
            Error::Dispatch(DispatchError::Migrated { new_chat }) => {
                format!("⚠️ The destination moved to {new_chat}, retrying there")
            }
            Error::Dispatch(_) => "❌ Failed to deliver the message".to_string(),
            Error::AlreadyExists(_) => "⚠️ That chat is already being forwarded here".to_string(),
            Error::NotFound(_) => "❌ No matching forwarding rule".to_string(),
            Error::Persistence { .. } | Error::Io(_) | Error::Json(_) => {
                "❌ Failed to save the forwarding rules, nothing was changed".to_string()
            }
            Error::Config(_) | Error::External(_) => {
                "❌ Something went wrong, please check the logs".to_string()
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Resolve(ResolveError::Transient(_))
                | Error::Dispatch(DispatchError::Transient { .. })
        )
    }
}
