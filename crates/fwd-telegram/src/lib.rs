//! Telegram adapter (teloxide).
//!
//! This crate implements the `fwd-core` MessagingPort and SourceNetwork over
//! the Telegram Bot API, plus the command surface.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{prelude::*, types::InputFile, RequestError};

pub mod handlers;
pub mod router;
pub mod source;

use fwd_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::{DispatchError, Error},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

pub use source::BotApiSource;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn msg_ref(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }
}

/// Sort a Bot API failure into the dispatch outcome classes. Retrying is the
/// caller's job.
pub fn classify(e: RequestError) -> Error {
    let dispatch = match e {
        RequestError::RetryAfter(wait) => DispatchError::Transient {
            reason: "flood control".to_string(),
            retry_after: Some(wait),
        },
        RequestError::MigrateToChatId(new_id) => DispatchError::Migrated {
            new_chat: ChatId(new_id),
        },
        e @ (RequestError::Network(_) | RequestError::Io(_) | RequestError::InvalidJson { .. }) => {
            DispatchError::Transient {
                reason: e.to_string(),
                retry_after: None,
            }
        }
        other => DispatchError::Permanent(format!("telegram error: {other}")),
    };
    Error::Dispatch(dispatch)
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities::default()
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self
            .bot
            .send_message(Self::tg_chat(chat_id), text.to_string())
            .await
            .map_err(classify)?;
        Ok(Self::msg_ref(chat_id, &msg))
    }

    async fn send_photo(&self, chat_id: ChatId, photo: &Path, caption: &str) -> Result<MessageRef> {
        let mut req = self
            .bot
            .send_photo(Self::tg_chat(chat_id), InputFile::file(photo.to_path_buf()));
        if !caption.is_empty() {
            req = req.caption(caption.to_string());
        }
        let msg = req.await.map_err(classify)?;
        Ok(Self::msg_ref(chat_id, &msg))
    }
}
