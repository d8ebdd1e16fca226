use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Target dispatch port.
///
/// Implementations must surface "destination moved" as
/// `Error::Dispatch(DispatchError::Migrated { .. })` and flood control as
/// `DispatchError::Transient` with `retry_after` set.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    /// Wait until a send to `chat_id` may start. Callers await this outside
    /// any per-call timeout, so a long queue never counts as a stalled send.
    async fn pace(&self, _chat_id: ChatId) {}

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    async fn send_photo(&self, chat_id: ChatId, photo: &Path, caption: &str)
        -> Result<MessageRef>;
}
