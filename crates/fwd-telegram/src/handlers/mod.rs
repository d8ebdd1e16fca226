//! Telegram update handlers.
//!
//! Commands are thin: parse, check the allow-list, call one service
//! operation, reply with a plain status line. Everything else is fed to the
//! source adapter as a potential event.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::debug;

use crate::router::AppState;

mod commands;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            let user_id = msg.from().map(|u| u.id.0 as i64);
            if !state.cfg.is_authorized(user_id) {
                debug!(?user_id, "unauthorized command");
                let _ = bot
                    .send_message(
                        msg.chat.id,
                        "Unauthorized. Contact the bot owner for access.",
                    )
                    .await;
                return Ok(());
            }
            return commands::handle_command(bot, msg, state).await;
        }
    }

    state.source.ingest(&msg).await;
    Ok(())
}

pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    state.source.ingest(&msg).await;
    Ok(())
}
