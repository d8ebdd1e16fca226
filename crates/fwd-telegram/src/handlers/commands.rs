use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{info, warn};

use fwd_core::{
    domain::{ChatId, Subscription},
    errors::Error,
    history::HistoryOutcome,
    resolver::JoinStatus,
    service::SubscribeOutcome,
};

use crate::router::AppState;

const HELP: &str = "🤖 Chat forwarder\n\n\
/forward_new <id | @handle | invite link> - forward a chat into this one\n\
/list_forwards - show the rules of this chat\n\
/stop_forward <id | name | all> - stop forwarding\n\
/get_history <id | @handle | link> [question] - forward recent messages and analyse them";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

/// First word, then the rest.
fn split_first(args: &str) -> (&str, Option<&str>) {
    let mut parts = args.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().map(str::trim).filter(|r| !r.is_empty());
    (first, rest)
}

async fn reply(bot: &Bot, chat: teloxide::types::ChatId, text: impl Into<String>) {
    if let Err(e) = bot.send_message(chat, text.into()).await {
        warn!(chat = chat.0, error = %e, "reply failed");
    }
}

fn subscribed_reply(out: &SubscribeOutcome) -> String {
    let sub = &out.subscription;
    let mut text = format!(
        "✅ Now forwarding \"{}\" ({}) into this chat.",
        sub.display_name, sub.source
    );
    match out.join {
        JoinStatus::Joined => text.push_str("\nJoined the chat."),
        JoinStatus::AlreadyMember => text.push_str("\nAlready a member of the chat."),
        JoinStatus::Skipped => {
            text.push_str("\nCould not join the chat, messages arrive only if access is granted.")
        }
        JoinStatus::NotAttempted => {}
    }
    text
}

fn list_reply(subs: &[Subscription]) -> String {
    if subs.is_empty() {
        return "📭 No active forwarding rules in this chat.".to_string();
    }
    let mut out = String::from("📋 Active forwarding rules:");
    for (i, sub) in subs.iter().enumerate() {
        out.push_str(&format!("\n{}. \"{}\" ({})", i + 1, sub.display_name, sub.source));
    }
    out
}

fn history_reply(out: &HistoryOutcome) -> String {
    if out.forwarded == 0 {
        return format!("📭 No recent messages found for \"{}\".", out.display_name);
    }
    format!(
        "✅ Forwarded {} messages from \"{}\".",
        out.forwarded, out.display_name
    )
}

fn error_reply(err: &Error, subs: &[Subscription]) -> String {
    if let Error::AlreadyExists(id) = err {
        if let Some(sub) = subs.iter().find(|s| &s.id == id) {
            return format!(
                "⚠️ \"{}\" is already being forwarded into this chat",
                sub.display_name
            );
        }
    }
    err.user_message()
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let (cmd, args) = parse_command(text);
    let tg_chat = msg.chat.id;
    let chat = ChatId(tg_chat.0);
    let service = &state.service;

    match cmd.as_str() {
        "start" | "help" => reply(&bot, tg_chat, HELP).await,

        "forward_new" => {
            let (reference, _) = split_first(&args);
            if reference.is_empty() {
                reply(&bot, tg_chat, "Usage: /forward_new <id | @handle | invite link>").await;
                return Ok(());
            }
            match service.subscribe(reference, chat).await {
                Ok(out) => {
                    info!(id = %out.subscription.id, "forward added by command");
                    reply(&bot, tg_chat, subscribed_reply(&out)).await;
                }
                Err(e) => {
                    warn!(%reference, error = %e, "forward_new failed");
                    let subs = service.list(chat).await;
                    reply(&bot, tg_chat, error_reply(&e, &subs)).await;
                }
            }
        }

        "list_forwards" => {
            let subs = service.list(chat).await;
            reply(&bot, tg_chat, list_reply(&subs)).await;
        }

        "stop_forward" => {
            let selector = args.trim();
            if selector.is_empty() {
                reply(&bot, tg_chat, "Usage: /stop_forward <id | name | all>").await;
                return Ok(());
            }
            let text = if selector.eq_ignore_ascii_case("all") {
                match service.stop_all(chat).await {
                    Ok(removed) if removed.is_empty() => {
                        "ℹ️ Nothing to stop in this chat.".to_string()
                    }
                    Ok(removed) => format!("🛑 Stopped {} forwarding rules.", removed.len()),
                    Err(e) => e.user_message(),
                }
            } else {
                match service.stop(chat, selector).await {
                    Ok(sub) => format!("🛑 Stopped forwarding \"{}\".", sub.display_name),
                    Err(e) => e.user_message(),
                }
            };
            reply(&bot, tg_chat, text).await;
        }

        "get_history" => {
            let (reference, question) = split_first(&args);
            if reference.is_empty() {
                reply(
                    &bot,
                    tg_chat,
                    "Usage: /get_history <id | @handle | link> [question]",
                )
                .await;
                return Ok(());
            }
            reply(&bot, tg_chat, "⏳ Fetching recent messages...").await;

            // Pacing makes this slow; keep the dispatcher free.
            let service = service.clone();
            let reference = reference.to_string();
            let question = question.map(str::to_string);
            tokio::spawn(async move {
                let text = match service
                    .history(&reference, chat, 0, question.as_deref())
                    .await
                {
                    Ok(out) => history_reply(&out),
                    Err(e) => {
                        warn!(%reference, error = %e, "get_history failed");
                        e.user_message()
                    }
                };
                reply(&bot, tg_chat, text).await;
            });
        }

        _ => reply(&bot, tg_chat, "Unknown command. Try /start").await,
    }

    Ok(())
}
