//! Source network over the Bot API.
//!
//! A bot sees only chats it was added to, cannot join by itself and cannot
//! read history. Updates from every chat are kept in a small per-chat log so
//! recent messages can be served, and updates from watched chats are pushed
//! onto the ingestion stream.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use teloxide::{net::Download, prelude::*, types::Recipient, ApiError, RequestError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fwd_core::{
    domain::ChatId,
    errors::{Error, ResolveError},
    resolver::decode_id,
    source::{
        Entity, EntityRef, HistoryMessage, InviteOutcome, JoinOutcome, MediaRef, SourceEvent,
        SourceNetwork,
    },
    Result,
};

const EVENT_QUEUE: usize = 1024;
const RECENT_PER_CHAT: usize = 500;

static MEDIA_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct SourceState {
    watched: HashSet<ChatId>,
    recent: HashMap<ChatId, VecDeque<HistoryMessage>>,
}

pub struct BotApiSource {
    bot: Bot,
    state: Mutex<SourceState>,
    tx: mpsc::Sender<SourceEvent>,
    rx: Mutex<Option<mpsc::Receiver<SourceEvent>>>,
}

impl BotApiSource {
    pub fn new(bot: Bot) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            bot,
            state: Mutex::new(SourceState::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one update from a group or channel.
    pub async fn ingest(&self, msg: &Message) {
        let chat = ChatId(msg.chat.id.0);
        let text = msg.text().or(msg.caption()).map(str::to_string);
        let media = msg.photo().and_then(|sizes| sizes.last()).map(|p| MediaRef {
            file_id: p.file.id.clone(),
            is_photo: true,
        });
        let sender = msg
            .from()
            .map(|u| u.full_name())
            .or_else(|| msg.author_signature().map(str::to_string))
            .or_else(|| msg.chat.title().map(str::to_string));

        let record = HistoryMessage {
            sender,
            sent_at: msg.date,
            text: text.clone(),
        };
        self.accept(SourceEvent { chat, text, media }, record).await;
    }

    async fn accept(&self, event: SourceEvent, record: HistoryMessage) {
        let watched = {
            let mut st = self.lock();
            let log = st.recent.entry(event.chat).or_default();
            log.push_back(record);
            while log.len() > RECENT_PER_CHAT {
                log.pop_front();
            }
            st.watched.contains(&event.chat)
        };
        if !watched {
            return;
        }
        if self.tx.send(event).await.is_err() {
            warn!("ingestion stream closed, dropping event");
        }
    }
}

fn entity_from_chat(chat: &teloxide::types::Chat) -> Entity {
    let (kind, raw_id) = decode_id(ChatId(chat.id.0));
    Entity {
        raw_id,
        kind,
        title: chat
            .title()
            .or(chat.first_name())
            .map(str::to_string),
        username: chat.username().map(str::to_string),
    }
}

fn resolve_error(reference: &str, e: RequestError) -> ResolveError {
    match e {
        RequestError::Api(ApiError::ChatNotFound) => ResolveError::EntityNotFound(reference.to_string()),
        RequestError::Api(api) => ResolveError::EntityNotFound(format!("{reference}: {api}")),
        other => ResolveError::Transient(other.to_string()),
    }
}

#[async_trait]
impl SourceNetwork for BotApiSource {
    async fn connect(&self) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| Error::External(format!("telegram get_me failed: {e}")))?;
        info!(bot = %me.username(), "connected to telegram");
        Ok(())
    }

    async fn resolve(&self, reference: &EntityRef) -> std::result::Result<Entity, ResolveError> {
        let (recipient, label) = match reference {
            EntityRef::Id(id) => (
                Recipient::Id(teloxide::types::ChatId(id.0)),
                id.to_string(),
            ),
            EntityRef::Handle(h) => {
                let handle = format!("@{}", h.trim_start_matches('@'));
                (Recipient::ChannelUsername(handle.clone()), handle)
            }
        };
        let chat = self
            .bot
            .get_chat(recipient)
            .await
            .map_err(|e| resolve_error(&label, e))?;
        Ok(entity_from_chat(&chat))
    }

    async fn join(&self, _entity: &Entity) -> std::result::Result<JoinOutcome, ResolveError> {
        Err(ResolveError::Unsupported(
            "bots cannot join chats, add the bot to the chat instead".to_string(),
        ))
    }

    async fn import_invite(&self, _hash: &str) -> std::result::Result<InviteOutcome, ResolveError> {
        Err(ResolveError::Unsupported(
            "bots cannot use invite links, add the bot to the chat and use its id or @handle"
                .to_string(),
        ))
    }

    async fn joined_entities(&self) -> Result<Vec<Entity>> {
        Ok(Vec::new())
    }

    async fn watch(&self, chat: ChatId) -> Result<()> {
        if self.lock().watched.insert(chat) {
            debug!(%chat, "watching");
        }
        Ok(())
    }

    async fn unwatch(&self, chat: ChatId) -> Result<()> {
        if self.lock().watched.remove(&chat) {
            debug!(%chat, "unwatched");
        }
        Ok(())
    }

    fn events(&self) -> Option<mpsc::Receiver<SourceEvent>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Newest first, like the network returns history.
    async fn fetch_recent(&self, chat: ChatId, limit: usize) -> Result<Vec<HistoryMessage>> {
        let st = self.lock();
        Ok(st
            .recent
            .get(&chat)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn download_media(&self, media: &MediaRef, dir: &Path) -> Result<PathBuf> {
        let file = self
            .bot
            .get_file(media.file_id.clone())
            .await
            .map_err(|e| Error::External(format!("telegram get_file failed: {e}")))?;

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let n = MEDIA_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(format!("photo_{ts}_{n}.jpg"));

        let mut dst = tokio::fs::File::create(&path).await?;
        if let Err(e) = self.bot.download_file(&file.path, &mut dst).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(Error::External(format!("telegram download failed: {e}")));
        }
        Ok(path)
    }
}
