//! Port for the monitored chat network (the "source" side).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{domain::ChatId, errors::ResolveError, Result};

/// Entity categories. Each one has its own id encoding (see `resolver`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    /// Small (basic) group.
    Group,
    /// Broadcast channel or supergroup.
    Channel,
}

/// A chat/user as reported by the network, with its *raw* (unencoded) id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub raw_id: i64,
    pub kind: EntityKind,
    pub title: Option<String>,
    pub username: Option<String>,
}

/// How an entity is looked up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityRef {
    Id(ChatId),
    Handle(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InviteOutcome {
    Joined(Entity),
    AlreadyMember,
}

/// Attachment handle; only the adapter knows how to fetch it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    pub is_photo: bool,
}

/// One inbound message on a watched source.
#[derive(Clone, Debug)]
pub struct SourceEvent {
    pub chat: ChatId,
    pub text: Option<String>,
    pub media: Option<MediaRef>,
}

/// A message fetched from history.
#[derive(Clone, Debug)]
pub struct HistoryMessage {
    pub sender: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub text: Option<String>,
}

/// Hexagonal port for the source network client.
///
/// Events for watched chats are delivered through a single stream, taken once
/// by the ingestion loop.
#[async_trait]
pub trait SourceNetwork: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn resolve(&self, reference: &EntityRef) -> std::result::Result<Entity, ResolveError>;

    async fn join(&self, entity: &Entity) -> std::result::Result<JoinOutcome, ResolveError>;

    async fn import_invite(&self, hash: &str) -> std::result::Result<InviteOutcome, ResolveError>;

    /// Entities the account already belongs to.
    async fn joined_entities(&self) -> Result<Vec<Entity>>;

    async fn watch(&self, chat: ChatId) -> Result<()>;
    async fn unwatch(&self, chat: ChatId) -> Result<()>;

    /// Take the ingestion stream. Returns `None` if already taken.
    fn events(&self) -> Option<mpsc::Receiver<SourceEvent>>;

    async fn fetch_recent(&self, chat: ChatId, limit: usize) -> Result<Vec<HistoryMessage>>;

    async fn download_media(&self, media: &MediaRef, dir: &Path) -> Result<PathBuf>;
}
