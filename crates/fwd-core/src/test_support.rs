//! In-memory fakes for the ports, shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    completion::{Completion, CompletionService},
    config::Config,
    domain::{ChatId, MessageId, MessageRef, Subscription},
    errors::{DispatchError, Error, ResolveError},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    resolver::canonical_id,
    service::ForwardService,
    source::{
        Entity, EntityRef, HistoryMessage, InviteOutcome, JoinOutcome, MediaRef, SourceEvent,
        SourceNetwork,
    },
    store::SubscriptionStore,
    Result,
};

#[derive(Default)]
struct SourceState {
    entities: Vec<Entity>,
    joined: HashSet<i64>,
    invites: HashMap<String, Entity>,
    used_invites: HashSet<String>,
    expired: HashSet<String>,
    watched: HashSet<ChatId>,
    history: HashMap<ChatId, Vec<HistoryMessage>>,
    fail_joins: bool,
    failing_connects: usize,
    connects: usize,
    hang_unwatch: bool,
    fail_watches: bool,
}

pub struct FakeSource {
    state: Mutex<SourceState>,
    tx: mpsc::Sender<SourceEvent>,
    rx: Mutex<Option<mpsc::Receiver<SourceEvent>>>,
}

impl Default for FakeSource {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            state: Mutex::new(SourceState::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl FakeSource {
    pub fn add_entity(&self, entity: Entity) {
        self.state.lock().unwrap().entities.push(entity);
    }

    pub fn add_invite(&self, hash: &str, entity: Entity) {
        self.state
            .lock()
            .unwrap()
            .invites
            .insert(hash.to_string(), entity);
    }

    pub fn expire_invite(&self, hash: &str) {
        self.state.lock().unwrap().expired.insert(hash.to_string());
    }

    pub fn fail_joins(&self) {
        self.state.lock().unwrap().fail_joins = true;
    }

    /// The next `n` connects fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().unwrap().failing_connects = n;
    }

    /// `unwatch` never completes from now on.
    pub fn hang_unwatch(&self) {
        self.state.lock().unwrap().hang_unwatch = true;
    }

    pub fn fail_watches(&self) {
        self.state.lock().unwrap().fail_watches = true;
    }

    pub fn set_history(&self, chat: ChatId, msgs: Vec<HistoryMessage>) {
        self.state.lock().unwrap().history.insert(chat, msgs);
    }

    pub fn watched(&self) -> HashSet<ChatId> {
        self.state.lock().unwrap().watched.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub async fn push(&self, event: SourceEvent) {
        self.tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl SourceNetwork for FakeSource {
    async fn connect(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.connects += 1;
        if st.failing_connects > 0 {
            st.failing_connects -= 1;
            return Err(Error::External("network unreachable".to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, reference: &EntityRef) -> std::result::Result<Entity, ResolveError> {
        let st = self.state.lock().unwrap();
        let found = st.entities.iter().find(|e| match reference {
            EntityRef::Id(id) => canonical_id(e.kind, e.raw_id) == Some(*id),
            EntityRef::Handle(h) => e
                .username
                .as_deref()
                .map(|u| u.eq_ignore_ascii_case(h))
                .unwrap_or(false),
        });
        found.cloned().ok_or_else(|| {
            ResolveError::EntityNotFound(match reference {
                EntityRef::Id(id) => id.to_string(),
                EntityRef::Handle(h) => h.clone(),
            })
        })
    }

    async fn join(&self, entity: &Entity) -> std::result::Result<JoinOutcome, ResolveError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_joins {
            return Err(ResolveError::JoinFailed("not allowed".to_string()));
        }
        if st.joined.insert(entity.raw_id) {
            Ok(JoinOutcome::Joined)
        } else {
            Ok(JoinOutcome::AlreadyMember)
        }
    }

    async fn import_invite(&self, hash: &str) -> std::result::Result<InviteOutcome, ResolveError> {
        let mut st = self.state.lock().unwrap();
        if st.expired.contains(hash) {
            return Err(ResolveError::InviteExpired);
        }
        let Some(entity) = st.invites.get(hash).cloned() else {
            return Err(ResolveError::EntityNotFound(hash.to_string()));
        };
        if !st.used_invites.insert(hash.to_string()) {
            return Ok(InviteOutcome::AlreadyMember);
        }
        st.joined.insert(entity.raw_id);
        st.entities.push(entity.clone());
        Ok(InviteOutcome::Joined(entity))
    }

    async fn joined_entities(&self) -> Result<Vec<Entity>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .entities
            .iter()
            .filter(|e| st.joined.contains(&e.raw_id))
            .cloned()
            .collect())
    }

    async fn watch(&self, chat: ChatId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_watches {
            return Err(Error::External("watch refused".to_string()));
        }
        st.watched.insert(chat);
        Ok(())
    }

    async fn unwatch(&self, chat: ChatId) -> Result<()> {
        let hang = self.state.lock().unwrap().hang_unwatch;
        if hang {
            std::future::pending::<()>().await;
        }
        self.state.lock().unwrap().watched.remove(&chat);
        Ok(())
    }

    fn events(&self) -> Option<mpsc::Receiver<SourceEvent>> {
        self.rx.lock().unwrap().take()
    }

    async fn fetch_recent(&self, chat: ChatId, limit: usize) -> Result<Vec<HistoryMessage>> {
        let st = self.state.lock().unwrap();
        let mut msgs = st.history.get(&chat).cloned().unwrap_or_default();
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn download_media(&self, media: &MediaRef, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.jpg", media.file_id));
        tokio::fs::write(&path, b"jpeg").await?;
        Ok(path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Text(ChatId, String),
    Photo(ChatId, String),
}

/// Records sends; chats listed in `moved` fail with a migration error.
#[derive(Default)]
pub struct FakeMessenger {
    sent: Mutex<Vec<Sent>>,
    moved: Mutex<HashMap<ChatId, ChatId>>,
    next_id: Mutex<i32>,
}

impl FakeMessenger {
    pub fn move_chat(&self, old: ChatId, new: ChatId) {
        self.moved.lock().unwrap().insert(old, new);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_to(&self, chat: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(c, t) if c == chat => Some(t),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `n` sends were recorded (spawned tasks).
    pub async fn wait_for(&self, n: usize) -> Vec<Sent> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent()
    }

    fn check(&self, chat: ChatId) -> Result<()> {
        match self.moved.lock().unwrap().get(&chat) {
            Some(new_chat) => Err(Error::Dispatch(DispatchError::Migrated {
                new_chat: *new_chat,
            })),
            None => Ok(()),
        }
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(*guard),
        }
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities::default()
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.check(chat_id)?;
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Text(chat_id, text.to_string()));
        Ok(self.alloc(chat_id))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.check(chat_id)?;
        assert!(photo.exists(), "photo must exist while sending");
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Photo(chat_id, caption.to_string()));
        Ok(self.alloc(chat_id))
    }
}

/// Echoes a fixed reply and records prompts.
pub struct FakeCompletion {
    reply: String,
    fail: bool,
    hang: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeCompletion {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail: false,
            hang: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: String::new(),
            fail: true,
            hang: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Never answers.
    pub fn hanging() -> Self {
        Self {
            reply: String::new(),
            fail: false,
            hang: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn infer(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<Completion> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(Error::External("completion down".to_string()));
        }
        Ok(Completion::Text(self.reply.clone()))
    }
}

pub struct Harness {
    pub service: ForwardService,
    pub source: Arc<FakeSource>,
    pub messenger: Arc<FakeMessenger>,
    pub completion: Arc<FakeCompletion>,
    pub dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(FakeCompletion::replying("summary of the window"))
}

pub fn harness_with(completion: FakeCompletion) -> Harness {
    harness_seeded(completion, Vec::new())
}

/// Harness whose store already holds `subs`, as after a restart.
pub fn harness_seeded(completion: FakeCompletion, subs: Vec<Subscription>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::with_paths(dir.path().join("subs.json"), dir.path().to_path_buf());
    cfg.history_pacing = Duration::ZERO;
    cfg.dispatch_backoff = Duration::from_millis(1);
    let mut store = SubscriptionStore::open(&cfg.subscriptions_file).unwrap();
    for sub in subs {
        store.add(sub).unwrap();
    }
    let store = SubscriptionStore::open(&cfg.subscriptions_file).unwrap();

    let source = Arc::new(FakeSource::default());
    let messenger = Arc::new(FakeMessenger::default());
    let completion = Arc::new(completion);
    let service = ForwardService::new(
        Arc::new(cfg),
        store,
        source.clone(),
        messenger.clone(),
        Some(completion.clone() as Arc<dyn CompletionService>),
    );
    Harness {
        service,
        source,
        messenger,
        completion,
        dir,
    }
}
