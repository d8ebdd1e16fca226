//! Turns user-supplied chat references into canonical source ids.
//!
//! Accepted references:
//! - raw ids: `-1001234567890`, `12345`
//! - handles: `@channel`, `channel`
//! - invite links: `https://t.me/joinchat/HASH`, `https://t.me/+HASH` (join by
//!   hash) and `https://t.me/channel` (join by handle)

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    domain::ChatId,
    errors::ResolveError,
    source::{Entity, EntityKind, EntityRef, InviteOutcome, JoinOutcome, SourceNetwork},
};

/// Offset that marks a channel/supergroup id (`-100…` prefix).
pub const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// Id encoding per entity category: `canonical = sign * (offset + raw)`.
struct IdEncoding {
    kind: EntityKind,
    sign: i64,
    offset: i64,
}

const ID_ENCODINGS: &[IdEncoding] = &[
    IdEncoding {
        kind: EntityKind::User,
        sign: 1,
        offset: 0,
    },
    IdEncoding {
        kind: EntityKind::Group,
        sign: -1,
        offset: 0,
    },
    IdEncoding {
        kind: EntityKind::Channel,
        sign: -1,
        offset: CHANNEL_ID_OFFSET,
    },
];

fn encoding_for(kind: EntityKind) -> &'static IdEncoding {
    ID_ENCODINGS
        .iter()
        .find(|e| e.kind == kind)
        .unwrap_or(&ID_ENCODINGS[0])
}

/// Canonical id used for handler registration and dispatch. `None` when the
/// raw id cannot be encoded.
pub fn canonical_id(kind: EntityKind, raw_id: i64) -> Option<ChatId> {
    let enc = encoding_for(kind);
    let magnitude = enc.offset.checked_add(raw_id.checked_abs()?)?;
    Some(ChatId(enc.sign * magnitude))
}

/// Canonical id of a resolved entity.
pub fn entity_id(entity: &Entity) -> Result<ChatId, ResolveError> {
    canonical_id(entity.kind, entity.raw_id)
        .ok_or_else(|| ResolveError::EntityNotFound(format!("invalid chat id {}", entity.raw_id)))
}

/// Inverse of [`canonical_id`].
pub fn decode_id(id: ChatId) -> (EntityKind, i64) {
    if id.0 > 0 {
        (EntityKind::User, id.0)
    } else if id.0 <= -CHANNEL_ID_OFFSET {
        (EntityKind::Channel, -(id.0 + CHANNEL_ID_OFFSET))
    } else {
        (EntityKind::Group, -id.0)
    }
}

/// Compatibility shim for ids stored before the network renumbered a chat
/// (e.g. a group upgraded to a supergroup). Bounded and tried in order.
///
/// These transforms cannot tell a real migration from an unrelated chat that
/// happens to own the transformed id, so callers must confirm identity (see
/// [`same_entity`]) before accepting a candidate.
const ID_FALLBACKS: &[(&str, fn(i64) -> Option<i64>)] = &[
    ("sign flip", |id| id.checked_neg()),
    ("add supergroup prefix", |id| {
        let raw = id.checked_abs()?;
        (raw < CHANNEL_ID_OFFSET).then(|| -(CHANNEL_ID_OFFSET + raw))
    }),
    ("remove supergroup prefix", |id| {
        (id <= -CHANNEL_ID_OFFSET).then(|| id + CHANNEL_ID_OFFSET)
    }),
    ("remove supergroup prefix, positive", |id| {
        (id <= -CHANNEL_ID_OFFSET).then(|| -(id + CHANNEL_ID_OFFSET))
    }),
];

pub fn alternate_ids(id: ChatId) -> Vec<(&'static str, ChatId)> {
    let mut out: Vec<(&'static str, ChatId)> = Vec::new();
    for (label, f) in ID_FALLBACKS {
        let Some(candidate) = f(id.0) else {
            continue;
        };
        if candidate == 0 || candidate == id.0 || out.iter().any(|(_, c)| c.0 == candidate) {
            continue;
        }
        out.push((label, ChatId(candidate)));
    }
    out
}

/// Whether `entity` plausibly is the chat a subscription was created for.
///
/// When the stored name is only the id text (no title was known), there is
/// nothing to compare and the candidate is accepted.
pub fn same_entity(stored_name: &str, stored_id: ChatId, entity: &Entity) -> bool {
    let stored = stored_name.trim();
    if stored.is_empty() || stored == stored_id.0.to_string() {
        return true;
    }
    let matches = |s: &Option<String>| {
        s.as_deref()
            .map(|v| v.trim().eq_ignore_ascii_case(stored))
            .unwrap_or(false)
    };
    matches(&entity.title) || matches(&entity.username)
}

/// Parsed form of a user reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    Id(ChatId),
    Handle(String),
    InviteHash(String),
    InviteHandle(String),
}

impl Reference {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        if let Some(rest) = link_path(input) {
            let rest = rest.split(['?', '#']).next().unwrap_or_default();
            if let Some(hash) = rest.strip_prefix("joinchat/") {
                return non_empty(hash).map(|h| Reference::InviteHash(h.to_string()));
            }
            if let Some(hash) = rest.strip_prefix('+') {
                return non_empty(hash).map(|h| Reference::InviteHash(h.to_string()));
            }
            let handle = rest.split('/').next().unwrap_or_default();
            return non_empty(handle).map(|h| Reference::InviteHandle(h.to_string()));
        }

        if let Ok(id) = input.parse::<i64>() {
            return Some(Reference::Id(ChatId(id)));
        }

        let handle = input.trim_start_matches('@');
        non_empty(handle).map(|h| Reference::Handle(h.to_string()))
    }
}

fn link_path(input: &str) -> Option<&str> {
    for host in ["t.me/", "telegram.me/"] {
        if let Some(idx) = input.find(host) {
            return Some(&input[idx + host.len()..]);
        }
    }
    None
}

fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinStatus {
    Joined,
    AlreadyMember,
    /// The join attempt failed but the entity was resolvable anyway.
    Skipped,
    NotAttempted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub source: ChatId,
    pub display_name: String,
    pub join: JoinStatus,
}

/// Result of re-checking a stored id at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocated {
    pub source: ChatId,
    pub display_name: Option<String>,
    /// Which fallback produced the id, `None` if the stored id still works.
    pub via: Option<&'static str>,
}

pub struct IdentifierResolver {
    source: Arc<dyn SourceNetwork>,
    call_timeout: Duration,
}

impl IdentifierResolver {
    pub fn new(source: Arc<dyn SourceNetwork>, call_timeout: Duration) -> Self {
        Self {
            source,
            call_timeout,
        }
    }

    pub async fn resolve(&self, input: &str) -> Result<Resolved, ResolveError> {
        let reference = Reference::parse(input)
            .ok_or_else(|| ResolveError::EntityNotFound(input.to_string()))?;

        match reference {
            Reference::InviteHash(hash) => self.resolve_invite(&hash).await,
            Reference::InviteHandle(handle) | Reference::Handle(handle) => {
                self.resolve_entity(EntityRef::Handle(handle)).await
            }
            Reference::Id(id) => self.resolve_entity(EntityRef::Id(id)).await,
        }
    }

    /// Entity lookup without joining (startup recovery path).
    pub async fn lookup(&self, id: ChatId) -> Result<Entity, ResolveError> {
        self.bounded(self.source.resolve(&EntityRef::Id(id))).await
    }

    /// Re-check a stored source id, trying the fallback encodings when the
    /// stored one no longer resolves.
    pub async fn relocate(
        &self,
        stored: ChatId,
        stored_name: &str,
    ) -> Result<Relocated, ResolveError> {
        let first_err = match self.lookup(stored).await {
            Ok(entity) => {
                return Ok(Relocated {
                    source: entity_id(&entity)?,
                    display_name: entity.title,
                    via: None,
                })
            }
            Err(e @ ResolveError::Transient(_)) => return Err(e),
            Err(e) => e,
        };

        for (label, candidate) in alternate_ids(stored) {
            let entity = match self.lookup(candidate).await {
                Ok(entity) => entity,
                Err(ResolveError::Transient(reason)) => {
                    warn!(%stored, %candidate, %reason, "fallback lookup failed transiently");
                    continue;
                }
                Err(_) => continue,
            };
            if !same_entity(stored_name, stored, &entity) {
                warn!(
                    %stored,
                    %candidate,
                    title = entity.title.as_deref().unwrap_or(""),
                    expected = stored_name,
                    "fallback id resolves to a different chat, ignoring"
                );
                continue;
            }
            let source = entity_id(&entity)?;
            info!(%stored, %source, via = label, "source id relocated");
            return Ok(Relocated {
                source,
                display_name: entity.title,
                via: Some(label),
            });
        }

        Err(first_err)
    }

    async fn resolve_invite(&self, hash: &str) -> Result<Resolved, ResolveError> {
        match self.bounded(self.source.import_invite(hash)).await? {
            InviteOutcome::Joined(entity) => {
                info!(title = entity.title.as_deref().unwrap_or(""), "joined via invite");
                resolved(&entity, JoinStatus::Joined)
            }
            InviteOutcome::AlreadyMember => {
                let joined = self
                    .bounded(async {
                        self.source
                            .joined_entities()
                            .await
                            .map_err(|e| ResolveError::Transient(e.to_string()))
                    })
                    .await?;
                joined
                    .iter()
                    .find(|e| {
                        e.username
                            .as_deref()
                            .map(|u| u.eq_ignore_ascii_case(hash))
                            .unwrap_or(false)
                    })
                    .map(|e| resolved(e, JoinStatus::AlreadyMember))
                    .ok_or_else(|| {
                        ResolveError::JoinFailed(
                            "already a member, but the chat could not be identified from the \
                             invite; use its id or handle instead"
                                .to_string(),
                        )
                    })?
            }
        }
    }

    async fn resolve_entity(&self, reference: EntityRef) -> Result<Resolved, ResolveError> {
        let entity = self.bounded(self.source.resolve(&reference)).await?;

        let mut join = JoinStatus::NotAttempted;
        if entity.username.is_some() {
            join = match self.bounded(self.source.join(&entity)).await {
                Ok(JoinOutcome::Joined) => JoinStatus::Joined,
                Ok(JoinOutcome::AlreadyMember) => JoinStatus::AlreadyMember,
                Err(e) => {
                    warn!(error = %e, "join failed, continuing with resolved entity");
                    JoinStatus::Skipped
                }
            };
        }

        resolved(&entity, join)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ResolveError>>,
    ) -> Result<T, ResolveError> {
        match timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ResolveError::Transient(format!(
                "timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

fn resolved(entity: &Entity, join: JoinStatus) -> Result<Resolved, ResolveError> {
    let source = entity_id(entity)?;
    let display_name = entity
        .title
        .clone()
        .or_else(|| entity.username.clone())
        .unwrap_or_else(|| source.0.to_string());
    Ok(Resolved {
        source,
        display_name,
        join,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSource;

    #[test]
    fn parses_reference_shapes() {
        assert_eq!(
            Reference::parse("-1001234567890"),
            Some(Reference::Id(ChatId(-1001234567890)))
        );
        assert_eq!(
            Reference::parse("@news"),
            Some(Reference::Handle("news".to_string()))
        );
        assert_eq!(
            Reference::parse("https://t.me/joinchat/AbC?x=1"),
            Some(Reference::InviteHash("AbC".to_string()))
        );
        assert_eq!(
            Reference::parse("t.me/+XyZ"),
            Some(Reference::InviteHash("XyZ".to_string()))
        );
        assert_eq!(
            Reference::parse("https://telegram.me/somechan/15"),
            Some(Reference::InviteHandle("somechan".to_string()))
        );
        assert_eq!(Reference::parse("  "), None);
        assert_eq!(Reference::parse("https://t.me/+"), None);
    }

    #[test]
    fn id_encodings_round_trip() {
        for (kind, raw) in [
            (EntityKind::User, 42),
            (EntityKind::Group, 4242),
            (EntityKind::Channel, 1234567890),
        ] {
            let id = canonical_id(kind, raw).unwrap();
            assert_eq!(decode_id(id), (kind, raw));
        }
        assert_eq!(
            canonical_id(EntityKind::Channel, 1234567890),
            Some(ChatId(-1001234567890))
        );
        assert_eq!(canonical_id(EntityKind::Group, 55), Some(ChatId(-55)));
    }

    #[test]
    fn extreme_ids_do_not_overflow() {
        assert_eq!(canonical_id(EntityKind::Group, i64::MIN), None);
        assert_eq!(canonical_id(EntityKind::Channel, i64::MAX), None);
        assert_eq!(decode_id(ChatId(i64::MIN)).0, EntityKind::Channel);
        assert!(alternate_ids(ChatId(i64::MIN))
            .iter()
            .all(|(_, c)| c.0 != i64::MIN));

        let weird = Entity {
            raw_id: i64::MIN,
            kind: EntityKind::Group,
            title: None,
            username: None,
        };
        assert!(matches!(
            entity_id(&weird),
            Err(ResolveError::EntityNotFound(_))
        ));
    }

    #[test]
    fn alternates_are_bounded_and_exclude_original() {
        let alts: Vec<_> = alternate_ids(ChatId(-55)).into_iter().map(|(_, c)| c).collect();
        assert_eq!(alts, vec![ChatId(55), ChatId(-1000000000055)]);

        let alts: Vec<_> = alternate_ids(ChatId(-1000000000055))
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        assert_eq!(alts, vec![ChatId(1000000000055), ChatId(-55), ChatId(55)]);
        assert!(alts.len() <= ID_FALLBACKS.len());
    }

    #[test]
    fn identity_check_compares_names() {
        let entity = Entity {
            raw_id: 1,
            kind: EntityKind::Channel,
            title: Some("Group A".to_string()),
            username: None,
        };
        assert!(same_entity("group a", ChatId(-1), &entity));
        assert!(!same_entity("Group B", ChatId(-1), &entity));
        assert!(same_entity("-1", ChatId(-1), &entity));
    }

    #[tokio::test]
    async fn resolves_handle_and_joins() {
        let src = Arc::new(FakeSource::default());
        src.add_entity(Entity {
            raw_id: 777,
            kind: EntityKind::Channel,
            title: Some("Chan".to_string()),
            username: Some("chan".to_string()),
        });
        let resolver = IdentifierResolver::new(src.clone(), Duration::from_secs(1));

        let r = resolver.resolve("@chan").await.unwrap();
        assert_eq!(r.source, ChatId(-1000000000777));
        assert_eq!(r.display_name, "Chan");
        assert_eq!(r.join, JoinStatus::Joined);

        let again = resolver.resolve("https://t.me/chan").await.unwrap();
        assert_eq!(again.join, JoinStatus::AlreadyMember);
    }

    #[tokio::test]
    async fn join_failure_is_not_fatal() {
        let src = Arc::new(FakeSource::default());
        src.add_entity(Entity {
            raw_id: 9,
            kind: EntityKind::Channel,
            title: Some("Closed".to_string()),
            username: Some("closed".to_string()),
        });
        src.fail_joins();
        let resolver = IdentifierResolver::new(src, Duration::from_secs(1));
        let r = resolver.resolve("closed").await.unwrap();
        assert_eq!(r.join, JoinStatus::Skipped);
    }

    #[tokio::test]
    async fn invite_paths() {
        let src = Arc::new(FakeSource::default());
        src.add_invite(
            "fresh",
            Entity {
                raw_id: 10,
                kind: EntityKind::Channel,
                title: Some("Private".to_string()),
                username: None,
            },
        );
        src.expire_invite("old");
        let resolver = IdentifierResolver::new(src.clone(), Duration::from_secs(1));

        let r = resolver.resolve("https://t.me/+fresh").await.unwrap();
        assert_eq!(r.source, ChatId(-1000000000010));
        assert_eq!(r.join, JoinStatus::Joined);

        let err = resolver.resolve("https://t.me/joinchat/old").await.unwrap_err();
        assert_eq!(err, ResolveError::InviteExpired);

        // Second import reports AlreadyMember and nothing in the joined list
        // can be matched to the hash.
        let err = resolver.resolve("https://t.me/+fresh").await.unwrap_err();
        assert!(matches!(err, ResolveError::JoinFailed(_)));
    }

    #[tokio::test]
    async fn unknown_entity_is_not_found() {
        let resolver =
            IdentifierResolver::new(Arc::new(FakeSource::default()), Duration::from_secs(1));
        let err = resolver.resolve("-100").await.unwrap_err();
        assert!(matches!(err, ResolveError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn relocate_accepts_matching_fallback_only() {
        let src = Arc::new(FakeSource::default());
        // Basic group -55 was upgraded to supergroup 55.
        src.add_entity(Entity {
            raw_id: 55,
            kind: EntityKind::Channel,
            title: Some("Group A".to_string()),
            username: None,
        });
        let resolver = IdentifierResolver::new(src, Duration::from_secs(1));

        let r = resolver.relocate(ChatId(-55), "Group A").await.unwrap();
        assert_eq!(r.source, ChatId(-1000000000055));
        assert_eq!(r.via, Some("add supergroup prefix"));

        let err = resolver.relocate(ChatId(-55), "Other").await.unwrap_err();
        assert!(matches!(err, ResolveError::EntityNotFound(_)));
    }
}
