//! Durable record of forwarding rules.
//!
//! The whole set is rewritten on every mutation (temp file + rename). A
//! mutation is applied to a copy first and only committed in memory once the
//! file write succeeded, so memory never diverges from disk.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    domain::{ChatId, Subscription, SubscriptionId},
    errors::Error,
    Result,
};

#[derive(Debug)]
pub struct SubscriptionStore {
    path: PathBuf,
    subs: Vec<Subscription>,
}

impl SubscriptionStore {
    /// Open the store at `path`. A missing or empty file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            subs: Vec::new(),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[Subscription] {
        &self.subs
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subs.iter().find(|s| &s.id == id)
    }

    pub fn for_target(&self, target: ChatId) -> Vec<Subscription> {
        self.subs
            .iter()
            .filter(|s| s.target == target)
            .cloned()
            .collect()
    }

    pub fn has_target(&self, target: ChatId) -> bool {
        self.subs.iter().any(|s| s.target == target)
    }

    pub fn add(&mut self, sub: Subscription) -> Result<()> {
        if self
            .subs
            .iter()
            .any(|s| s.source == sub.source && s.target == sub.target)
        {
            return Err(Error::AlreadyExists(sub.id));
        }
        let mut next = self.subs.clone();
        next.push(sub);
        self.commit(next)
    }

    pub fn remove(&mut self, id: &SubscriptionId) -> Result<Subscription> {
        let Some(pos) = self.subs.iter().position(|s| &s.id == id) else {
            return Err(Error::NotFound(id.clone()));
        };
        let mut next = self.subs.clone();
        let removed = next.remove(pos);
        self.commit(next)?;
        Ok(removed)
    }

    /// Remove every rule delivering into `target`. Nothing is written when no
    /// rule matches.
    pub fn remove_all_for_target(&mut self, target: ChatId) -> Result<Vec<Subscription>> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.subs.iter().cloned().partition(|s| s.target == target);
        if removed.is_empty() {
            return Ok(removed);
        }
        self.commit(kept)?;
        Ok(removed)
    }

    /// Rewrite `old` to `new` wherever it appears as source or target.
    ///
    /// Returns `(before, after)` pairs for each rewritten rule. If the rewrite
    /// would make two rules collide, the older duplicate is dropped so the
    /// `(source, target)` pair stays unique. Rewriting an id that no longer
    /// appears is a no-op.
    pub fn rewrite_id(
        &mut self,
        old: ChatId,
        new: ChatId,
    ) -> Result<Vec<(Subscription, Subscription)>> {
        if old == new {
            return Ok(Vec::new());
        }

        let mut changed = Vec::new();
        let mut next: Vec<Subscription> = Vec::with_capacity(self.subs.len());
        for sub in &self.subs {
            let mut updated = sub.clone();
            if updated.rewrite_chat(old, new) {
                changed.push((sub.clone(), updated.clone()));
            }
            next.push(updated);
        }
        if changed.is_empty() {
            return Ok(changed);
        }

        let mut seen = std::collections::HashSet::new();
        next.retain(|s| seen.insert((s.source, s.target)));

        self.commit(next)?;
        Ok(changed)
    }

    pub fn persist(&self) -> Result<()> {
        write_subscriptions(&self.path, &self.subs)
    }

    pub fn reload(&mut self) -> Result<()> {
        self.subs = read_subscriptions(&self.path)?;
        debug!(path = %self.path.display(), count = self.subs.len(), "subscriptions loaded");
        Ok(())
    }

    fn commit(&mut self, next: Vec<Subscription>) -> Result<()> {
        write_subscriptions(&self.path, &next)?;
        self.subs = next;
        info!(path = %self.path.display(), count = self.subs.len(), "subscriptions saved");
        Ok(())
    }
}

fn read_subscriptions(path: &Path) -> Result<Vec<Subscription>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let txt = std::fs::read_to_string(path).map_err(|e| persistence(path, e))?;
    if txt.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&txt).map_err(|e| persistence(path, e))
}

fn write_subscriptions(path: &Path, subs: &[Subscription]) -> Result<()> {
    let txt = serde_json::to_string_pretty(subs)?;

    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("subscriptions");
    let temp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));
    std::fs::write(&temp_path, txt).map_err(|e| persistence(&temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        persistence(path, e)
    })?;
    Ok(())
}

fn persistence(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
