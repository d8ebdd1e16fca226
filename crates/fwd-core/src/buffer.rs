//! Pending buffers: raw text collected per subscription between ticks.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use crate::domain::SubscriptionId;

#[derive(Debug, Default)]
pub struct PendingBuffers {
    inner: Mutex<HashMap<SubscriptionId, Vec<String>>>,
}

impl PendingBuffers {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Vec<String>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, id: &SubscriptionId, text: String) {
        self.lock().entry(id.clone()).or_default().push(text);
    }

    /// Take everything buffered for `ids`. Buffers are cleared in place, so a
    /// re-query right after returns nothing.
    pub fn drain<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a SubscriptionId>,
    ) -> HashMap<SubscriptionId, Vec<String>> {
        let mut map = self.lock();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(buf) = map.get_mut(id) {
                if !buf.is_empty() {
                    out.insert(id.clone(), std::mem::take(buf));
                }
            }
        }
        out
    }

    pub fn discard(&self, id: &SubscriptionId) {
        self.lock().remove(id);
    }

    /// Move `old`'s items under `new`, after anything `new` already holds.
    pub fn rekey(&self, old: &SubscriptionId, new: &SubscriptionId) {
        if old == new {
            return;
        }
        let mut map = self.lock();
        if let Some(items) = map.remove(old) {
            map.entry(new.clone()).or_default().extend(items);
        }
    }

    pub fn snapshot(&self, id: &SubscriptionId) -> Vec<String> {
        self.lock().get(id).cloned().unwrap_or_default()
    }
}
