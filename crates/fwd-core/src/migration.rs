//! Repair after a chat changed its id (e.g. group upgraded to supergroup).

use tracing::{debug, info};

use crate::{domain::ChatId, domain::Subscription, service::ForwardService, Result};

impl ForwardService {
    /// Move every rule that mentions `old` (as source or target) to `new`.
    ///
    /// The store is rewritten first; bindings, buffers and jobs follow. Calling
    /// it again for the same pair finds nothing and changes nothing. Returns the
    /// rules as they are bound now.
    pub async fn repair(&self, old: ChatId, new: ChatId) -> Result<Vec<Subscription>> {
        let (rebound, touched) = {
            let mut st = self.inner.state.lock().await;
            let changed = st.store.rewrite_id(old, new)?;
            if changed.is_empty() {
                debug!(%old, %new, "nothing to repair");
                return Ok(Vec::new());
            }

            let mut touched: Vec<ChatId> = Vec::new();
            for (before, after) in &changed {
                st.relay.unregister(&before.id);
                self.inner.buffers.rekey(&before.id, &after.id);
                touched.push(before.source);
            }

            let mut rebound: Vec<Subscription> = Vec::new();
            for (_, after) in &changed {
                let Some(current) = st.store.get(&after.id).cloned() else {
                    continue;
                };
                if rebound.iter().any(|s| s.id == current.id) {
                    continue;
                }
                self.bind(&mut st, &current);
                touched.push(current.source);
                rebound.push(current);
            }

            for (before, _) in &changed {
                if !st.store.has_target(before.target) && st.jobs.cancel(before.target) {
                    debug!(target = %before.target, "report job of old id cancelled");
                }
            }

            touched.sort();
            touched.dedup();
            (rebound, touched)
        };

        for source in touched {
            self.settle_watch(source).await;
        }

        info!(%old, %new, count = rebound.len(), "subscriptions migrated");
        Ok(rebound)
    }
}
