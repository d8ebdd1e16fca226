//! Forwarding service: the one object that owns subscriptions, bindings,
//! report jobs and pending buffers.
//!
//! Lock order is always `watching` then `state` (both async), then `buffers`
//! (sync). Buffer access never awaits. Network calls never run under `state`:
//! watch and unwatch run under `watching` only, so a stalled source call
//! cannot hold up ingestion.

use std::{collections::HashSet, future::Future, sync::Arc};

use tokio::{sync::Mutex, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    aggregation::JobTable,
    buffer::PendingBuffers,
    completion::CompletionService,
    config::Config,
    dispatch::{send_with_retry, RetryPolicy},
    domain::{ChatId, Route, Subscription, SubscriptionId},
    errors::{Error, ResolveError},
    messaging::{port::MessagingPort, types::split_text},
    relay::{forward_event, migrated_to, DispatchCtx, EventRelay},
    resolver::{IdentifierResolver, JoinStatus},
    source::{SourceEvent, SourceNetwork},
    store::SubscriptionStore,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscription: Subscription,
    pub join: JoinStatus,
}

pub(crate) struct ServiceState {
    pub(crate) store: SubscriptionStore,
    pub(crate) relay: EventRelay,
    pub(crate) jobs: JobTable,
}

pub(crate) struct Inner {
    pub(crate) cfg: Arc<Config>,
    pub(crate) source: Arc<dyn SourceNetwork>,
    pub(crate) messenger: Arc<dyn MessagingPort>,
    pub(crate) completion: Option<Arc<dyn CompletionService>>,
    pub(crate) resolver: IdentifierResolver,
    pub(crate) policy: RetryPolicy,
    pub(crate) state: Mutex<ServiceState>,
    pub(crate) buffers: PendingBuffers,
    /// Sources the network currently watches for us.
    pub(crate) watching: Mutex<HashSet<ChatId>>,
    pub(crate) shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ForwardService {
    pub(crate) inner: Arc<Inner>,
}

impl ForwardService {
    pub fn new(
        cfg: Arc<Config>,
        store: SubscriptionStore,
        source: Arc<dyn SourceNetwork>,
        messenger: Arc<dyn MessagingPort>,
        completion: Option<Arc<dyn CompletionService>>,
    ) -> Self {
        let resolver = IdentifierResolver::new(source.clone(), cfg.network_timeout);
        let policy = RetryPolicy::from_config(&cfg);
        Self {
            inner: Arc::new(Inner {
                cfg,
                source,
                messenger,
                completion,
                resolver,
                policy,
                state: Mutex::new(ServiceState {
                    store,
                    relay: EventRelay::default(),
                    jobs: JobTable::default(),
                }),
                buffers: PendingBuffers::default(),
                watching: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Resolve `reference`, persist a rule into `target` and start relaying.
    pub async fn subscribe(&self, reference: &str, target: ChatId) -> Result<SubscribeOutcome> {
        let resolved = self.inner.resolver.resolve(reference).await?;
        let sub = Subscription::new(resolved.source, target, resolved.display_name);

        {
            let mut st = self.inner.state.lock().await;
            st.store.add(sub.clone())?;
            self.bind(&mut st, &sub);
        }
        if let Err(e) = self.sync_watch(sub.source).await {
            {
                let mut st = self.inner.state.lock().await;
                if let Err(rollback) = st.store.remove(&sub.id) {
                    error!(id = %sub.id, error = %rollback, "failed to roll back subscription");
                }
                self.unbind(&mut st, &sub);
            }
            self.settle_watch(sub.source).await;
            return Err(e);
        }
        info!(id = %sub.id, name = %sub.display_name, "subscription added");

        Ok(SubscribeOutcome {
            subscription: sub,
            join: resolved.join,
        })
    }

    pub async fn list(&self, target: ChatId) -> Vec<Subscription> {
        self.inner.state.lock().await.store.for_target(target)
    }

    /// Stop one rule of `target`, selected by source id, rule id or name.
    pub async fn stop(&self, target: ChatId, selector: &str) -> Result<Subscription> {
        let sel = selector.trim();
        let removed = {
            let mut st = self.inner.state.lock().await;
            let found = st
                .store
                .for_target(target)
                .into_iter()
                .find(|s| {
                    s.source.to_string() == sel
                        || s.id.0 == sel
                        || s.display_name.trim().eq_ignore_ascii_case(sel)
                })
                .ok_or_else(|| Error::NotFound(SubscriptionId(sel.to_string())))?;

            let removed = st.store.remove(&found.id)?;
            self.unbind(&mut st, &removed);
            removed
        };
        info!(id = %removed.id, "subscription stopped");
        self.settle_watch(removed.source).await;
        Ok(removed)
    }

    /// Stop every rule of `target`. An empty result means there was nothing
    /// to stop and nothing was written.
    pub async fn stop_all(&self, target: ChatId) -> Result<Vec<Subscription>> {
        let removed = {
            let mut st = self.inner.state.lock().await;
            let removed = st.store.remove_all_for_target(target)?;
            for sub in &removed {
                self.unbind(&mut st, sub);
            }
            removed
        };
        if removed.is_empty() {
            return Ok(removed);
        }
        info!(%target, count = removed.len(), "all subscriptions stopped");

        let mut sources: Vec<ChatId> = removed.iter().map(|s| s.source).collect();
        sources.sort();
        sources.dedup();
        for source in sources {
            self.settle_watch(source).await;
        }
        Ok(removed)
    }

    /// Consume the source event stream until shutdown.
    pub async fn run_ingestion(&self) -> Result<()> {
        let mut rx = self
            .inner
            .source
            .events()
            .ok_or_else(|| Error::Config("source event stream already taken".to_string()))?;
        info!("event ingestion started");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => {
                        warn!("source event stream closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Buffer `event` for every matching rule and spawn one forward task per
    /// rule. Returns the number of rules matched.
    pub async fn handle_event(&self, event: SourceEvent) -> usize {
        let routes = {
            let st = self.inner.state.lock().await;
            let routes = st.relay.routes_for(event.chat);
            if let Some(payload) = buffer_payload(&event) {
                for route in &routes {
                    self.inner.buffers.append(&route.id(), payload.clone());
                }
            }
            routes
        };

        if routes.is_empty() {
            debug!(chat = %event.chat, "event from unwatched chat");
            return 0;
        }

        let event = Arc::new(event);
        for route in &routes {
            let svc = self.clone();
            let route = route.clone();
            let event = event.clone();
            spawn_supervised("forward", async move {
                svc.forward_with_repair(route, &event).await;
            });
        }
        routes.len()
    }

    /// Cancel every job and stop watching every source.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        {
            let mut st = self.inner.state.lock().await;
            for handle in st.jobs.cancel_all() {
                handle.abort();
            }
        }
        let mut watching = self.inner.watching.lock().await;
        for source in watching.drain() {
            if let Err(e) = self.unwatch(source).await {
                debug!(%source, error = %e, "unwatch on shutdown failed");
            }
        }
        info!("forward service stopped");
    }

    pub async fn job_targets(&self) -> Vec<ChatId> {
        self.inner.state.lock().await.jobs.targets()
    }

    pub async fn is_bound(&self, id: &SubscriptionId) -> bool {
        self.inner.state.lock().await.relay.get(id).is_some()
    }

    pub fn pending(&self, id: &SubscriptionId) -> Vec<String> {
        self.inner.buffers.snapshot(id)
    }

    pub(crate) fn dispatch_ctx(&self) -> DispatchCtx {
        DispatchCtx {
            messenger: self.inner.messenger.clone(),
            source: self.inner.source.clone(),
            media_dir: self.inner.cfg.media_dir.clone(),
            policy: self.inner.policy,
        }
    }

    /// Register the binding and make sure the target has a report job. The
    /// source is watched afterwards with `sync_watch`, once `st` is released.
    pub(crate) fn bind(&self, st: &mut ServiceState, sub: &Subscription) {
        st.relay.register(sub);
        self.ensure_job(st, sub.target);
    }

    /// Drop the binding and buffer of a removed rule and cancel the target job
    /// when no rule uses it. The source is released afterwards with
    /// `settle_watch`.
    pub(crate) fn unbind(&self, st: &mut ServiceState, sub: &Subscription) {
        st.relay.unregister(&sub.id);
        self.inner.buffers.discard(&sub.id);
        if !st.store.has_target(sub.target) && st.jobs.cancel(sub.target) {
            info!(target = %sub.target, "report job cancelled");
        }
    }

    /// Watch or unwatch `source` so the network matches the bindings.
    ///
    /// Runs under the `watching` gate, which serializes concurrent callers;
    /// each one reads the bindings afresh, so the last caller wins.
    pub(crate) async fn sync_watch(&self, source: ChatId) -> Result<()> {
        let mut watching = self.inner.watching.lock().await;
        let wanted = self.inner.state.lock().await.relay.is_watching(source);
        let active = watching.contains(&source);

        if wanted && !active {
            self.watch(source).await?;
            watching.insert(source);
        } else if !wanted && active {
            // Unbound sources are ignored by routing, so a failed unwatch only
            // costs some filtered events.
            watching.remove(&source);
            self.unwatch(source).await?;
        }
        Ok(())
    }

    /// `sync_watch`, logging failures.
    pub(crate) async fn settle_watch(&self, source: ChatId) {
        if let Err(e) = self.sync_watch(source).await {
            warn!(%source, error = %e, "watch state not updated");
        }
    }

    async fn watch(&self, source: ChatId) -> Result<()> {
        match timeout(self.inner.cfg.network_timeout, self.inner.source.watch(source)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Resolve(ResolveError::Transient(format!(
                "watching {source} timed out"
            )))),
        }
    }

    async fn unwatch(&self, source: ChatId) -> Result<()> {
        match timeout(self.inner.cfg.network_timeout, self.inner.source.unwatch(source)).await {
            Ok(r) => r,
            Err(_) => Err(Error::Resolve(ResolveError::Transient(format!(
                "unwatching {source} timed out"
            )))),
        }
    }

    /// Send `text` to `target`, repairing and retrying once if the target
    /// moved. Returns the chat the text was delivered to.
    pub(crate) async fn deliver_text(&self, target: ChatId, text: &str) -> Result<ChatId> {
        let err = match self.send_chunks(target, text).await {
            Ok(()) => return Ok(target),
            Err(e) => e,
        };
        let Some(new_chat) = migrated_to(&err) else {
            return Err(err);
        };
        self.repair(target, new_chat).await?;
        self.send_chunks(new_chat, text).await?;
        Ok(new_chat)
    }

    async fn send_chunks(&self, target: ChatId, text: &str) -> Result<()> {
        let limit = self.inner.messenger.capabilities().max_message_len;
        for chunk in split_text(text, limit) {
            send_with_retry(
                self.inner.policy,
                "deliver text",
                || self.inner.messenger.pace(target),
                || self.inner.messenger.send_text(target, &chunk),
            )
            .await?;
        }
        Ok(())
    }

    async fn forward_with_repair(&self, route: Route, event: &SourceEvent) {
        let ctx = self.dispatch_ctx();
        let err = match forward_event(&ctx, &route, event).await {
            Ok(()) => return,
            Err(e) => e,
        };
        let Some(new_chat) = migrated_to(&err) else {
            warn!(id = %route.id(), error = %err, "forward failed");
            return;
        };

        if let Err(e) = self.repair(route.target, new_chat).await {
            error!(old = %route.target, new = %new_chat, error = %e, "migration repair failed");
            return;
        }
        let moved = Route {
            target: new_chat,
            ..route
        };
        if let Err(e) = forward_event(&ctx, &moved, event).await {
            warn!(id = %moved.id(), error = %e, "forward after migration failed");
        }
    }
}

/// Text kept for the next report. Photos without text still count.
fn buffer_payload(event: &SourceEvent) -> Option<String> {
    match event.text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Some(text.to_string()),
        _ => event
            .media
            .as_ref()
            .filter(|m| m.is_photo)
            .map(|_| "[photo]".to_string()),
    }
}

/// Spawn `fut` and log if it panics. Failures of one task never reach
/// ingestion.
pub(crate) fn spawn_supervised<F>(what: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(task = what, "task panicked");
            }
        }
    });
}
