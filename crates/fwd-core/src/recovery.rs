//! Startup: reconnect, re-check every stored rule and bind it again.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::{
    domain::{ChatId, Subscription, SubscriptionId},
    errors::{Error, ResolveError},
    service::ForwardService,
    Result,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    /// `(stored source, current source)` for every relocated source.
    pub relocated: Vec<(ChatId, ChatId)>,
    /// Rules that could not be restored. They stay in the store.
    pub failed: Vec<(SubscriptionId, String)>,
}

enum RecoveredRule {
    Restored,
    Relocated { from: ChatId, to: ChatId },
    /// Already rewritten while relocating an earlier rule.
    Superseded,
}

/// Upper bound for the wait between two recovery rounds.
const RECOVERY_RETRY_MAX: Duration = Duration::from_secs(300);

impl ForwardService {
    /// Run `recover` until it gets through or the service shuts down.
    ///
    /// Returns `None` only on shutdown. Stored rules stay unbound while the
    /// source network is unreachable and are bound by the first round that
    /// connects.
    pub async fn recover_until_connected(&self) -> Option<RecoveryReport> {
        let mut round = 0u32;
        loop {
            round += 1;
            let err = match self.recover().await {
                Ok(report) => return Some(report),
                Err(e) => e,
            };
            let wait = self.inner.policy.delay(round, None).min(RECOVERY_RETRY_MAX);
            warn!(round, ?wait, error = %err, "recovery failed, retrying");
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return None,
                _ = sleep(wait) => {}
            }
        }
    }

    /// Connect to the source network and rebind every stored rule.
    ///
    /// A rule that fails is logged and reported, never removed, and never
    /// stops the others.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.connect().await?;

        let snapshot: Vec<Subscription> = self.inner.state.lock().await.store.list().to_vec();
        let mut report = RecoveryReport::default();

        for sub in &snapshot {
            match self.recover_one(sub).await {
                Ok(RecoveredRule::Restored) => report.restored += 1,
                Ok(RecoveredRule::Relocated { from, to }) => {
                    report.restored += 1;
                    if !report.relocated.contains(&(from, to)) {
                        report.relocated.push((from, to));
                    }
                }
                Ok(RecoveredRule::Superseded) => report.restored += 1,
                Err(e) => {
                    warn!(id = %sub.id, name = %sub.display_name, error = %e, "could not restore subscription");
                    report.failed.push((sub.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            restored = report.restored,
            relocated = report.relocated.len(),
            failed = report.failed.len(),
            "subscriptions recovered"
        );
        Ok(report)
    }

    /// Connect with bounded, backed-off retries.
    async fn connect(&self) -> Result<()> {
        let policy = self.inner.policy;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match timeout(policy.call_timeout, self.inner.source.connect()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => Error::Resolve(ResolveError::Transient(
                    "connecting to the source network timed out".to_string(),
                )),
            };
            if attempt >= policy.max_attempts {
                return Err(err);
            }
            let wait = policy.delay(attempt, None);
            warn!(attempt, ?wait, error = %err, "connect failed, retrying");
            sleep(wait).await;
        }
    }

    async fn recover_one(&self, sub: &Subscription) -> Result<RecoveredRule> {
        let found = self
            .inner
            .resolver
            .relocate(sub.source, &sub.display_name)
            .await?;

        let mut st = self.inner.state.lock().await;
        let Some(current) = st.store.get(&sub.id).cloned() else {
            return Ok(RecoveredRule::Superseded);
        };
        if found.source != current.source {
            drop(st);
            self.repair(current.source, found.source).await?;
            return Ok(RecoveredRule::Relocated {
                from: current.source,
                to: found.source,
            });
        }

        self.bind(&mut st, &current);
        drop(st);
        if let Err(e) = self.sync_watch(current.source).await {
            // Keep the rule stored but inactive, as if it never bound.
            let mut st = self.inner.state.lock().await;
            st.relay.unregister(&current.id);
            if !st.relay.serves_target(current.target) {
                st.jobs.cancel(current.target);
            }
            return Err(e);
        }
        Ok(RecoveredRule::Restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Entity, EntityKind};
    use crate::test_support::{harness_seeded, FakeCompletion};

    fn sub(source: i64, target: i64, name: &str) -> Subscription {
        Subscription::new(ChatId(source), ChatId(target), name)
    }

    #[tokio::test]
    async fn restores_relocates_and_isolates_failures() {
        let h = harness_seeded(
            FakeCompletion::replying("ok"),
            vec![
                sub(-111, 999, "Group A"),
                sub(-55, 999, "Group B"),
                sub(-77, 500, "Gone"),
            ],
        );
        h.source.add_entity(Entity {
            raw_id: 111,
            kind: EntityKind::Group,
            title: Some("Group A".to_string()),
            username: None,
        });
        // -55 was upgraded to a supergroup.
        h.source.add_entity(Entity {
            raw_id: 55,
            kind: EntityKind::Channel,
            title: Some("Group B".to_string()),
            username: None,
        });

        let report = h.service.recover().await.unwrap();
        assert_eq!(h.source.connects(), 1);
        assert_eq!(report.restored, 2);
        assert_eq!(report.relocated, vec![(ChatId(-55), ChatId(-1000000000055))]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, SubscriptionId("-77_500".into()));

        // The failed rule is kept for the next start.
        assert_eq!(h.service.list(ChatId(500)).await.len(), 1);
        assert!(!h.service.is_bound(&SubscriptionId("-77_500".into())).await);

        assert!(h.service.is_bound(&SubscriptionId("-111_999".into())).await);
        assert!(
            h.service
                .is_bound(&SubscriptionId("-1000000000055_999".into()))
                .await
        );
        assert_eq!(h.service.job_targets().await, vec![ChatId(999)]);

        let watched = h.source.watched();
        assert!(watched.contains(&ChatId(-111)));
        assert!(watched.contains(&ChatId(-1000000000055)));
        assert!(!watched.contains(&ChatId(-55)));
    }

    #[tokio::test]
    async fn rules_sharing_a_relocated_source_move_together() {
        let h = harness_seeded(
            FakeCompletion::replying("ok"),
            vec![sub(-55, 1, "Group B"), sub(-55, 2, "Group B")],
        );
        h.source.add_entity(Entity {
            raw_id: 55,
            kind: EntityKind::Channel,
            title: Some("Group B".to_string()),
            username: None,
        });

        let report = h.service.recover().await.unwrap();
        assert_eq!(report.restored, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.relocated.len(), 1);
        for target in [1, 2] {
            let subs = h.service.list(ChatId(target)).await;
            assert_eq!(subs[0].source, ChatId(-1000000000055));
        }
    }

    #[tokio::test]
    async fn fallback_to_a_different_chat_is_rejected() {
        let h = harness_seeded(FakeCompletion::replying("ok"), vec![sub(-55, 1, "Group B")]);
        h.source.add_entity(Entity {
            raw_id: 55,
            kind: EntityKind::Channel,
            title: Some("Unrelated".to_string()),
            username: None,
        });

        let report = h.service.recover().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(h.service.list(ChatId(1)).await[0].source, ChatId(-55));
    }

    #[tokio::test]
    async fn connect_is_retried_before_giving_up() {
        let h = harness_seeded(FakeCompletion::replying("ok"), vec![sub(-111, 999, "Group A")]);
        h.source.add_entity(Entity {
            raw_id: 111,
            kind: EntityKind::Group,
            title: Some("Group A".to_string()),
            username: None,
        });
        h.source.fail_connects(1);

        let report = h.service.recover().await.unwrap();
        assert_eq!(h.source.connects(), 2);
        assert_eq!(report.restored, 1);
        assert!(h.service.is_bound(&SubscriptionId("-111_999".into())).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_network_is_retried_until_rules_bind() {
        let h = harness_seeded(FakeCompletion::replying("ok"), vec![sub(-111, 999, "Group A")]);
        h.source.add_entity(Entity {
            raw_id: 111,
            kind: EntityKind::Group,
            title: Some("Group A".to_string()),
            username: None,
        });
        // One whole round fails (3 attempts), the next connects.
        h.source.fail_connects(4);

        assert!(h.service.recover().await.is_err());
        assert!(!h.service.is_bound(&SubscriptionId("-111_999".into())).await);

        h.source.fail_connects(4);
        let report = h.service.recover_until_connected().await.unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(h.source.connects(), 3 + 5);
        assert!(h.service.is_bound(&SubscriptionId("-111_999".into())).await);
        assert_eq!(h.service.job_targets().await, vec![ChatId(999)]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_retries_stop_on_shutdown() {
        let h = harness_seeded(FakeCompletion::replying("ok"), vec![sub(-111, 999, "Group A")]);
        h.source.fail_connects(usize::MAX);

        let svc = h.service.clone();
        let task = tokio::spawn(async move { svc.recover_until_connected().await });
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.service.shutdown().await;

        assert_eq!(task.await.unwrap(), None);
        assert_eq!(h.service.list(ChatId(999)).await.len(), 1);
    }
}
