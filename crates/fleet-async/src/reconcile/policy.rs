//! Policy membership reconciler.
//!
//! Each host buffers a capped list of `policyID=result` tokens, newest at the head.
//! The reconciler reads and deletes the list in one atomic batch, replays the tokens
//! oldest-first so the latest result per policy wins, and upserts the results.
//!
//! Tokens of hosts whose rows fail to write are appended back at the tail, the
//! oldest end, so results buffered since the drain still win.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    Command, Datastore, EphemeralStore, HostId, PolicyId, PolicyMembership, PolicyResult, Reply,
    TaskConfig, TaskKind,
};

use super::{count, Reconciler, ReportTimes, RunOutcome};
use crate::active::ActiveEntity;
use crate::error::Result;
use crate::keys;

/// Formats a buffered policy result token.
#[must_use]
pub fn format_token(policy_id: PolicyId, result: PolicyResult) -> String {
    format!("{policy_id}={result}")
}

/// Parses a buffered policy result token.
#[must_use]
pub fn parse_token(token: &str) -> Option<(PolicyId, PolicyResult)> {
    let (policy, result) = token.split_once('=')?;
    Some((policy.parse().ok()?, result.parse().ok()?))
}

/// Drains policy result buffers.
pub struct PolicyMembershipReconciler {
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
    config: TaskConfig,
    key_ttl: Duration,
    results_cap: usize,
}

/// A host's drained tokens, head first, and how many of them parsed.
struct DrainedHost {
    tokens: Vec<String>,
    items: u64,
}

/// Rows drained from the ephemeral store but not yet written.
#[derive(Default)]
struct Pending {
    rows: Vec<PolicyMembership>,
    hosts: BTreeMap<HostId, DrainedHost>,
}

impl PolicyMembershipReconciler {
    /// Creates a reconciler. Tokens put back after a failed write keep at most
    /// `results_cap` entries per host and expire after `key_ttl`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        datastore: Arc<dyn Datastore>,
        config: TaskConfig,
        key_ttl: Duration,
        results_cap: usize,
    ) -> Self {
        Self {
            store,
            datastore,
            config,
            key_ttl,
            results_cap,
        }
    }

    /// Reads and clears a host's buffer, returning its tokens head first.
    async fn drain(&self, host_id: HostId) -> Result<Vec<String>> {
        let key = keys::buffer_key(TaskKind::PolicyMembership, host_id);
        let replies = self
            .store
            .run_atomic(vec![
                Command::LRange {
                    key: key.clone(),
                    start: 0,
                    stop: usize::MAX,
                },
                Command::Del { key },
            ])
            .await?;
        Ok(replies
            .into_iter()
            .next()
            .unwrap_or(Reply::Nil)
            .into_list("LRANGE")?)
    }

    /// Writes pending rows in chunks. Hosts whose rows are all written leave
    /// `pending` and count towards `outcome`.
    async fn flush(&self, pending: &mut Pending, outcome: &mut RunOutcome) -> Result<()> {
        let mut written = 0;
        let mut result = Ok(());
        for chunk in pending.rows.chunks(self.config.insert_batch_size) {
            if let Err(err) = self.datastore.insert_policy_memberships(chunk).await {
                result = Err(err.into());
                break;
            }
            written += chunk.len();
        }
        pending.rows.drain(..written);

        let unwritten: BTreeSet<HostId> = pending.rows.iter().map(|row| row.host_id).collect();
        pending.hosts.retain(|host_id, drained| {
            if unwritten.contains(host_id) {
                return true;
            }
            outcome.items += drained.items;
            false
        });
        result
    }

    /// Drains and applies every buffer on the page.
    async fn apply(
        &self,
        page: &[ActiveEntity],
        times: &ReportTimes,
        pending: &mut Pending,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        for entity in page {
            let host_id = entity.host_id;
            let tokens = self.drain(host_id).await?;
            outcome.keys += 1;

            let (latest, items) = latest_results(host_id, &tokens);
            let updated_at = times.get(host_id);
            pending
                .rows
                .extend(latest.into_iter().map(|(policy_id, result)| PolicyMembership {
                    policy_id,
                    host_id,
                    result,
                    updated_at,
                }));
            pending.hosts.insert(host_id, DrainedHost { tokens, items });

            if pending.rows.len() >= self.config.insert_batch_size {
                self.flush(pending, outcome).await?;
            }
        }
        self.flush(pending, outcome).await
    }

    /// Appends unwritten tokens behind anything buffered since the drain, then
    /// re-applies the cap.
    async fn restore(&self, pending: &Pending) {
        for (host_id, drained) in &pending.hosts {
            if drained.tokens.is_empty() {
                continue;
            }
            let key = keys::buffer_key(TaskKind::PolicyMembership, *host_id);
            let restored = self
                .store
                .run_atomic(vec![
                    Command::RPush {
                        key: key.clone(),
                        values: drained.tokens.clone(),
                    },
                    Command::LTrim {
                        key: key.clone(),
                        start: 0,
                        stop: self.results_cap.saturating_sub(1),
                    },
                    Command::Expire {
                        key,
                        ttl: self.key_ttl,
                    },
                ])
                .await;
            if let Err(err) = restored {
                tracing::warn!(%host_id, error = %err, "failed to restore unwritten policy results");
            }
        }
    }
}

/// Replays tokens oldest-first so the latest result per policy wins. Returns the
/// results and the number of tokens that parsed.
fn latest_results(host_id: HostId, tokens: &[String]) -> (BTreeMap<PolicyId, PolicyResult>, u64) {
    let mut latest = BTreeMap::new();
    let mut items = 0;
    for token in tokens.iter().rev() {
        let Some((policy_id, result)) = parse_token(token) else {
            tracing::warn!(%host_id, token = %token, "skipping malformed policy result");
            continue;
        };
        latest.insert(policy_id, result);
        items += 1;
    }
    (latest, items)
}

#[async_trait]
impl Reconciler for PolicyMembershipReconciler {
    fn kind(&self) -> TaskKind {
        TaskKind::PolicyMembership
    }

    async fn reconcile(
        &self,
        page: &[ActiveEntity],
        now: DateTime<Utc>,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        let times = ReportTimes::of_page(page, now);
        let mut pending = Pending::default();

        if let Err(err) = self.apply(page, &times, &mut pending, outcome).await {
            self.restore(&pending).await;
            return Err(err);
        }

        let hosts: Vec<HostId> = page.iter().map(|entity| entity.host_id).collect();
        for (reported_at, group) in times.group(&hosts) {
            for chunk in group.chunks(self.config.update_batch_size) {
                self.datastore
                    .update_policy_timestamps(chunk, reported_at)
                    .await?;
            }
        }

        tracing::debug!(
            hosts = count(hosts.len()),
            items = outcome.items,
            "reconciled policy memberships"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{EphemeralStoreExt, MemoryDatastore, MemoryEphemeralStore};
    use fleet_test_utils::{DatastoreOp, FailingDatastore};

    fn reconciler(
        store: &MemoryEphemeralStore,
        datastore: Arc<dyn Datastore>,
        config: TaskConfig,
    ) -> PolicyMembershipReconciler {
        PolicyMembershipReconciler::new(
            Arc::new(store.clone()),
            datastore,
            config,
            Duration::from_secs(60),
            3,
        )
    }

    async fn push(store: &MemoryEphemeralStore, host: HostId, tokens: &[&str]) {
        store
            .execute(Command::LPush {
                key: keys::buffer_key(TaskKind::PolicyMembership, host),
                values: tokens.iter().map(ToString::to_string).collect(),
            })
            .await
            .expect("lpush");
    }

    #[test]
    fn token_roundtrip_and_rejects() {
        let token = format_token(PolicyId::new(12), PolicyResult::Unknown);
        assert_eq!(token, "12=unknown");
        assert_eq!(
            parse_token(&token),
            Some((PolicyId::new(12), PolicyResult::Unknown))
        );
        assert_eq!(parse_token("12"), None);
        assert_eq!(parse_token("x=pass"), None);
        assert_eq!(parse_token("3=maybe"), None);
    }

    #[tokio::test]
    async fn latest_result_wins_and_malformed_tokens_are_skipped() {
        let store = MemoryEphemeralStore::new();
        let datastore = MemoryDatastore::new();
        let host = HostId::new(4);
        let key = keys::buffer_key(TaskKind::PolicyMembership, host);

        // Pushed oldest first; the head of the list is the newest.
        store
            .execute(Command::LPush {
                key: key.clone(),
                values: vec![
                    "1=fail".into(),
                    "garbage".into(),
                    "2=pass".into(),
                    "1=pass".into(),
                ],
            })
            .await
            .expect("lpush");

        let reconciler = reconciler(&store, Arc::new(datastore.clone()), TaskConfig::enabled());
        let mut outcome = RunOutcome::default();
        reconciler
            .reconcile(
                &[ActiveEntity {
                    host_id: host,
                    score: 1,
                }],
                Utc::now(),
                &mut outcome,
            )
            .await
            .expect("reconcile");

        assert_eq!(outcome, RunOutcome { keys: 1, items: 3 });
        assert_eq!(
            datastore.policy_results(host).expect("results"),
            BTreeMap::from([
                (PolicyId::new(1), PolicyResult::Pass),
                (PolicyId::new(2), PolicyResult::Pass),
            ])
        );
        assert!(store.lrange(&key, 0, usize::MAX).await.expect("lrange").is_empty());
    }

    #[tokio::test]
    async fn failed_write_appends_tokens_behind_newer_results() {
        let store = MemoryEphemeralStore::new();
        let datastore = MemoryDatastore::new();
        let failing = FailingDatastore::new(datastore.clone());
        failing.fail_once(DatastoreOp::InsertPolicyMemberships);
        let host = HostId::new(2);
        push(&store, host, &["1=fail", "2=pass"]).await;

        let reconciler = reconciler(&store, Arc::new(failing), TaskConfig::enabled());
        let page = [ActiveEntity {
            host_id: host,
            score: 1_700_000_000_000,
        }];
        let mut outcome = RunOutcome::default();
        assert!(reconciler
            .reconcile(&page, Utc::now(), &mut outcome)
            .await
            .is_err());
        assert_eq!(outcome, RunOutcome { keys: 1, items: 0 });

        // A result for policy 1 arrives before the next run.
        push(&store, host, &["1=pass"]).await;
        let key = keys::buffer_key(TaskKind::PolicyMembership, host);
        assert_eq!(
            store.lrange(&key, 0, usize::MAX).await.expect("lrange"),
            vec!["1=pass", "2=pass", "1=fail"]
        );

        let mut outcome = RunOutcome::default();
        reconciler
            .reconcile(&page, Utc::now(), &mut outcome)
            .await
            .expect("retry");
        assert_eq!(outcome, RunOutcome { keys: 1, items: 3 });
        assert_eq!(
            datastore.policy_results(host).expect("results"),
            BTreeMap::from([
                (PolicyId::new(1), PolicyResult::Pass),
                (PolicyId::new(2), PolicyResult::Pass),
            ])
        );
        assert_eq!(
            datastore
                .last_updated_at(TaskKind::PolicyMembership, host)
                .await
                .expect("ts"),
            DateTime::from_timestamp_millis(1_700_000_000_000)
        );
    }

    #[tokio::test]
    async fn restore_reapplies_the_cap() {
        let store = MemoryEphemeralStore::new();
        let reconciler = reconciler(
            &store,
            Arc::new(MemoryDatastore::new()),
            TaskConfig::enabled(),
        );
        let host = HostId::new(5);
        push(&store, host, &["3=pass", "4=pass"]).await;

        let mut pending = Pending::default();
        pending.hosts.insert(
            host,
            DrainedHost {
                tokens: vec!["2=fail".into(), "1=fail".into()],
                items: 2,
            },
        );
        reconciler.restore(&pending).await;

        let key = keys::buffer_key(TaskKind::PolicyMembership, host);
        assert_eq!(
            store.lrange(&key, 0, usize::MAX).await.expect("lrange"),
            vec!["4=pass", "3=pass", "2=fail"]
        );
    }
}
