//! Write API for per-host results.
//!
//! [`Task`] is the front end called from the agent check-in path. For every task
//! kind it either writes straight to the durable store (kind disabled) or buffers
//! the payload in the ephemeral store and lists the host in the kind's active index
//! (kind enabled), leaving the durable write to that kind's collector.
//!
//! A buffered write takes two atomic round trips:
//!
//! 1. Merge the payload into the host's buffer, refresh the buffer TTL and set the
//!    host's "reported at" marker. All three keys share the host's hash tag.
//! 2. Bump the host in the active index and purge index entries that fell out of
//!    the retention window.
//!
//! Host check-ins are special: with the kind enabled the active index is the only
//! buffer; with it disabled, check-ins collect in an in-process set flushed by
//! [`Task::flush_hosts_last_seen`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fleet_core::observability::record_span;
use fleet_core::{
    AsyncConfig, Command, Datastore, EphemeralStore, EphemeralStoreExt, HostId, LabelId,
    PolicyId, PolicyResult, ScheduledQueryStats, TaskKind,
};
use tracing::Instrument;

use crate::active::{score_of, ActiveEntityIndex};
use crate::error::{Error, Result};
use crate::keys;
use crate::metrics::{AsyncMetrics, WriteMode};
use crate::reconcile::label::{MEMBER_SCORE, NON_MEMBER_SCORE};
use crate::reconcile::policy::format_token;

/// Front-end write API for per-host results.
pub struct Task {
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
    config: Arc<AsyncConfig>,
    metrics: AsyncMetrics,
    seen_hosts: Mutex<BTreeSet<HostId>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Creates a write API over the given stores.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        datastore: Arc<dyn Datastore>,
        config: Arc<AsyncConfig>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            datastore,
            config,
            metrics: AsyncMetrics::new(),
            seen_hosts: Mutex::new(BTreeSet::new()),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AsyncConfig {
        &self.config
    }

    fn is_async(&self, kind: TaskKind) -> bool {
        self.config.task(kind).enabled
    }

    fn index(&self, kind: TaskKind) -> ActiveEntityIndex {
        ActiveEntityIndex::new(self.store.clone(), kind, self.config.key_retention)
    }

    /// Merges `commands` into the host's buffer and lists the host as active.
    async fn buffer(
        &self,
        kind: TaskKind,
        host_id: HostId,
        mut commands: Vec<Command>,
        reported_at: DateTime<Utc>,
    ) -> Result<()> {
        let ttl = self.config.key_ttl(kind);
        commands.push(Command::Expire {
            key: keys::buffer_key(kind, host_id),
            ttl,
        });
        commands.push(Command::Set {
            key: keys::reported_key(kind, host_id),
            value: score_of(reported_at).to_string(),
            ttl: Some(ttl),
        });

        self.store.run_atomic(commands).await?;
        self.index(kind).upsert(host_id, reported_at).await?;
        self.metrics.record_write(kind, WriteMode::Async);
        Ok(())
    }

    /// Records a host's label query results: `true` if the host is a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer or durable write fails.
    pub async fn record_label_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<LabelId, bool>,
        reported_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = TaskKind::LabelMembership;
        if !self.is_async(kind) {
            self.datastore
                .record_label_query_executions(host_id, results, reported_at)
                .await?;
            self.metrics.record_write(kind, WriteMode::Sync);
            return Ok(());
        }

        let mut commands = Vec::with_capacity(3);
        if !results.is_empty() {
            commands.push(Command::ZAdd {
                key: keys::buffer_key(kind, host_id),
                members: results
                    .iter()
                    .map(|(label_id, member)| {
                        let score = if *member { MEMBER_SCORE } else { NON_MEMBER_SCORE };
                        (label_id.to_string(), score)
                    })
                    .collect(),
            });
        }
        self.buffer(kind, host_id, commands, reported_at)
            .instrument(record_span(kind.as_str(), host_id.get(), "async"))
            .await
    }

    /// Records a host's policy query results.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer or durable write fails.
    pub async fn record_policy_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<PolicyId, PolicyResult>,
        reported_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = TaskKind::PolicyMembership;
        if !self.is_async(kind) {
            self.datastore
                .record_policy_query_executions(host_id, results, reported_at)
                .await?;
            self.metrics.record_write(kind, WriteMode::Sync);
            return Ok(());
        }

        let key = keys::buffer_key(kind, host_id);
        let mut commands = Vec::with_capacity(4);
        if !results.is_empty() {
            commands.push(Command::LPush {
                key: key.clone(),
                values: results
                    .iter()
                    .map(|(policy_id, result)| format_token(*policy_id, *result))
                    .collect(),
            });
            commands.push(Command::LTrim {
                key,
                start: 0,
                stop: self.config.policy_results_cap - 1,
            });
        }
        self.buffer(kind, host_id, commands, reported_at)
            .instrument(record_span(kind.as_str(), host_id.get(), "async"))
            .await
    }

    /// Records a host's scheduled query stats. The latest stats per query win.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, the buffer or the durable write fails.
    pub async fn record_scheduled_query_stats(
        &self,
        host_id: HostId,
        stats: &[ScheduledQueryStats],
        reported_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = TaskKind::ScheduledQueryStats;
        if !self.is_async(kind) {
            self.datastore
                .save_host_scheduled_query_stats(host_id, stats, reported_at)
                .await?;
            self.metrics.record_write(kind, WriteMode::Sync);
            return Ok(());
        }

        let mut fields = Vec::with_capacity(stats.len());
        for row in stats {
            fields.push((
                keys::stats_field(&row.pack_name, &row.scheduled_query_name),
                serde_json::to_string(row)?,
            ));
        }
        let mut commands = Vec::with_capacity(3);
        if !fields.is_empty() {
            commands.push(Command::HSet {
                key: keys::buffer_key(kind, host_id),
                fields,
            });
        }
        self.buffer(kind, host_id, commands, reported_at)
            .instrument(record_span(kind.as_str(), host_id.get(), "async"))
            .await
    }

    /// Records a host check-in.
    ///
    /// # Errors
    ///
    /// Returns an error if the active index write fails.
    pub async fn record_host_last_seen(
        &self,
        host_id: HostId,
        reported_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = TaskKind::HostLastSeen;
        if !self.is_async(kind) {
            self.seen_hosts
                .lock()
                .map_err(|_| poison_err())?
                .insert(host_id);
            self.metrics.record_write(kind, WriteMode::Sync);
            return Ok(());
        }

        self.index(kind)
            .upsert(host_id, reported_at)
            .instrument(record_span(kind.as_str(), host_id.get(), "async"))
            .await?;
        self.metrics.record_write(kind, WriteMode::Async);
        Ok(())
    }

    /// Writes check-ins collected while host last-seen processing is synchronous.
    ///
    /// Returns the number of hosts written. Hosts whose batch failed are kept for
    /// the next flush.
    ///
    /// # Errors
    ///
    /// Returns an error if a durable write fails.
    pub async fn flush_hosts_last_seen(&self, now: DateTime<Utc>) -> Result<usize> {
        let host_ids: Vec<HostId> = {
            let mut seen = self.seen_hosts.lock().map_err(|_| poison_err())?;
            std::mem::take(&mut *seen).into_iter().collect()
        };
        if host_ids.is_empty() {
            return Ok(0);
        }

        let batch = self.config.host_last_seen.update_batch_size;
        let mut written = 0;
        for chunk in host_ids.chunks(batch) {
            if let Err(err) = self.datastore.mark_hosts_seen(chunk, now).await {
                let mut seen = self.seen_hosts.lock().map_err(|_| poison_err())?;
                seen.extend(host_ids[written..].iter().copied());
                return Err(err.into());
            }
            written += chunk.len();
        }
        tracing::debug!(hosts = written, "flushed host last-seen");
        Ok(written)
    }

    /// Returns when a kind was last reported for a host.
    ///
    /// This is the later of the durable timestamp and the buffered "reported at"
    /// marker, so a report that is still waiting for its collector counts.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails.
    pub async fn reported_at(
        &self,
        kind: TaskKind,
        host_id: HostId,
    ) -> Result<Option<DateTime<Utc>>> {
        let durable = self.datastore.last_updated_at(kind, host_id).await?;

        let buffered_ms = match kind {
            TaskKind::HostLastSeen => self.index(kind).score(host_id).await?,
            _ => match self.store.get(&keys::reported_key(kind, host_id)).await? {
                Some(raw) => match raw.parse::<i64>() {
                    Ok(ms) => Some(ms),
                    Err(_) => {
                        tracing::warn!(%kind, %host_id, value = %raw, "ignoring malformed reported-at marker");
                        None
                    }
                },
                None => None,
            },
        };
        let buffered = buffered_ms.and_then(DateTime::from_timestamp_millis);

        Ok(durable.max(buffered))
    }
}

fn poison_err() -> Error {
    fleet_core::Error::Internal {
        message: "lock poisoned".into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{MemoryDatastore, MemoryEphemeralStore};

    fn setup(config: AsyncConfig) -> (Task, MemoryEphemeralStore, MemoryDatastore) {
        let store = MemoryEphemeralStore::new();
        let datastore = MemoryDatastore::new();
        let task = Task::new(
            Arc::new(store.clone()),
            Arc::new(datastore.clone()),
            Arc::new(config),
        )
        .expect("task");
        (task, store, datastore)
    }

    #[tokio::test]
    async fn sync_mode_writes_through() {
        let (task, store, datastore) = setup(AsyncConfig::default());
        let host = HostId::new(1);
        let now = Utc::now();

        task.record_label_query_executions(host, &BTreeMap::from([(LabelId::new(5), true)]), now)
            .await
            .expect("record");

        assert!(datastore.label_ids(host).expect("labels").contains(&LabelId::new(5)));
        assert!(store.keys().expect("keys").is_empty());
    }

    #[tokio::test]
    async fn async_mode_buffers_and_marks_host_active() {
        let (task, store, datastore) = setup(AsyncConfig::all_enabled());
        let host = HostId::new(7);
        let now = Utc::now();

        task.record_label_query_executions(
            host,
            &BTreeMap::from([(LabelId::new(1), true), (LabelId::new(2), false)]),
            now,
        )
        .await
        .expect("record");

        assert!(datastore.label_ids(host).expect("labels").is_empty());
        let buffer = keys::buffer_key(TaskKind::LabelMembership, host);
        assert_eq!(store.zscore(&buffer, "1").await.expect("score"), Some(1));
        assert_eq!(store.zscore(&buffer, "2").await.expect("score"), Some(-1));
        assert_eq!(
            store.ttl(&buffer).expect("ttl"),
            Some(task.config().key_ttl(TaskKind::LabelMembership))
        );
        assert_eq!(
            store
                .zscore(&keys::active_index_key(TaskKind::LabelMembership), "7")
                .await
                .expect("score"),
            Some(score_of(now))
        );
    }

    #[tokio::test]
    async fn reported_at_prefers_newer_buffered_marker() {
        let (task, _store, datastore) = setup(AsyncConfig::all_enabled());
        let host = HostId::new(3);
        let old = DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        datastore
            .update_policy_timestamps(&[host], old)
            .await
            .expect("seed");

        let now = DateTime::from_timestamp_millis(score_of(Utc::now())).expect("ts");
        task.record_policy_query_executions(
            host,
            &BTreeMap::from([(PolicyId::new(1), PolicyResult::Pass)]),
            now,
        )
        .await
        .expect("record");

        assert_eq!(
            task.reported_at(TaskKind::PolicyMembership, host)
                .await
                .expect("reported"),
            Some(now)
        );
        assert_eq!(
            task.reported_at(TaskKind::LabelMembership, host)
                .await
                .expect("reported"),
            None
        );
    }

    #[tokio::test]
    async fn policy_buffer_is_capped() {
        let config = AsyncConfig {
            policy_results_cap: 3,
            ..AsyncConfig::all_enabled()
        };
        let (task, store, _) = setup(config);
        let host = HostId::new(1);
        for round in 0..4_u64 {
            let results = BTreeMap::from([(PolicyId::new(round), PolicyResult::Fail)]);
            task.record_policy_query_executions(host, &results, Utc::now())
                .await
                .expect("record");
        }
        let buffered = store
            .lrange(&keys::buffer_key(TaskKind::PolicyMembership, host), 0, usize::MAX)
            .await
            .expect("lrange");
        assert_eq!(buffered, vec!["3=fail", "2=fail", "1=fail"]);
    }

    #[tokio::test]
    async fn sync_host_seen_collects_until_flushed() {
        let (task, store, datastore) = setup(AsyncConfig::default());
        let now = Utc::now();
        for id in [1, 2, 2, 3] {
            task.record_host_last_seen(HostId::new(id), now)
                .await
                .expect("record");
        }
        assert!(store.keys().expect("keys").is_empty());
        assert_eq!(datastore.seen_at(HostId::new(1)).expect("seen"), None);

        assert_eq!(task.flush_hosts_last_seen(now).await.expect("flush"), 3);
        assert_eq!(datastore.seen_at(HostId::new(2)).expect("seen"), Some(now));
        assert_eq!(task.flush_hosts_last_seen(now).await.expect("flush"), 0);
    }

    #[tokio::test]
    async fn async_host_seen_uses_index_score() {
        let (task, _store, _) = setup(AsyncConfig::all_enabled());
        let host = HostId::new(11);
        let now = DateTime::from_timestamp_millis(score_of(Utc::now())).expect("ts");
        task.record_host_last_seen(host, now).await.expect("record");
        assert_eq!(
            task.reported_at(TaskKind::HostLastSeen, host)
                .await
                .expect("reported"),
            Some(now)
        );
    }

    #[tokio::test]
    async fn stats_buffer_keeps_latest_per_query() {
        let (task, store, _) = setup(AsyncConfig::all_enabled());
        let host = HostId::new(2);
        let mut stats = ScheduledQueryStats {
            scheduled_query_name: "processes".into(),
            pack_name: "baseline".into(),
            average_memory: 1,
            denylisted: false,
            executions: 1,
            interval: 60,
            last_executed: Utc::now(),
            output_size: 0,
            system_time: 0,
            user_time: 0,
            wall_time: 0,
        };
        task.record_scheduled_query_stats(host, std::slice::from_ref(&stats), Utc::now())
            .await
            .expect("record");
        stats.executions = 2;
        task.record_scheduled_query_stats(host, std::slice::from_ref(&stats), Utc::now())
            .await
            .expect("record");

        let key = keys::buffer_key(TaskKind::ScheduledQueryStats, host);
        let page = store.hscan(&key, None, 10).await.expect("hscan");
        assert_eq!(page.items.len(), 1);
        let decoded: ScheduledQueryStats =
            serde_json::from_str(&page.items[0].1).expect("decode");
        assert_eq!(decoded.executions, 2);
    }
}
