//! In-memory durable store for testing and the demo collector service.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    Datastore, HostScheduledQueryStats, LabelMembership, PolicyMembership, PolicyResult,
    ScheduledQueryStats,
};
use crate::error::{Error, Result};
use crate::id::{HostId, LabelId, PolicyId, ScheduledQueryId};
use crate::kind::TaskKind;

/// Per-host freshness columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HostColumns {
    label_updated_at: Option<DateTime<Utc>>,
    policy_updated_at: Option<DateTime<Utc>>,
    stats_updated_at: Option<DateTime<Utc>>,
    seen_at: Option<DateTime<Utc>>,
}

impl HostColumns {
    const fn column(&self, kind: TaskKind) -> Option<DateTime<Utc>> {
        match kind {
            TaskKind::LabelMembership => self.label_updated_at,
            TaskKind::PolicyMembership => self.policy_updated_at,
            TaskKind::ScheduledQueryStats => self.stats_updated_at,
            TaskKind::HostLastSeen => self.seen_at,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    hosts: BTreeMap<HostId, HostColumns>,
    labels: BTreeMap<(LabelId, HostId), DateTime<Utc>>,
    policies: BTreeMap<(PolicyId, HostId), (PolicyResult, DateTime<Utc>)>,
    scheduled_queries: HashMap<(String, String), ScheduledQueryId>,
    next_scheduled_query_id: u64,
    query_stats: BTreeMap<(HostId, ScheduledQueryId), ScheduledQueryStats>,
}

/// In-memory durable store.
///
/// Thread-safe via `RwLock`. Clones share the same underlying data.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatastore {
    state: Arc<RwLock<State>>,
}

impl MemoryDatastore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| poison_err())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| poison_err())
    }

    /// Registers a scheduled query so stats naming it can be resolved.
    ///
    /// Registering the same `(pack, query)` pair twice returns the existing ID.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn register_scheduled_query(&self, pack: &str, query: &str) -> Result<ScheduledQueryId> {
        let mut state = self.write()?;
        let name = (pack.to_string(), query.to_string());
        if let Some(id) = state.scheduled_queries.get(&name) {
            return Ok(*id);
        }
        state.next_scheduled_query_id += 1;
        let id = ScheduledQueryId::new(state.next_scheduled_query_id);
        state.scheduled_queries.insert(name, id);
        Ok(id)
    }

    /// Returns the labels a host is currently a member of.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn label_ids(&self, host_id: HostId) -> Result<BTreeSet<LabelId>> {
        Ok(self
            .read()?
            .labels
            .keys()
            .filter(|(_, host)| *host == host_id)
            .map(|(label, _)| *label)
            .collect())
    }

    /// Returns every stored label membership pair.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn label_memberships(&self) -> Result<BTreeSet<(LabelId, HostId)>> {
        Ok(self.read()?.labels.keys().copied().collect())
    }

    /// Returns a host's stored policy results.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn policy_results(&self, host_id: HostId) -> Result<BTreeMap<PolicyId, PolicyResult>> {
        Ok(self
            .read()?
            .policies
            .iter()
            .filter(|((_, host), _)| *host == host_id)
            .map(|((policy, _), (result, _))| (*policy, *result))
            .collect())
    }

    /// Returns a host's stored scheduled query stats.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn query_stats(
        &self,
        host_id: HostId,
    ) -> Result<BTreeMap<ScheduledQueryId, ScheduledQueryStats>> {
        Ok(self
            .read()?
            .query_stats
            .iter()
            .filter(|((host, _), _)| *host == host_id)
            .map(|((_, query), stats)| (*query, stats.clone()))
            .collect())
    }

    /// Returns a host's `seen_at` column.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn seen_at(&self, host_id: HostId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read()?
            .hosts
            .get(&host_id)
            .and_then(|columns| columns.seen_at))
    }
}

fn poison_err() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn record_label_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<LabelId, bool>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for (label_id, matched) in results {
            if *matched {
                state.labels.insert((*label_id, host_id), updated_at);
            } else {
                state.labels.remove(&(*label_id, host_id));
            }
        }
        state.hosts.entry(host_id).or_default().label_updated_at = Some(updated_at);
        drop(state);
        Ok(())
    }

    async fn record_policy_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<PolicyId, PolicyResult>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for (policy_id, result) in results {
            state
                .policies
                .insert((*policy_id, host_id), (*result, updated_at));
        }
        state.hosts.entry(host_id).or_default().policy_updated_at = Some(updated_at);
        drop(state);
        Ok(())
    }

    async fn save_host_scheduled_query_stats(
        &self,
        host_id: HostId,
        stats: &[ScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for row in stats {
            let Some(query_id) = state.scheduled_queries.get(&row.query_name()).copied() else {
                continue;
            };
            state.query_stats.insert((host_id, query_id), row.clone());
        }
        state.hosts.entry(host_id).or_default().stats_updated_at = Some(updated_at);
        drop(state);
        Ok(())
    }

    async fn mark_hosts_seen(&self, host_ids: &[HostId], seen_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        for host_id in host_ids {
            state.hosts.entry(*host_id).or_default().seen_at = Some(seen_at);
        }
        drop(state);
        Ok(())
    }

    async fn insert_label_memberships(&self, rows: &[LabelMembership]) -> Result<()> {
        let mut state = self.write()?;
        for row in rows {
            state
                .labels
                .insert((row.label_id, row.host_id), row.updated_at);
        }
        drop(state);
        Ok(())
    }

    async fn delete_label_memberships(&self, pairs: &[(LabelId, HostId)]) -> Result<()> {
        let mut state = self.write()?;
        for pair in pairs {
            state.labels.remove(pair);
        }
        drop(state);
        Ok(())
    }

    async fn update_label_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for host_id in host_ids {
            state.hosts.entry(*host_id).or_default().label_updated_at = Some(updated_at);
        }
        drop(state);
        Ok(())
    }

    async fn insert_policy_memberships(&self, rows: &[PolicyMembership]) -> Result<()> {
        let mut state = self.write()?;
        for row in rows {
            state
                .policies
                .insert((row.policy_id, row.host_id), (row.result, row.updated_at));
        }
        drop(state);
        Ok(())
    }

    async fn update_policy_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for host_id in host_ids {
            state.hosts.entry(*host_id).or_default().policy_updated_at = Some(updated_at);
        }
        drop(state);
        Ok(())
    }

    async fn scheduled_query_ids_by_name(
        &self,
        names: &[(String, String)],
    ) -> Result<HashMap<(String, String), ScheduledQueryId>> {
        let state = self.read()?;
        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .scheduled_queries
                    .get(name)
                    .map(|id| (name.clone(), *id))
            })
            .collect())
    }

    async fn upsert_scheduled_query_stats(
        &self,
        rows: &[HostScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write()?;
        for row in rows {
            state
                .query_stats
                .insert((row.host_id, row.scheduled_query_id), row.stats.clone());
            state.hosts.entry(row.host_id).or_default().stats_updated_at = Some(updated_at);
        }
        drop(state);
        Ok(())
    }

    async fn last_updated_at(
        &self,
        kind: TaskKind,
        host_id: HostId,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read()?
            .hosts
            .get(&host_id)
            .and_then(|columns| columns.column(kind)))
    }
}
