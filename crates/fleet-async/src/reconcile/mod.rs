//! Reconcilers: drain buffered host results into the durable store.
//!
//! A collector hands each page of the active index to its kind's [`Reconciler`].
//! The reconciler drains the page's buffers, applies the results as batched
//! durable writes and accumulates counts into a [`RunOutcome`]. On error it stops
//! at the failing batch; counts already accumulated are kept and the collector
//! leaves the page in the index so the next run retries it. Results drained from a
//! buffer but not yet written are put back before the error is returned.
//!
//! Durable rows and timestamps carry the time the host reported, not the time of
//! the collection.

pub mod host_seen;
pub mod label;
pub mod policy;
pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{AsyncConfig, Datastore, EphemeralStore, HostId, TaskKind};
use serde::Serialize;

use crate::active::ActiveEntity;
use crate::error::Result;

pub use host_seen::HostLastSeenReconciler;
pub use label::LabelMembershipReconciler;
pub use policy::PolicyMembershipReconciler;
pub use stats::ScheduledQueryStatsReconciler;

/// Counts accumulated over one collector run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    /// Host buffers drained.
    pub keys: u64,
    /// Buffered items applied.
    pub items: u64,
}

/// Applies one kind's buffered results to the durable store.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Returns the task kind this reconciler drains.
    fn kind(&self) -> TaskKind;

    /// Drains and applies the buffers of one page of active hosts.
    async fn reconcile(
        &self,
        page: &[ActiveEntity],
        now: DateTime<Utc>,
        outcome: &mut RunOutcome,
    ) -> Result<()>;
}

/// Builds the reconciler of a task kind.
#[must_use]
pub fn for_kind(
    kind: TaskKind,
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
    config: &AsyncConfig,
) -> Arc<dyn Reconciler> {
    let task = config.task(kind).clone();
    let key_ttl = config.key_ttl(kind);
    match kind {
        TaskKind::LabelMembership => Arc::new(LabelMembershipReconciler::new(
            store, datastore, task, key_ttl,
        )),
        TaskKind::PolicyMembership => Arc::new(PolicyMembershipReconciler::new(
            store,
            datastore,
            task,
            key_ttl,
            config.policy_results_cap,
        )),
        TaskKind::ScheduledQueryStats => {
            Arc::new(ScheduledQueryStatsReconciler::new(store, datastore, task))
        }
        TaskKind::HostLastSeen => Arc::new(HostLastSeenReconciler::new(datastore, task)),
    }
}

/// Report time of every host on a page.
#[derive(Debug)]
pub(crate) struct ReportTimes {
    by_host: HashMap<HostId, DateTime<Utc>>,
    fallback: DateTime<Utc>,
}

impl ReportTimes {
    /// Reads report times from the page scores. Scores that are not valid
    /// timestamps fall back to `now`.
    pub(crate) fn of_page(page: &[ActiveEntity], now: DateTime<Utc>) -> Self {
        Self {
            by_host: page
                .iter()
                .filter_map(|entity| Some((entity.host_id, entity.reported_at()?)))
                .collect(),
            fallback: now,
        }
    }

    pub(crate) fn get(&self, host_id: HostId) -> DateTime<Utc> {
        self.by_host.get(&host_id).copied().unwrap_or(self.fallback)
    }

    /// Groups hosts by report time, oldest first.
    pub(crate) fn group(&self, hosts: &[HostId]) -> BTreeMap<DateTime<Utc>, Vec<HostId>> {
        let mut groups: BTreeMap<DateTime<Utc>, Vec<HostId>> = BTreeMap::new();
        for host_id in hosts {
            groups.entry(self.get(*host_id)).or_default().push(*host_id);
        }
        groups
    }
}

/// Counts a slice length into a run counter.
pub(crate) fn count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{MemoryDatastore, MemoryEphemeralStore};

    #[test]
    fn report_times_group_hosts_by_score() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).expect("ts");
        let now = DateTime::from_timestamp_millis(1_800_000_000_000).expect("ts");
        let entity = |host, score| ActiveEntity {
            host_id: HostId::new(host),
            score,
        };
        let times = ReportTimes::of_page(
            &[
                entity(1, at.timestamp_millis()),
                entity(2, at.timestamp_millis()),
                entity(3, i64::MAX),
            ],
            now,
        );

        assert_eq!(times.get(HostId::new(1)), at);
        assert_eq!(times.get(HostId::new(3)), now);
        assert_eq!(times.get(HostId::new(4)), now);
        let groups = times.group(&[HostId::new(1), HostId::new(2), HostId::new(3)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&at], vec![HostId::new(1), HostId::new(2)]);
        assert_eq!(groups[&now], vec![HostId::new(3)]);
    }

    #[test]
    fn for_kind_matches_kind() {
        let store: Arc<dyn EphemeralStore> = Arc::new(MemoryEphemeralStore::new());
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let config = AsyncConfig::all_enabled();
        for kind in TaskKind::ALL {
            let reconciler = for_kind(kind, store.clone(), datastore.clone(), &config);
            assert_eq!(reconciler.kind(), kind);
        }
    }
}
