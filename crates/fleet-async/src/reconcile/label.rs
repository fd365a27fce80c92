//! Label membership reconciler.
//!
//! Each host buffers a sorted set of label IDs scored `+1` (member) or `-1` (not a
//! member). The reconciler pops the set in `pop_batch_size` chunks, turns positive
//! scores into membership inserts and negative ones into deletes, and finally
//! stamps the label timestamp of every drained host.
//!
//! When a durable write fails, the popped results that were not written go back
//! into their host's set. A result buffered for the same label in the meantime is
//! newer and is kept.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    Command, Datastore, EphemeralStore, EphemeralStoreExt, HostId, LabelId, LabelMembership,
    TaskConfig, TaskKind,
};

use super::{count, Reconciler, ReportTimes, RunOutcome};
use crate::active::ActiveEntity;
use crate::error::Result;
use crate::keys;

/// Score of a buffered label the host is a member of.
pub const MEMBER_SCORE: i64 = 1;
/// Score of a buffered label the host is not a member of.
pub const NON_MEMBER_SCORE: i64 = -1;

/// Drains label membership buffers.
pub struct LabelMembershipReconciler {
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
    config: TaskConfig,
    key_ttl: Duration,
}

/// Popped membership changes not yet written. A pair is in at most one of the two
/// sets, so the latest popped result for a pair always wins.
#[derive(Default)]
struct Pending {
    inserts: BTreeSet<(LabelId, HostId)>,
    deletes: BTreeSet<(LabelId, HostId)>,
}

impl Pending {
    fn push(&mut self, pair: (LabelId, HostId), member: bool) {
        if member {
            self.deletes.remove(&pair);
            self.inserts.insert(pair);
        } else {
            self.inserts.remove(&pair);
            self.deletes.insert(pair);
        }
    }

    /// Unwritten results per host, scored the way they were buffered.
    fn by_host(&self) -> BTreeMap<HostId, Vec<(String, i64)>> {
        let mut hosts: BTreeMap<HostId, Vec<(String, i64)>> = BTreeMap::new();
        let scored = self
            .inserts
            .iter()
            .map(|pair| (pair, MEMBER_SCORE))
            .chain(self.deletes.iter().map(|pair| (pair, NON_MEMBER_SCORE)));
        for ((label_id, host_id), score) in scored {
            hosts
                .entry(*host_id)
                .or_default()
                .push((label_id.to_string(), score));
        }
        hosts
    }
}

impl LabelMembershipReconciler {
    /// Creates a reconciler. Results put back after a failed write expire after
    /// `key_ttl`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        datastore: Arc<dyn Datastore>,
        config: TaskConfig,
        key_ttl: Duration,
    ) -> Self {
        Self {
            store,
            datastore,
            config,
            key_ttl,
        }
    }

    /// Writes pending inserts; each chunk leaves `pending` once it is written.
    async fn flush_inserts(
        &self,
        pending: &mut Pending,
        times: &ReportTimes,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        while !pending.inserts.is_empty() {
            let chunk: Vec<(LabelId, HostId)> = pending
                .inserts
                .iter()
                .take(self.config.insert_batch_size)
                .copied()
                .collect();
            let rows: Vec<LabelMembership> = chunk
                .iter()
                .map(|&(label_id, host_id)| LabelMembership {
                    label_id,
                    host_id,
                    updated_at: times.get(host_id),
                })
                .collect();
            self.datastore.insert_label_memberships(&rows).await?;
            for pair in &chunk {
                pending.inserts.remove(pair);
            }
            outcome.items += count(chunk.len());
        }
        Ok(())
    }

    /// Writes pending deletes; each chunk leaves `pending` once it is written.
    async fn flush_deletes(&self, pending: &mut Pending, outcome: &mut RunOutcome) -> Result<()> {
        while !pending.deletes.is_empty() {
            let chunk: Vec<(LabelId, HostId)> = pending
                .deletes
                .iter()
                .take(self.config.delete_batch_size)
                .copied()
                .collect();
            self.datastore.delete_label_memberships(&chunk).await?;
            for pair in &chunk {
                pending.deletes.remove(pair);
            }
            outcome.items += count(chunk.len());
        }
        Ok(())
    }

    /// Pops and applies every buffer on the page.
    async fn apply(
        &self,
        page: &[ActiveEntity],
        times: &ReportTimes,
        pending: &mut Pending,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        let pop_batch = self.config.pop_batch_size;
        for entity in page {
            let host_id = entity.host_id;
            let key = keys::buffer_key(TaskKind::LabelMembership, host_id);

            loop {
                let popped = self.store.zpopmin(&key, pop_batch).await?;
                let exhausted = popped.len() < pop_batch;

                for (member, score) in popped {
                    let Ok(label_id) = member.parse::<LabelId>() else {
                        tracing::warn!(%host_id, member = %member, "skipping invalid buffered label");
                        continue;
                    };
                    pending.push((label_id, host_id), score > 0);
                }

                if pending.inserts.len() >= self.config.insert_batch_size {
                    self.flush_inserts(pending, times, outcome).await?;
                }
                if pending.deletes.len() >= self.config.delete_batch_size {
                    self.flush_deletes(pending, outcome).await?;
                }
                if exhausted {
                    break;
                }
            }
            outcome.keys += 1;
        }

        self.flush_inserts(pending, times, outcome).await?;
        self.flush_deletes(pending, outcome).await
    }

    /// Puts unwritten results back into their buffers without overwriting newer ones.
    async fn restore(&self, pending: &Pending) {
        for (host_id, members) in pending.by_host() {
            let key = keys::buffer_key(TaskKind::LabelMembership, host_id);
            let restored = self
                .store
                .run_atomic(vec![
                    Command::ZAddIfAbsent {
                        key: key.clone(),
                        members,
                    },
                    Command::Expire {
                        key,
                        ttl: self.key_ttl,
                    },
                ])
                .await;
            if let Err(err) = restored {
                tracing::warn!(%host_id, error = %err, "failed to restore unwritten label results");
            }
        }
    }
}

#[async_trait]
impl Reconciler for LabelMembershipReconciler {
    fn kind(&self) -> TaskKind {
        TaskKind::LabelMembership
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
                    .update_label_timestamps(chunk, reported_at)
                    .await?;
            }
        }

        tracing::debug!(
            hosts = count(hosts.len()),
            items = outcome.items,
            "reconciled label memberships"
        );
        Ok(())
    }
}
