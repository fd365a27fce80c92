//! Host last-seen reconciler.
//!
//! Host check-ins have no per-host buffer: the active index itself records which
//! hosts checked in, so a page of the index is applied directly as one `seen_at`
//! update per `update_batch_size` chunk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{Datastore, HostId, TaskConfig, TaskKind};

use super::{count, Reconciler, RunOutcome};
use crate::active::ActiveEntity;
use crate::error::Result;

/// Applies host check-ins recorded in the active index.
pub struct HostLastSeenReconciler {
    datastore: Arc<dyn Datastore>,
    config: TaskConfig,
}

impl HostLastSeenReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(datastore: Arc<dyn Datastore>, config: TaskConfig) -> Self {
        Self { datastore, config }
    }
}

#[async_trait]
impl Reconciler for HostLastSeenReconciler {
    fn kind(&self) -> TaskKind {
        TaskKind::HostLastSeen
    }

    async fn reconcile(
        &self,
        page: &[ActiveEntity],
        now: DateTime<Utc>,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        let host_ids: Vec<HostId> = page.iter().map(|entity| entity.host_id).collect();
        for chunk in host_ids.chunks(self.config.update_batch_size) {
            self.datastore.mark_hosts_seen(chunk, now).await?;
            outcome.keys += count(chunk.len());
            outcome.items += count(chunk.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::MemoryDatastore;

    #[tokio::test]
    async fn marks_every_host_in_page() {
        let datastore = MemoryDatastore::new();
        let config = TaskConfig {
            update_batch_size: 2,
            ..TaskConfig::enabled()
        };
        let reconciler = HostLastSeenReconciler::new(Arc::new(datastore.clone()), config);

        let page: Vec<ActiveEntity> = (1..=5)
            .map(|id| ActiveEntity {
                host_id: HostId::new(id),
                score: 1,
            })
            .collect();
        let now = Utc::now();
        let mut outcome = RunOutcome::default();
        reconciler
            .reconcile(&page, now, &mut outcome)
            .await
            .expect("reconcile");

        assert_eq!(outcome, RunOutcome { keys: 5, items: 5 });
        for id in 1..=5 {
            assert_eq!(datastore.seen_at(HostId::new(id)).expect("seen"), Some(now));
        }
    }
}
