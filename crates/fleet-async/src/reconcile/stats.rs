//! Scheduled query stats reconciler.
//!
//! Each host buffers a hash keyed by `pack\0query` holding the JSON-encoded latest
//! stats of that scheduled query. For a page of hosts the reconciler scans every
//! hash in `scan_page_size` pages, resolves the distinct `(pack, query)` names of
//! the whole page with one lookup, upserts the resolved rows in `insert_batch_size`
//! chunks and only then deletes the drained hashes. Rows naming a query that no
//! longer exists are dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    Datastore, EphemeralStore, EphemeralStoreExt, HostId, HostScheduledQueryStats,
    ScheduledQueryStats, TaskConfig, TaskKind,
};

use super::{count, Reconciler, RunOutcome};
use crate::active::ActiveEntity;
use crate::error::Result;
use crate::keys;

/// Drains scheduled query stats buffers.
pub struct ScheduledQueryStatsReconciler {
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
    config: TaskConfig,
}

impl ScheduledQueryStatsReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        datastore: Arc<dyn Datastore>,
        config: TaskConfig,
    ) -> Self {
        Self {
            store,
            datastore,
            config,
        }
    }

    /// Decodes one scan page of buffered fields, skipping undecodable entries.
    fn decode(
        host_id: HostId,
        fields: Vec<(String, String)>,
    ) -> impl Iterator<Item = (HostId, ScheduledQueryStats)> {
        fields.into_iter().filter_map(move |(field, value)| {
            if keys::parse_stats_field(&field).is_none() {
                tracing::warn!(%host_id, field = %field.escape_debug(), "skipping malformed stats field");
                return None;
            }
            match serde_json::from_str::<ScheduledQueryStats>(&value) {
                Ok(stats) => Some((host_id, stats)),
                Err(err) => {
                    tracing::warn!(%host_id, error = %err, "skipping undecodable stats value");
                    None
                }
            }
        })
    }

    /// Resolves every decoded row of a page with a single name lookup.
    async fn resolve(
        &self,
        decoded: Vec<(HostId, ScheduledQueryStats)>,
    ) -> Result<Vec<HostScheduledQueryStats>> {
        if decoded.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<(String, String)> = decoded
            .iter()
            .map(|(_, stats)| stats.query_name())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids = self.datastore.scheduled_query_ids_by_name(&names).await?;

        let total = decoded.len();
        let rows: Vec<HostScheduledQueryStats> = decoded
            .into_iter()
            .filter_map(|(host_id, stats)| {
                ids.get(&stats.query_name())
                    .map(|id| HostScheduledQueryStats {
                        host_id,
                        scheduled_query_id: *id,
                        stats,
                    })
            })
            .collect();
        if rows.len() < total {
            tracing::debug!(
                dropped = total - rows.len(),
                "dropped stats for unknown scheduled queries"
            );
        }
        Ok(rows)
    }
}

#[async_trait]
impl Reconciler for ScheduledQueryStatsReconciler {
    fn kind(&self) -> TaskKind {
        TaskKind::ScheduledQueryStats
    }

    async fn reconcile(
        &self,
        page: &[ActiveEntity],
        now: DateTime<Utc>,
        outcome: &mut RunOutcome,
    ) -> Result<()> {
        let mut decoded = Vec::new();
        let mut drained = Vec::with_capacity(page.len());

        for entity in page {
            let host_id = entity.host_id;
            let key = keys::buffer_key(TaskKind::ScheduledQueryStats, host_id);

            let mut cursor = None;
            loop {
                let scanned = self
                    .store
                    .hscan(&key, cursor, self.config.scan_page_size)
                    .await?;
                outcome.items += count(scanned.items.len());
                decoded.extend(Self::decode(host_id, scanned.items));

                match scanned.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            drained.push(key);
        }

        let rows = self.resolve(decoded).await?;
        for chunk in rows.chunks(self.config.insert_batch_size) {
            self.datastore.upsert_scheduled_query_stats(chunk, now).await?;
        }

        // The hashes may only go once every row read from them is durable.
        for key in &drained {
            self.store.del(key).await?;
            outcome.keys += 1;
        }

        tracing::debug!(
            hosts = outcome.keys,
            rows = count(rows.len()),
            items = outcome.items,
            "reconciled scheduled query stats"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Command, MemoryDatastore, MemoryEphemeralStore};

    fn stats(pack: &str, query: &str, executions: u64) -> ScheduledQueryStats {
        ScheduledQueryStats {
            scheduled_query_name: query.into(),
            pack_name: pack.into(),
            average_memory: 0,
            denylisted: false,
            executions,
            interval: 60,
            last_executed: Utc::now(),
            output_size: 0,
            system_time: 0,
            user_time: 0,
            wall_time: 0,
        }
    }

    #[tokio::test]
    async fn upserts_resolved_rows_and_drops_unknown() {
        let store = MemoryEphemeralStore::new();
        let datastore = MemoryDatastore::new();
        let known = datastore
            .register_scheduled_query("baseline", "processes")
            .expect("register");
        let other = datastore
            .register_scheduled_query("baseline", "users")
            .expect("register");

        let host = HostId::new(9);
        let key = keys::buffer_key(TaskKind::ScheduledQueryStats, host);
        let buffered = [
            stats("baseline", "processes", 5),
            stats("baseline", "users", 2),
            stats("gone", "deleted", 1),
        ];
        store
            .execute(Command::HSet {
                key: key.clone(),
                fields: buffered
                    .iter()
                    .map(|s| {
                        (
                            keys::stats_field(&s.pack_name, &s.scheduled_query_name),
                            serde_json::to_string(s).expect("json"),
                        )
                    })
                    .chain(std::iter::once(("bad\0field".to_string(), "{".to_string())))
                    .collect(),
            })
            .await
            .expect("hset");

        let config = TaskConfig {
            scan_page_size: 1,
            insert_batch_size: 1,
            ..TaskConfig::enabled()
        };
        let reconciler = ScheduledQueryStatsReconciler::new(
            Arc::new(store.clone()),
            Arc::new(datastore.clone()),
            config,
        );
        let mut outcome = RunOutcome::default();
        reconciler
            .reconcile(&[ActiveEntity { host_id: host, score: 1 }], Utc::now(), &mut outcome)
            .await
            .expect("reconcile");

        assert_eq!(outcome, RunOutcome { keys: 1, items: 4 });
        let stored = datastore.query_stats(host).expect("stats");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[&known].executions, 5);
        assert_eq!(stored[&other].executions, 2);
        assert_eq!(store.hlen(&key).await.expect("hlen"), 0);
    }
}
