//! Active entity index.
//!
//! One sorted set per task kind lists the hosts with buffered work, scored by the
//! Unix milliseconds of their latest report. Collectors page through it, reconcile
//! each page, and then remove only the entries whose score did not move in the
//! meantime: a host that reported again while its page was being reconciled stays
//! listed and is picked up by the next run.
//!
//! Scores are bumped rather than overwritten (`max(report_ms, current + 1)`), so
//! every write changes the score even when two reports carry the same timestamp.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{
    Command, EphemeralStore, EphemeralStoreExt, HostId, Reply, ScanCursor, ScanPage, TaskKind,
};

use crate::error::Result;
use crate::keys;

/// A host listed in the active index together with the score it was loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveEntity {
    /// Host with pending work.
    pub host_id: HostId,
    /// Index score at load time (Unix milliseconds of the latest report).
    pub score: i64,
}

impl ActiveEntity {
    /// Returns the report time the score encodes.
    #[must_use]
    pub fn reported_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.score)
    }
}

/// Converts a timestamp to an index score.
#[must_use]
pub fn score_of(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Handle to the active index of one task kind.
#[derive(Clone)]
pub struct ActiveEntityIndex {
    store: Arc<dyn EphemeralStore>,
    kind: TaskKind,
    key: String,
    retention: Duration,
}

impl std::fmt::Debug for ActiveEntityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveEntityIndex")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl ActiveEntityIndex {
    /// Creates a handle for a kind's index. Entries older than `retention` are purged
    /// on every upsert.
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>, kind: TaskKind, retention: Duration) -> Self {
        Self {
            store,
            kind,
            key: keys::active_index_key(kind),
            retention,
        }
    }

    /// Returns the task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the index key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn cutoff_score(&self, now: DateTime<Utc>) -> i64 {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        score_of(now).saturating_sub(retention_ms)
    }

    /// Lists a host as active and purges entries older than the retention window.
    ///
    /// Both steps run as one atomic batch. The window ends at `reported_at` or the
    /// current time, whichever is earlier. Returns the host's new score.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn upsert(&self, host_id: HostId, reported_at: DateTime<Utc>) -> Result<i64> {
        let replies = self
            .store
            .run_atomic(vec![
                Command::ZBump {
                    key: self.key.clone(),
                    member: host_id.to_string(),
                    score: score_of(reported_at),
                },
                Command::ZRemRangeByScore {
                    key: self.key.clone(),
                    min: i64::MIN,
                    max: self
                        .cutoff_score(reported_at.min(Utc::now()))
                        .saturating_sub(1),
                },
            ])
            .await?;
        let reply = replies.into_iter().next().unwrap_or(Reply::Nil);
        Ok(reply.into_int("ZBUMP")?)
    }

    /// Loads one page of active hosts.
    ///
    /// Members that are not valid host IDs are dropped from the index and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn load(
        &self,
        cursor: Option<ScanCursor>,
        page_size: usize,
    ) -> Result<ScanPage<ActiveEntity>> {
        let page = self.store.zscan(&self.key, cursor, page_size).await?;

        let mut items = Vec::with_capacity(page.items.len());
        let mut invalid = Vec::new();
        for (member, score) in page.items {
            match member.parse::<HostId>() {
                Ok(host_id) => items.push(ActiveEntity { host_id, score }),
                Err(_) => invalid.push((member, score)),
            }
        }
        if !invalid.is_empty() {
            tracing::warn!(
                kind = %self.kind,
                count = invalid.len(),
                "dropping invalid members from active index"
            );
            self.store.zrem_if_score(&self.key, invalid).await?;
        }

        Ok(ScanPage {
            items,
            next: page.next,
        })
    }

    /// Removes the given entries, skipping any whose score changed since load.
    ///
    /// Returns how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn remove_if_unchanged(&self, entries: &[ActiveEntity]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let members = entries
            .iter()
            .map(|entry| (entry.host_id.to_string(), entry.score))
            .collect();
        Ok(self.store.zrem_if_score(&self.key, members).await?)
    }

    /// Removes entries that reported before `cutoff`.
    ///
    /// Returns how many entries were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .store
            .zrem_range_by_score(&self.key, i64::MIN, score_of(cutoff).saturating_sub(1))
            .await?)
    }

    /// Returns the number of active hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.zcard(&self.key).await?)
    }

    /// Returns true when no host is listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Returns a host's current score.
    ///
    /// # Errors
    ///
    /// Returns an error if the ephemeral store fails.
    pub async fn score(&self, host_id: HostId) -> Result<Option<i64>> {
        Ok(self.store.zscore(&self.key, &host_id.to_string()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::MemoryEphemeralStore;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn index() -> ActiveEntityIndex {
        ActiveEntityIndex::new(
            Arc::new(MemoryEphemeralStore::new()),
            TaskKind::LabelMembership,
            DAY,
        )
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("timestamp")
    }

    #[tokio::test]
    async fn upsert_bumps_score() {
        let index = index();
        let host = HostId::new(1);
        let at = ts(1_700_000_000_000);
        assert_eq!(index.upsert(host, at).await.expect("upsert"), score_of(at));
        assert_eq!(index.upsert(host, at).await.expect("upsert"), score_of(at) + 1);
        assert_eq!(index.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn remove_if_unchanged_keeps_rewritten_hosts() {
        let index = index();
        let now = ts(1_700_000_000_000);
        index.upsert(HostId::new(1), now).await.expect("upsert");
        index.upsert(HostId::new(2), now).await.expect("upsert");

        let page = index.load(None, 10).await.expect("load");
        assert_eq!(page.items.len(), 2);

        index.upsert(HostId::new(2), now).await.expect("upsert");
        let removed = index.remove_if_unchanged(&page.items).await.expect("remove");
        assert_eq!(removed, 1);
        assert!(index.score(HostId::new(1)).await.expect("score").is_none());
        assert!(index.score(HostId::new(2)).await.expect("score").is_some());
    }

    #[tokio::test]
    async fn upsert_purges_entries_outside_retention() {
        let index = index();
        let old = ts(1_700_000_000_000);
        index.upsert(HostId::new(1), old).await.expect("upsert");

        let later = old + chrono::Duration::days(2);
        index.upsert(HostId::new(2), later).await.expect("upsert");

        assert_eq!(index.len().await.expect("len"), 1);
        assert!(index.score(HostId::new(1)).await.expect("score").is_none());
    }

    #[tokio::test]
    async fn future_report_does_not_purge_current_hosts() {
        let index = index();
        let now = Utc::now();
        index.upsert(HostId::new(1), now).await.expect("upsert");

        let future = now + chrono::Duration::days(30);
        index.upsert(HostId::new(2), future).await.expect("upsert");

        assert_eq!(index.len().await.expect("len"), 2);
        assert!(index.score(HostId::new(1)).await.expect("score").is_some());
    }

    #[tokio::test]
    async fn purge_older_than_is_exclusive_of_cutoff() {
        let index = index();
        let base = ts(1_700_000_000_000);
        index.upsert(HostId::new(1), base).await.expect("upsert");
        index
            .upsert(HostId::new(2), base + chrono::Duration::seconds(10))
            .await
            .expect("upsert");

        let removed = index
            .purge_older_than(base + chrono::Duration::seconds(10))
            .await
            .expect("purge");
        assert_eq!(removed, 1);
        assert_eq!(index.len().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn load_pages_through_all_hosts() {
        let index = index();
        let now = ts(1_700_000_000_000);
        for id in 1..=5 {
            index.upsert(HostId::new(id), now).await.expect("upsert");
        }

        let mut cursor = None;
        let mut hosts = Vec::new();
        loop {
            let page = index.load(cursor, 2).await.expect("load");
            hosts.extend(page.items.iter().map(|e| e.host_id));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        hosts.sort();
        assert_eq!(hosts, (1..=5).map(HostId::new).collect::<Vec<_>>());
    }
}
