//! Datastore wrappers for failure injection and call recording.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    Datastore, Error, HostId, HostScheduledQueryStats, LabelId, LabelMembership, PolicyId,
    PolicyMembership, PolicyResult, Result, ScheduledQueryId, ScheduledQueryStats, TaskKind,
};

/// A datastore operation, named after its trait method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatastoreOp {
    /// `record_label_query_executions`
    RecordLabelQueryExecutions,
    /// `record_policy_query_executions`
    RecordPolicyQueryExecutions,
    /// `save_host_scheduled_query_stats`
    SaveHostScheduledQueryStats,
    /// `mark_hosts_seen`
    MarkHostsSeen,
    /// `insert_label_memberships`
    InsertLabelMemberships,
    /// `delete_label_memberships`
    DeleteLabelMemberships,
    /// `update_label_timestamps`
    UpdateLabelTimestamps,
    /// `insert_policy_memberships`
    InsertPolicyMemberships,
    /// `update_policy_timestamps`
    UpdatePolicyTimestamps,
    /// `scheduled_query_ids_by_name`
    ScheduledQueryIdsByName,
    /// `upsert_scheduled_query_stats`
    UpsertScheduledQueryStats,
    /// `last_updated_at`
    LastUpdatedAt,
}

/// How often an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fail the next call only.
    Once,
    /// Fail every call until cleared.
    Always,
    /// Let this many more calls through, then fail one.
    After(usize),
}

/// Wraps a datastore and fails chosen operations on demand.
#[derive(Clone)]
pub struct FailingDatastore {
    inner: Arc<dyn Datastore>,
    failures: Arc<Mutex<HashMap<DatastoreOp, FailureMode>>>,
}

impl FailingDatastore {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: impl Datastore) -> Self {
        Self {
            inner: Arc::new(inner),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fails the next call to `op`.
    pub fn fail_once(&self, op: DatastoreOp) {
        self.failures
            .lock()
            .expect("lock")
            .insert(op, FailureMode::Once);
    }

    /// Fails every call to `op` until [`Self::clear`] is called.
    pub fn fail_always(&self, op: DatastoreOp) {
        self.failures
            .lock()
            .expect("lock")
            .insert(op, FailureMode::Always);
    }

    /// Lets `successes` calls to `op` through, then fails the next one.
    pub fn fail_after(&self, op: DatastoreOp, successes: usize) {
        self.failures
            .lock()
            .expect("lock")
            .insert(op, FailureMode::After(successes));
    }

    /// Disarms every injected failure.
    pub fn clear(&self) {
        self.failures.lock().expect("lock").clear();
    }

    fn check(&self, op: DatastoreOp) -> Result<()> {
        let mut failures = self.failures.lock().expect("lock");
        match failures.get(&op).copied() {
            Some(FailureMode::Once | FailureMode::After(0)) => {
                failures.remove(&op);
                Err(injected(op))
            }
            Some(FailureMode::After(remaining)) => {
                failures.insert(op, FailureMode::After(remaining - 1));
                Ok(())
            }
            Some(FailureMode::Always) => Err(injected(op)),
            None => Ok(()),
        }
    }
}

fn injected(op: DatastoreOp) -> Error {
    Error::storage(format!("injected failure for {op:?}"))
}

#[async_trait]
impl Datastore for FailingDatastore {
    async fn record_label_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<LabelId, bool>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::RecordLabelQueryExecutions)?;
        self.inner
            .record_label_query_executions(host_id, results, updated_at)
            .await
    }

    async fn record_policy_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<PolicyId, PolicyResult>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::RecordPolicyQueryExecutions)?;
        self.inner
            .record_policy_query_executions(host_id, results, updated_at)
            .await
    }

    async fn save_host_scheduled_query_stats(
        &self,
        host_id: HostId,
        stats: &[ScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::SaveHostScheduledQueryStats)?;
        self.inner
            .save_host_scheduled_query_stats(host_id, stats, updated_at)
            .await
    }

    async fn mark_hosts_seen(&self, host_ids: &[HostId], seen_at: DateTime<Utc>) -> Result<()> {
        self.check(DatastoreOp::MarkHostsSeen)?;
        self.inner.mark_hosts_seen(host_ids, seen_at).await
    }

    async fn insert_label_memberships(&self, rows: &[LabelMembership]) -> Result<()> {
        self.check(DatastoreOp::InsertLabelMemberships)?;
        self.inner.insert_label_memberships(rows).await
    }

    async fn delete_label_memberships(&self, pairs: &[(LabelId, HostId)]) -> Result<()> {
        self.check(DatastoreOp::DeleteLabelMemberships)?;
        self.inner.delete_label_memberships(pairs).await
    }

    async fn update_label_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::UpdateLabelTimestamps)?;
        self.inner.update_label_timestamps(host_ids, updated_at).await
    }

    async fn insert_policy_memberships(&self, rows: &[PolicyMembership]) -> Result<()> {
        self.check(DatastoreOp::InsertPolicyMemberships)?;
        self.inner.insert_policy_memberships(rows).await
    }

    async fn update_policy_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::UpdatePolicyTimestamps)?;
        self.inner.update_policy_timestamps(host_ids, updated_at).await
    }

    async fn scheduled_query_ids_by_name(
        &self,
        names: &[(String, String)],
    ) -> Result<HashMap<(String, String), ScheduledQueryId>> {
        self.check(DatastoreOp::ScheduledQueryIdsByName)?;
        self.inner.scheduled_query_ids_by_name(names).await
    }

    async fn upsert_scheduled_query_stats(
        &self,
        rows: &[HostScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(DatastoreOp::UpsertScheduledQueryStats)?;
        self.inner.upsert_scheduled_query_stats(rows, updated_at).await
    }

    async fn last_updated_at(
        &self,
        kind: TaskKind,
        host_id: HostId,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check(DatastoreOp::LastUpdatedAt)?;
        self.inner.last_updated_at(kind, host_id).await
    }
}

/// One recorded datastore call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatastoreCall {
    /// The operation called.
    pub op: DatastoreOp,
    /// Number of rows, pairs, hosts or names passed in.
    pub rows: usize,
}

/// Wraps a datastore and records every call with its batch size.
#[derive(Clone)]
pub struct RecordingDatastore {
    inner: Arc<dyn Datastore>,
    calls: Arc<Mutex<Vec<DatastoreCall>>>,
}

impl RecordingDatastore {
    /// Wraps `inner` with an empty call log.
    pub fn new(inner: impl Datastore) -> Self {
        Self {
            inner: Arc::new(inner),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns every recorded call, oldest first.
    pub fn calls(&self) -> Vec<DatastoreCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Returns the batch sizes passed to `op`, oldest first.
    pub fn batch_sizes(&self, op: DatastoreOp) -> Vec<usize> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|call| call.op == op)
            .map(|call| call.rows)
            .collect()
    }

    /// Clears the call log.
    pub fn reset(&self) {
        self.calls.lock().expect("lock").clear();
    }

    fn record(&self, op: DatastoreOp, rows: usize) {
        self.calls
            .lock()
            .expect("lock")
            .push(DatastoreCall { op, rows });
    }
}

#[async_trait]
impl Datastore for RecordingDatastore {
    async fn record_label_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<LabelId, bool>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::RecordLabelQueryExecutions, results.len());
        self.inner
            .record_label_query_executions(host_id, results, updated_at)
            .await
    }

    async fn record_policy_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<PolicyId, PolicyResult>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::RecordPolicyQueryExecutions, results.len());
        self.inner
            .record_policy_query_executions(host_id, results, updated_at)
            .await
    }

    async fn save_host_scheduled_query_stats(
        &self,
        host_id: HostId,
        stats: &[ScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::SaveHostScheduledQueryStats, stats.len());
        self.inner
            .save_host_scheduled_query_stats(host_id, stats, updated_at)
            .await
    }

    async fn mark_hosts_seen(&self, host_ids: &[HostId], seen_at: DateTime<Utc>) -> Result<()> {
        self.record(DatastoreOp::MarkHostsSeen, host_ids.len());
        self.inner.mark_hosts_seen(host_ids, seen_at).await
    }

    async fn insert_label_memberships(&self, rows: &[LabelMembership]) -> Result<()> {
        self.record(DatastoreOp::InsertLabelMemberships, rows.len());
        self.inner.insert_label_memberships(rows).await
    }

    async fn delete_label_memberships(&self, pairs: &[(LabelId, HostId)]) -> Result<()> {
        self.record(DatastoreOp::DeleteLabelMemberships, pairs.len());
        self.inner.delete_label_memberships(pairs).await
    }

    async fn update_label_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::UpdateLabelTimestamps, host_ids.len());
        self.inner.update_label_timestamps(host_ids, updated_at).await
    }

    async fn insert_policy_memberships(&self, rows: &[PolicyMembership]) -> Result<()> {
        self.record(DatastoreOp::InsertPolicyMemberships, rows.len());
        self.inner.insert_policy_memberships(rows).await
    }

    async fn update_policy_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::UpdatePolicyTimestamps, host_ids.len());
        self.inner.update_policy_timestamps(host_ids, updated_at).await
    }

    async fn scheduled_query_ids_by_name(
        &self,
        names: &[(String, String)],
    ) -> Result<HashMap<(String, String), ScheduledQueryId>> {
        self.record(DatastoreOp::ScheduledQueryIdsByName, names.len());
        self.inner.scheduled_query_ids_by_name(names).await
    }

    async fn upsert_scheduled_query_stats(
        &self,
        rows: &[HostScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record(DatastoreOp::UpsertScheduledQueryStats, rows.len());
        self.inner.upsert_scheduled_query_stats(rows, updated_at).await
    }

    async fn last_updated_at(
        &self,
        kind: TaskKind,
        host_id: HostId,
    ) -> Result<Option<DateTime<Utc>>> {
        self.record(DatastoreOp::LastUpdatedAt, 1);
        self.inner.last_updated_at(kind, host_id).await
    }
}
