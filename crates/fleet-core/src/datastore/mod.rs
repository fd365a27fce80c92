//! Durable store contract.
//!
//! The durable store holds label and policy memberships, per-host scheduled query
//! stats and per-host freshness columns. All writes are column-scoped batches: a
//! label reconciliation never rewrites a host's `seen_at`, and a host-seen flush
//! never touches its label timestamp.
//!
//! Operations fall into three groups:
//!
//! - **Synchronous path**: applies one host's results directly, used when async
//!   processing is disabled for a kind.
//! - **Batch path**: multi-host inserts, deletes and timestamp updates issued by
//!   the reconcilers.
//! - **Freshness**: [`Datastore::last_updated_at`] reports when a kind was last
//!   written for a host.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{HostId, LabelId, PolicyId, ScheduledQueryId};
use crate::kind::TaskKind;

/// Outcome of a policy query on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyResult {
    /// The host satisfies the policy.
    Pass,
    /// The host violates the policy.
    Fail,
    /// The policy query did not produce a result.
    Unknown,
}

impl PolicyResult {
    /// Returns the token used in buffered results.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the nullable pass flag stored in the durable row.
    #[must_use]
    pub const fn passes(self) -> Option<bool> {
        match self {
            Self::Pass => Some(true),
            Self::Fail => Some(false),
            Self::Unknown => None,
        }
    }
}

impl From<Option<bool>> for PolicyResult {
    fn from(passes: Option<bool>) -> Self {
        match passes {
            Some(true) => Self::Pass,
            Some(false) => Self::Fail,
            None => Self::Unknown,
        }
    }
}

impl fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::InvalidInput(format!(
                "unknown policy result '{other}'"
            ))),
        }
    }
}

/// A host's membership in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMembership {
    /// Label the host belongs to.
    pub label_id: LabelId,
    /// Member host.
    pub host_id: HostId,
    /// Time the membership was last confirmed.
    pub updated_at: DateTime<Utc>,
}

/// A host's latest result for a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyMembership {
    /// Evaluated policy.
    pub policy_id: PolicyId,
    /// Evaluated host.
    pub host_id: HostId,
    /// Latest result.
    pub result: PolicyResult,
    /// Time the result was reported.
    pub updated_at: DateTime<Utc>,
}

/// Execution statistics of one scheduled query on one host, as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledQueryStats {
    /// Query name inside the pack.
    pub scheduled_query_name: String,
    /// Pack name.
    pub pack_name: String,
    /// Average memory used by the query, in bytes.
    pub average_memory: u64,
    /// Whether the agent denylisted the query.
    pub denylisted: bool,
    /// Number of executions.
    pub executions: u64,
    /// Scheduling interval, in seconds.
    pub interval: u64,
    /// Time of the latest execution.
    pub last_executed: DateTime<Utc>,
    /// Total output size, in bytes.
    pub output_size: u64,
    /// System CPU time, in milliseconds.
    pub system_time: u64,
    /// User CPU time, in milliseconds.
    pub user_time: u64,
    /// Wall-clock time, in milliseconds.
    pub wall_time: u64,
}

impl ScheduledQueryStats {
    /// Returns the `(pack, query)` pair identifying the scheduled query.
    #[must_use]
    pub fn query_name(&self) -> (String, String) {
        (self.pack_name.clone(), self.scheduled_query_name.clone())
    }
}

/// A scheduled query stats row resolved to its durable identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostScheduledQueryStats {
    /// Reporting host.
    pub host_id: HostId,
    /// Resolved scheduled query.
    pub scheduled_query_id: ScheduledQueryId,
    /// Reported statistics.
    pub stats: ScheduledQueryStats,
}

/// Durable store used by the write API and the reconcilers.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Applies one host's label results: `true` inserts the membership, `false`
    /// deletes it. Updates the host's label timestamp.
    async fn record_label_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<LabelId, bool>,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Upserts one host's policy results and updates its policy timestamp.
    async fn record_policy_query_executions(
        &self,
        host_id: HostId,
        results: &BTreeMap<PolicyId, PolicyResult>,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Saves one host's scheduled query stats. Stats naming an unknown
    /// `(pack, query)` pair are skipped.
    async fn save_host_scheduled_query_stats(
        &self,
        host_id: HostId,
        stats: &[ScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Sets `seen_at` for every listed host.
    async fn mark_hosts_seen(&self, host_ids: &[HostId], seen_at: DateTime<Utc>) -> Result<()>;

    /// Inserts label memberships, overwriting existing rows.
    async fn insert_label_memberships(&self, rows: &[LabelMembership]) -> Result<()>;

    /// Deletes label memberships. Missing rows are ignored.
    async fn delete_label_memberships(&self, pairs: &[(LabelId, HostId)]) -> Result<()>;

    /// Sets the label timestamp of every listed host.
    async fn update_label_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Inserts policy memberships, overwriting existing rows.
    async fn insert_policy_memberships(&self, rows: &[PolicyMembership]) -> Result<()>;

    /// Sets the policy timestamp of every listed host.
    async fn update_policy_timestamps(
        &self,
        host_ids: &[HostId],
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Resolves `(pack, query)` names to scheduled query IDs. Unknown pairs are
    /// absent from the result.
    async fn scheduled_query_ids_by_name(
        &self,
        names: &[(String, String)],
    ) -> Result<HashMap<(String, String), ScheduledQueryId>>;

    /// Upserts resolved stats rows and sets the stats timestamp of their hosts.
    async fn upsert_scheduled_query_stats(
        &self,
        rows: &[HostScheduledQueryStats],
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns when the given kind was last written for a host.
    async fn last_updated_at(
        &self,
        kind: TaskKind,
        host_id: HostId,
    ) -> Result<Option<DateTime<Utc>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_result_tokens() {
        for result in [PolicyResult::Pass, PolicyResult::Fail, PolicyResult::Unknown] {
            assert_eq!(result.as_str().parse::<PolicyResult>().expect("parse"), result);
        }
        assert!("PASS".parse::<PolicyResult>().is_err());
    }

    #[test]
    fn policy_result_maps_nullable_flag() {
        assert_eq!(PolicyResult::from(Some(true)), PolicyResult::Pass);
        assert_eq!(PolicyResult::from(None), PolicyResult::Unknown);
        assert_eq!(PolicyResult::Fail.passes(), Some(false));
    }

    #[test]
    fn stats_json_uses_field_names() {
        let stats = ScheduledQueryStats {
            scheduled_query_name: "processes".into(),
            pack_name: "baseline".into(),
            average_memory: 1024,
            denylisted: false,
            executions: 3,
            interval: 60,
            last_executed: DateTime::from_timestamp(1_700_000_000, 0).expect("ts"),
            output_size: 10,
            system_time: 5,
            user_time: 7,
            wall_time: 12,
        };
        let json = serde_json::to_value(&stats).expect("serialize");
        assert_eq!(json["pack_name"], "baseline");
        assert_eq!(json["executions"], 3);
        assert_eq!(stats.query_name(), ("baseline".into(), "processes".into()));
    }
}
