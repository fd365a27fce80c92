//! Task kinds: the four reconciliation domains.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A reconciliation domain with its own buffer layout, index, lock and collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Label query results (host is / is not a member of a label).
    LabelMembership,
    /// Policy query results (pass, fail or unknown per policy).
    PolicyMembership,
    /// Per-host execution statistics of scheduled pack queries.
    ScheduledQueryStats,
    /// Host check-in liveness ("seen at").
    HostLastSeen,
}

impl TaskKind {
    /// All task kinds, in collector start order.
    pub const ALL: [Self; 4] = [
        Self::LabelMembership,
        Self::PolicyMembership,
        Self::ScheduledQueryStats,
        Self::HostLastSeen,
    ];

    /// Returns the stable snake_case name used in keys, logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LabelMembership => "label_membership",
            Self::PolicyMembership => "policy_membership",
            Self::ScheduledQueryStats => "scheduled_query_stats",
            Self::HostLastSeen => "host_last_seen",
        }
    }

    /// Returns the upper-case fragment used in environment variable names.
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::LabelMembership => "LABEL_MEMBERSHIP",
            Self::PolicyMembership => "POLICY_MEMBERSHIP",
            Self::ScheduledQueryStats => "SCHEDULED_QUERY_STATS",
            Self::HostLastSeen => "HOST_LAST_SEEN",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown task kind '{s}'")))
    }
}
