//! Factory functions for test data.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fleet_core::{AsyncConfig, LabelId, PolicyId, PolicyResult, ScheduledQueryStats, TaskKind};

/// Retention long enough that entries stamped with [`ts`] are never purged.
pub const TEST_KEY_RETENTION: Duration = Duration::from_secs(20 * 365 * 24 * 60 * 60);

/// Returns a config with every kind enabled and small batch sizes, so tests
/// cross batch and page boundaries with a handful of rows.
pub fn test_config() -> AsyncConfig {
    let mut config = AsyncConfig::all_enabled();
    config.max_jitter_percent = 0;
    config.lock_timeout = Duration::from_secs(5);
    config.key_retention = TEST_KEY_RETENTION;
    for kind in TaskKind::ALL {
        let task = config.task_mut(kind);
        task.collect_interval = Duration::from_secs(1);
        task.insert_batch_size = 3;
        task.delete_batch_size = 3;
        task.update_batch_size = 3;
        task.scan_page_size = 2;
        task.pop_batch_size = 2;
    }
    config
}

/// Returns a config with only `kind` enabled, using [`test_config`] sizes.
pub fn config_for(kind: TaskKind) -> AsyncConfig {
    let mut config = test_config();
    for other in TaskKind::ALL {
        config.task_mut(other).enabled = other == kind;
    }
    config
}

/// Returns a fixed UTC timestamp `secs` seconds after 2024-01-01T00:00:00Z.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid base timestamp")
        + chrono::Duration::seconds(secs)
}

/// Builds a label result map from `(label_id, member)` pairs.
pub fn label_results(pairs: &[(u64, bool)]) -> BTreeMap<LabelId, bool> {
    pairs
        .iter()
        .map(|&(id, member)| (LabelId::new(id), member))
        .collect()
}

/// Builds a policy result map from `(policy_id, result)` pairs.
pub fn policy_results(pairs: &[(u64, PolicyResult)]) -> BTreeMap<PolicyId, PolicyResult> {
    pairs
        .iter()
        .map(|&(id, result)| (PolicyId::new(id), result))
        .collect()
}

/// Builds a stats row for `pack/query` with the given execution count.
pub fn query_stats(pack: &str, query: &str, executions: u64) -> ScheduledQueryStats {
    ScheduledQueryStats {
        scheduled_query_name: query.to_string(),
        pack_name: pack.to_string(),
        average_memory: 1024,
        denylisted: false,
        executions,
        interval: 60,
        last_executed: ts(0),
        output_size: 0,
        system_time: 10,
        user_time: 20,
        wall_time: 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_valid() {
        test_config().validate().expect("valid");
        let only = config_for(TaskKind::PolicyMembership);
        assert!(only.task(TaskKind::PolicyMembership).enabled);
        assert!(!only.task(TaskKind::LabelMembership).enabled);
    }

    #[test]
    fn timestamps_are_ordered() {
        assert!(ts(1) > ts(0));
        assert_eq!((ts(90) - ts(30)).num_seconds(), 60);
    }
}
