//! Synthetic host traffic for exercising the collectors without real agents.
//!
//! Every tick a random share of the simulated hosts "checks in" and reports
//! label, policy and scheduled query results through the [`Task`] write API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_async::Task;
use fleet_core::{HostId, LabelId, MemoryDatastore, PolicyId, PolicyResult, ScheduledQueryStats};
use rand::Rng;
use tokio_util::sync::CancellationToken;

const LABELS: u64 = 8;
const POLICIES: u64 = 5;
const QUERIES: [(&str, &str); 3] = [
    ("baseline", "processes"),
    ("baseline", "listening_ports"),
    ("compliance", "disk_encryption"),
];

/// One host's reports for a tick.
#[derive(Debug, Clone)]
pub struct HostReport {
    /// Reporting host.
    pub host_id: HostId,
    /// Label results.
    pub labels: BTreeMap<LabelId, bool>,
    /// Policy results.
    pub policies: BTreeMap<PolicyId, PolicyResult>,
    /// Scheduled query stats.
    pub stats: Vec<ScheduledQueryStats>,
}

/// Registers the scheduled queries the simulator reports stats for.
///
/// # Errors
///
/// Returns an error if the datastore lock is poisoned.
pub fn register_queries(datastore: &MemoryDatastore) -> fleet_core::Result<()> {
    for (pack, query) in QUERIES {
        datastore.register_scheduled_query(pack, query)?;
    }
    Ok(())
}

/// Generates the reports of one tick for hosts `1..=hosts`.
pub fn generate(hosts: u64, now: DateTime<Utc>) -> Vec<HostReport> {
    let mut rng = rand::thread_rng();
    let mut reports = Vec::new();
    for id in 1..=hosts {
        if !rng.gen_bool(0.5) {
            continue;
        }

        let mut labels = BTreeMap::new();
        for label in 1..=LABELS {
            if rng.gen_bool(0.5) {
                labels.insert(LabelId::new(label), rng.gen_bool(0.7));
            }
        }

        let mut policies = BTreeMap::new();
        for policy in 1..=POLICIES {
            let result = match rng.gen_range(0..10) {
                0 => PolicyResult::Unknown,
                1..=2 => PolicyResult::Fail,
                _ => PolicyResult::Pass,
            };
            policies.insert(PolicyId::new(policy), result);
        }

        let mut stats = Vec::with_capacity(QUERIES.len());
        for (pack, query) in QUERIES {
            stats.push(ScheduledQueryStats {
                scheduled_query_name: query.to_string(),
                pack_name: pack.to_string(),
                average_memory: rng.gen_range(1_000..100_000),
                denylisted: false,
                executions: rng.gen_range(1..50),
                interval: 60,
                last_executed: now,
                output_size: rng.gen_range(0..10_000),
                system_time: rng.gen_range(0..500),
                user_time: rng.gen_range(0..500),
                wall_time: rng.gen_range(0..1_000),
            });
        }

        reports.push(HostReport {
            host_id: HostId::new(id),
            labels,
            policies,
            stats,
        });
    }
    reports
}

/// Writes one tick of reports.
///
/// # Errors
///
/// Returns the first failed write.
pub async fn report(
    task: &Task,
    reports: Vec<HostReport>,
    now: DateTime<Utc>,
) -> fleet_async::Result<()> {
    for report in reports {
        task.record_host_last_seen(report.host_id, now).await?;
        task.record_label_query_executions(report.host_id, &report.labels, now)
            .await?;
        task.record_policy_query_executions(report.host_id, &report.policies, now)
            .await?;
        task.record_scheduled_query_stats(report.host_id, &report.stats, now)
            .await?;
    }
    Ok(())
}

/// Reports for `hosts` simulated hosts every `interval` until `shutdown`.
pub async fn run(task: Arc<Task>, hosts: u64, interval: Duration, shutdown: CancellationToken) {
    tracing::info!(
        hosts,
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "host simulator started"
    );
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let now = Utc::now();
        let reports = generate(hosts, now);
        let reporting = reports.len();
        match report(&task, reports, now).await {
            Ok(()) => tracing::debug!(reporting, "simulated check-ins written"),
            Err(err) => tracing::warn!(error = %err, "simulated check-in failed"),
        }
    }
    tracing::info!("host simulator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{AsyncConfig, MemoryEphemeralStore};

    #[test]
    fn generated_hosts_stay_in_range() {
        let reports = generate(20, Utc::now());
        assert!(reports.len() <= 20);
        for report in &reports {
            assert!((1..=20).contains(&report.host_id.get()));
            assert!(report.labels.keys().all(|l| (1..=LABELS).contains(&l.get())));
            assert_eq!(report.policies.len(), POLICIES as usize);
            assert_eq!(report.stats.len(), QUERIES.len());
        }
    }

    #[tokio::test]
    async fn reports_write_through_when_sync() {
        let datastore = MemoryDatastore::new();
        register_queries(&datastore).expect("register");
        let task = Task::new(
            Arc::new(MemoryEphemeralStore::new()),
            Arc::new(datastore.clone()),
            Arc::new(AsyncConfig::default()),
        )
        .expect("task");

        let now = Utc::now();
        let host = HostId::new(1);
        let reports = vec![HostReport {
            host_id: host,
            labels: BTreeMap::from([(LabelId::new(1), true)]),
            policies: BTreeMap::from([(PolicyId::new(1), PolicyResult::Fail)]),
            stats: generate(1, now)
                .into_iter()
                .next()
                .map(|r| r.stats)
                .unwrap_or_default(),
        }];
        report(&task, reports, now).await.expect("report");

        assert!(datastore.label_ids(host).expect("labels").contains(&LabelId::new(1)));
        assert_eq!(
            datastore.policy_results(host).expect("policies")[&PolicyId::new(1)],
            PolicyResult::Fail
        );
        assert_eq!(task.flush_hosts_last_seen(now).await.expect("flush"), 1);
        assert_eq!(datastore.seen_at(host).expect("seen"), Some(now));
    }
}
