//! End-to-end scenarios: write through [`Task`], collect once, inspect both stores.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_async::{keys, RunOutcome};
use fleet_core::{
    Datastore, EphemeralStoreExt, HostId, LabelId, LabelMembership, PolicyId, PolicyResult,
    TaskKind,
};
use fleet_test_utils::{
    config_for, label_results, policy_results, query_stats, ts, DatastoreOp, RecordingDatastore,
};

use common::{completed, Harness};

#[tokio::test]
async fn label_results_are_applied_by_one_collection() {
    let h = Harness::new(config_for(TaskKind::LabelMembership));
    let host = HostId::new(7);
    h.datastore
        .insert_label_memberships(&[LabelMembership {
            label_id: LabelId::new(2),
            host_id: host,
            updated_at: ts(0),
        }])
        .await
        .expect("seed");

    let reported = ts(100);
    h.task
        .record_label_query_executions(host, &label_results(&[(1, true), (2, false)]), reported)
        .await
        .expect("record");

    // Buffered only: the durable row is untouched, but freshness is visible.
    assert_eq!(
        h.datastore.label_ids(host).expect("labels"),
        BTreeSet::from([LabelId::new(2)])
    );
    assert_eq!(
        h.task
            .reported_at(TaskKind::LabelMembership, host)
            .await
            .expect("reported at"),
        Some(reported)
    );

    let outcome = completed(h.collector(TaskKind::LabelMembership).run_once().await);
    assert_eq!(outcome, RunOutcome { keys: 1, items: 2 });
    assert_eq!(
        h.datastore.label_ids(host).expect("labels"),
        BTreeSet::from([LabelId::new(1)])
    );
    assert!(h.index(TaskKind::LabelMembership).is_empty().await.expect("len"));

    assert_eq!(
        h.datastore
            .last_updated_at(TaskKind::LabelMembership, host)
            .await
            .expect("durable ts"),
        Some(reported)
    );
    assert_eq!(
        h.task
            .reported_at(TaskKind::LabelMembership, host)
            .await
            .expect("reported at"),
        Some(reported)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lock_attempts_elect_one_holder() {
    let h = Harness::new(config_for(TaskKind::PolicyMembership));
    let lock = keys::lock_key(TaskKind::PolicyMembership);

    let attempts: Vec<_> = (0..2)
        .map(|process| {
            let store = h.store.clone();
            let lock = lock.clone();
            tokio::spawn(async move {
                store
                    .set_if_absent(&lock, &format!("process-{process}"), Duration::from_secs(60))
                    .await
                    .expect("setnx")
            })
        })
        .collect();

    let mut acquired = 0;
    for attempt in attempts {
        if attempt.await.expect("join") {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test]
async fn stats_page_is_upserted_in_one_batch_and_hash_removed() {
    let datastore = fleet_core::MemoryDatastore::new();
    for (pack, query) in [("p1", "q1"), ("p1", "q2"), ("p2", "q3")] {
        datastore
            .register_scheduled_query(pack, query)
            .expect("register");
    }
    let recording = RecordingDatastore::new(datastore.clone());
    let h = Harness::with_datastore(
        config_for(TaskKind::ScheduledQueryStats),
        datastore.clone(),
        Arc::new(recording.clone()),
    );

    let host = HostId::new(42);
    h.task
        .record_scheduled_query_stats(
            host,
            &[
                query_stats("p1", "q1", 1),
                query_stats("p1", "q2", 2),
                query_stats("p2", "q3", 3),
            ],
            ts(10),
        )
        .await
        .expect("record");

    let collector = h.collector_over(TaskKind::ScheduledQueryStats, Arc::new(recording.clone()));
    let outcome = completed(collector.run_once().await);

    assert_eq!(outcome, RunOutcome { keys: 1, items: 3 });
    assert_eq!(
        recording.batch_sizes(DatastoreOp::ScheduledQueryIdsByName),
        vec![3]
    );
    assert_eq!(
        recording.batch_sizes(DatastoreOp::UpsertScheduledQueryStats),
        vec![3]
    );
    assert_eq!(datastore.query_stats(host).expect("stats").len(), 3);

    let hash = keys::buffer_key(TaskKind::ScheduledQueryStats, host);
    assert_eq!(h.store.hlen(&hash).await.expect("hlen"), 0);
    assert!(!h.store.keys().expect("keys").contains(&hash));
}

#[tokio::test]
async fn policy_buffer_keeps_only_the_newest_results() {
    let mut config = config_for(TaskKind::PolicyMembership);
    config.policy_results_cap = 3;
    let h = Harness::new(config);
    let host = HostId::new(3);

    for policy in 1..=4 {
        h.task
            .record_policy_query_executions(
                host,
                &policy_results(&[(policy, PolicyResult::Pass)]),
                ts(i64::try_from(policy).expect("small")),
            )
            .await
            .expect("record");
    }

    let list = keys::buffer_key(TaskKind::PolicyMembership, host);
    assert_eq!(h.store.lrange(&list, 0, usize::MAX).await.expect("lrange").len(), 3);

    let outcome = completed(h.collector(TaskKind::PolicyMembership).run_once().await);
    assert_eq!(outcome.items, 3);
    let stored: BTreeSet<PolicyId> = h
        .datastore
        .policy_results(host)
        .expect("policies")
        .into_keys()
        .collect();
    assert_eq!(stored, (2..=4).map(PolicyId::new).collect());
}

#[tokio::test]
async fn policy_results_last_value_wins_across_reports() {
    let h = Harness::new(config_for(TaskKind::PolicyMembership));
    let host = HostId::new(5);

    h.task
        .record_policy_query_executions(
            host,
            &policy_results(&[(1, PolicyResult::Fail), (2, PolicyResult::Unknown)]),
            ts(1),
        )
        .await
        .expect("record");
    h.task
        .record_policy_query_executions(host, &policy_results(&[(1, PolicyResult::Pass)]), ts(2))
        .await
        .expect("record");

    completed(h.collector(TaskKind::PolicyMembership).run_once().await);

    let stored = h.datastore.policy_results(host).expect("policies");
    assert_eq!(stored[&PolicyId::new(1)], PolicyResult::Pass);
    assert_eq!(stored[&PolicyId::new(2)], PolicyResult::Unknown);
    assert_eq!(
        h.datastore
            .last_updated_at(TaskKind::PolicyMembership, host)
            .await
            .expect("ts"),
        Some(ts(2))
    );
}

#[tokio::test]
async fn host_check_ins_are_marked_seen_in_batches() {
    let datastore = fleet_core::MemoryDatastore::new();
    let recording = RecordingDatastore::new(datastore.clone());
    let h = Harness::with_datastore(
        config_for(TaskKind::HostLastSeen),
        datastore.clone(),
        Arc::new(recording.clone()),
    );

    for id in 1..=7 {
        h.task
            .record_host_last_seen(HostId::new(id), ts(id.try_into().expect("small")))
            .await
            .expect("record");
    }

    let collector = h.collector_over(TaskKind::HostLastSeen, Arc::new(recording.clone()));
    let before = Utc::now();
    let outcome = completed(collector.run_once().await);

    assert_eq!(outcome, RunOutcome { keys: 7, items: 7 });
    // Pages of two hosts, so every batch stays under the update batch size.
    let sizes = recording.batch_sizes(DatastoreOp::MarkHostsSeen);
    assert_eq!(sizes.iter().sum::<usize>(), 7);
    assert!(sizes.iter().all(|size| *size <= 3));
    for id in 1..=7 {
        let seen = datastore
            .seen_at(HostId::new(id))
            .expect("seen")
            .expect("marked");
        assert!(seen >= before);
    }
    assert!(h.index(TaskKind::HostLastSeen).is_empty().await.expect("len"));
}

#[tokio::test]
async fn disabled_kinds_write_through_without_buffering() {
    let h = Harness::new(config_for(TaskKind::HostLastSeen));
    let host = HostId::new(11);

    h.task
        .record_label_query_executions(host, &label_results(&[(1, true)]), ts(5))
        .await
        .expect("record");

    assert_eq!(
        h.datastore.label_ids(host).expect("labels"),
        BTreeSet::from([LabelId::new(1)])
    );
    assert!(h.store.keys().expect("keys").is_empty());
}
