// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use kv_benchmark::workloads::Phase;
use kv_benchmark::{
    BenchError, BenchMaterial, BenchmarkConfig, ConfigError, LocalStore, WorkloadCoordinator,
};
use tokio::time::Instant;

fn setup(yaml: &str) -> (LocalStore, WorkloadCoordinator) {
    setup_rank(yaml, 0).unwrap()
}

fn setup_rank(yaml: &str, rank: u64) -> Result<(LocalStore, WorkloadCoordinator), BenchError> {
    let config = BenchmarkConfig::from_yaml(yaml)?;
    let material = Arc::new(BenchMaterial::generate(config.workload.user_count, 11));
    let store = LocalStore::new(material.admin());
    let coordinator = WorkloadCoordinator::new(&config, rank, material, Arc::new(store.clone()))?;
    Ok((store, coordinator))
}

const MIXED: &str = r#"
log-level: debug
workload:
  name: independent
  user-count: 6
  duration: 300ms
  warmup-duration: 100ms
  report-interval: 100ms
  grace-period: 2s
  distributions:
    - { weight: 4, operation: "-read 1 -write 1" }
    - { weight: 2, operation: "-write 2 -acl 1 -size 64" }
    - { weight: 2, operation: "-read 1 -write 1 -conflict 1" }
    - { weight: 2, operation: "-query 3" }
  parameters:
    lines-per-user: 16
    commits-per-sync: 4
    with-acl: true
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runs_all_phases_against_local_store() {
    let (store, coordinator) = setup(MIXED);
    coordinator.init().await.unwrap();
    assert!(store.has_table("benchmark_db"));
    for i in 0..6 {
        assert!(store.is_registered(&format!("user-{i}")));
    }

    let warmup = coordinator.run_warmup().await.unwrap();
    assert_eq!(warmup.phase, Phase::Warmup);
    assert!(warmup.success > 0);
    // Warmup writes one line per operation; every line of every user exists
    // after a full cycle at the latest.
    assert!(store.table_len("benchmark_db") > 0);

    let report = coordinator.run_benchmark().await.unwrap();
    assert_eq!(report.phase, Phase::Benchmark);
    assert_eq!(report.users, 6);
    assert!(report.success > 0);
    // Every "-conflict 1" draw loses its conflict transaction.
    assert!(report.failed > 0);
    assert_eq!(report.full_queue, 0);
    assert!(!report.timed_out);
    assert!(report.duration >= Duration::from_millis(300));

    // Only one database handle and one session per identity, shared
    // across phases.
    assert_eq!(store.connect_count(), 1);
    assert_eq!(store.session_count(), 7);
}

#[tokio::test]
async fn exhausted_backoff_stops_the_run_early() {
    let (store, coordinator) = setup(
        r#"
workload:
  name: independent_blind_writes
  user-count: 3
  duration: 30s
  grace-period: 1s
  session:
    backoff:
      initial-interval: 5ms
      max-interval: 10ms
      max-elapsed-time: 50ms
  parameters:
    lines-per-user: 4
    commits-per-sync: 2
"#,
    );
    coordinator.init().await.unwrap();
    store.set_queue_capacity(Some(0));

    let started = Instant::now();
    let result = coordinator.run_benchmark().await;
    assert!(matches!(result, Err(BenchError::BackoffExhausted { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));

    let stats = coordinator.stats().snapshot();
    assert!(stats.full_queue > 0);
    assert_eq!(stats.success, 0);
    assert!(coordinator.stats().backoff_delay().get_sample_count() > 0);
}

#[tokio::test]
async fn workers_fail_to_start_without_init() {
    let (_store, coordinator) = setup(
        r#"
workload:
  name: independent_updates
  user-count: 2
  duration: 10s
"#,
    );
    let started = Instant::now();
    let result = coordinator.run_benchmark().await;
    assert!(matches!(result, Err(BenchError::Store(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn ranks_split_users_round_robin() {
    let yaml = r#"
workload:
  name: independent_blind_writes
  user-count: 7
  workers: [lg-0, lg-1, lg-2]
  duration: 50ms
  parameters:
    lines-per-user: 2
    commits-per-sync: 1
"#;
    let (store, coordinator) = setup_rank(yaml, 1).unwrap();
    coordinator.init().await.unwrap();
    let report = coordinator.run_benchmark().await.unwrap();
    assert_eq!(report.users, 2);

    let writers = (0..7)
        .filter(|i| {
            store
                .value("blind_writes", &format!("user-{i}.{:010}", 0))
                .is_some()
        })
        .collect::<Vec<_>>();
    assert_eq!(writers, vec![1, 4]);

    assert!(matches!(
        setup_rank(yaml, 3),
        Err(BenchError::Config(ConfigError::Invalid(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_user_makes_progress_with_fewer_threads_than_users() {
    let (store, coordinator) = setup(
        r#"
workload:
  name: independent_blind_writes
  user-count: 8
  duration: 300ms
  grace-period: 2s
  parameters:
    lines-per-user: 4
    commits-per-sync: 2
"#,
    );
    coordinator.init().await.unwrap();
    let report = coordinator.run_benchmark().await.unwrap();
    assert_eq!(report.users, 8);
    assert!(!report.timed_out);

    let idle = (0..8)
        .filter(|i| {
            store
                .value("blind_writes", &format!("user-{i}.{:010}", 0))
                .is_none()
        })
        .collect::<Vec<_>>();
    assert!(idle.is_empty(), "users {idle:?} never wrote");
}

#[test]
fn invalid_operations_are_rejected_up_front() {
    let result = setup_rank(
        r#"
workload:
  name: independent
  user-count: 2
  duration: 1s
  distributions:
    - { percent: 100, operation: "-query 5 -write 1" }
  parameters:
    lines-per-user: 4
    commits-per-sync: 2
    with-acl: false
"#,
        0,
    );
    assert!(matches!(
        result,
        Err(BenchError::Config(ConfigError::InvalidOperation { .. }))
    ));

    let result = setup_rank(
        r#"
workload:
  name: shared_counter
  user-count: 2
  duration: 1s
"#,
        0,
    );
    assert!(matches!(
        result,
        Err(BenchError::Config(ConfigError::UnknownWorkload { .. }))
    ));
}

#[tokio::test]
async fn metrics_endpoint_starts_once() {
    let (_store, coordinator) = setup(
        r#"
workload:
  name: independent_updates
  user-count: 1
  duration: 1s
  metrics-address: 127.0.0.1:0
"#,
    );
    let first = coordinator.start_metrics().await.unwrap().unwrap();
    assert_ne!(first.port(), 0);
    let second = coordinator.start_metrics().await.unwrap().unwrap();
    assert_eq!(first, second);
    coordinator.shutdown();
}

#[test]
fn loads_configuration_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MIXED.as_bytes()).unwrap();
    let config = BenchmarkConfig::load(file.path()).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.workload.distributions.len(), 4);
    assert_eq!(config.workload.warmup_duration, Duration::from_millis(100));

    assert!(matches!(
        BenchmarkConfig::load("/nonexistent/bench.yaml"),
        Err(ConfigError::InvalidFile { .. })
    ));
}
