use crate::common;
use meshmon::core::health::monitor::{leak_suspected, score, HealthMonitor, HealthPaths};
use std::path::Path;

fn paths_in(dir: &Path) -> HealthPaths {
    HealthPaths {
        health_json: dir.join("health.json"),
        crashes_json: dir.join("crashes.json"),
        crash_spool: dir.join("crash.spool"),
    }
}

#[test]
fn score_matches_documented_deductions() {
    // 4 threads with 1 unresponsive, suspected leak, 2 crashes in 24h,
    // restart count over 5, 3 errors this hour.
    assert_eq!(score(1, true, 2, 6, 3), 32.0);
    // Healthy baseline.
    assert_eq!(score(0, false, 0, 0, 0), 100.0);
    // The floor holds.
    assert_eq!(score(10, true, 10, 10, 100), 0.0);
}

#[test]
fn healthy_iff_score_at_least_80() {
    assert!(score(1, false, 0, 0, 0) >= 80.0);
    assert!(score(1, false, 0, 0, 1) < 80.0);
}

#[test]
fn leak_requires_growth_and_absolute_increase() {
    assert!(leak_suspected(10_000, 15_001, 0.2));
    assert!(!leak_suspected(10_000, 15_000, 0.2)); // exactly 1.5x is not over
    assert!(!leak_suspected(10_000, 20_000, 0.1)); // growth at the threshold
}

#[test]
fn snapshot_has_complete_envelope_and_checks() {
    let dir = tempfile::tempdir().unwrap();
    let health = HealthMonitor::new(paths_in(dir.path()), common::test_logger(dir.path()));

    let thread = health.register_thread("worker");
    health.heartbeat(thread);
    health.set_sip_counters(1, 7);
    health.set_probe_queue_depth(3);

    let doc = health.snapshot();
    assert_eq!(doc.schema, "meshmon.v1");
    assert_eq!(doc.doc_type, "agent_health");
    assert!(!doc.node.is_empty());
    assert!(doc.threads_responsive);
    assert_eq!(doc.health_score, 100.0);
    assert!(doc.checks.memory_stable);
    assert!(doc.checks.no_recent_crashes);
    assert_eq!(doc.sip_service.registered_users, 7);
    assert_eq!(doc.monitoring.probe_queue_depth, 3);
    assert_eq!(doc.queue_len, 3);
    assert!(doc.mem_mb > 0.0);
}

#[test]
fn errors_pull_the_score_down() {
    let dir = tempfile::tempdir().unwrap();
    let health = HealthMonitor::new(paths_in(dir.path()), common::test_logger(dir.path()));

    for _ in 0..5 {
        health.record_sip_error();
    }
    for _ in 0..3 {
        health.record_probe_failure();
    }
    health.record_fetch_error();

    assert_eq!(health.health_score(), 91.0);
    assert!(health.is_healthy());

    let doc = health.snapshot();
    assert!(!doc.checks.sip_service_ok);
    assert!(!doc.checks.phonebook_current);
}

#[test]
fn crash_spool_folds_into_bounded_history() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    // A previous run left two crash records in the spool.
    std::fs::write(
        &paths.crash_spool,
        "sig 11 epoch 1700000100 uptime 300\nsig 6 epoch 1700000400 uptime 60\n",
    )
    .unwrap();

    let health = HealthMonitor::new(paths.clone(), common::test_logger(dir.path()));

    let history = health.crash_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].signal, 11);
    assert_eq!(history[0].signal_name, "SIGSEGV");
    assert_eq!(history[0].crash_at, "2023-11-14T22:15:00Z");
    assert_eq!(history[0].uptime_before_crash, 300);
    assert_eq!(history[1].signal_name, "SIGABRT");
    assert_eq!(health.restart_count(), 2);

    // The spool is consumed and the crashes file published as an array.
    assert_eq!(std::fs::read_to_string(&paths.crash_spool).unwrap(), "");
    let crashes: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&paths.crashes_json).unwrap()).unwrap();
    assert_eq!(crashes.as_array().unwrap().len(), 2);
    assert_eq!(crashes[0]["type"], "crash_report");

    // A restart after three more crashes keeps only the last five.
    std::fs::write(
        &paths.crash_spool,
        "sig 11 epoch 1700001000 uptime 1\nsig 11 epoch 1700002000 uptime 2\n\
         sig 11 epoch 1700003000 uptime 3\nsig 8 epoch 1700004000 uptime 4\n",
    )
    .unwrap();
    let health = HealthMonitor::new(paths.clone(), common::test_logger(dir.path()));
    let history = health.crash_history();
    assert_eq!(history.len(), 5);
    assert_eq!(history[4].signal_name, "SIGFPE");
    // The oldest record was shifted out.
    assert_eq!(history[0].crash_at, "2023-11-14T22:20:00Z");
}

#[test]
fn health_export_writes_parseable_document() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let health = HealthMonitor::new(paths.clone(), common::test_logger(dir.path()));

    health.export_health_json();

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&paths.health_json).unwrap()).unwrap();
    assert_eq!(doc["schema"], "meshmon.v1");
    assert_eq!(doc["type"], "agent_health");
    assert!(doc["checks"].is_object());
    assert!(doc["sip_service"].is_object());
    assert!(doc["monitoring"].is_object());
    assert!(!dir.path().join("health.json.tmp").exists());
}

#[test]
fn periodic_check_exports_and_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let health = HealthMonitor::new(paths.clone(), common::test_logger(dir.path()));

    health.periodic_health_check();
    assert!(paths.health_json.exists());

    // Memory data is present after the initial sample.
    let memory = health.memory_health();
    assert!(memory.initial_rss_kb > 0);
    assert!(memory.current_rss_kb > 0);
    assert!(!memory.leak_suspected);
}
