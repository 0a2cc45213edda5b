use crate::common;
use meshmon::config::defaults::PROBE_HISTORY_SIZE;
use meshmon::config::RoutingDaemonChoice;
use meshmon::core::health::monitor::{HealthMonitor, HealthPaths};
use meshmon::core::mesh::discovery::{AgentDiscovery, SysinfoEndpoint};
use meshmon::core::mesh::routing::{RoutingAdapter, RoutingPaths};
use meshmon::core::mesh::scheduler::{MonitorScheduler, ProbeHistory};
use meshmon::core::mesh::types::ProbeResult;
use meshmon::core::mesh::ProbeEngine;
use std::sync::Arc;

fn result_for(n: i64) -> ProbeResult {
    let mut result = ProbeResult::empty();
    result.dst_node = format!("node{}", n);
    result.dst_ip = format!("10.0.0.{}", n % 250 + 1);
    result.timestamp = 1_700_000_000 + n;
    result.routing_daemon = "olsr".to_string();
    result.rtt_ms_avg = n as f64;
    result
}

#[test]
fn history_ring_is_bounded_and_ordered() {
    let mut history = ProbeHistory::new();
    assert!(history.recent(PROBE_HISTORY_SIZE).is_empty());

    for n in 0..5 {
        history.push(result_for(n));
    }
    let recent = history.recent(PROBE_HISTORY_SIZE);
    assert_eq!(recent.len(), 5);
    // Newest first.
    assert_eq!(recent[0].dst_node, "node4");
    assert_eq!(recent[4].dst_node, "node0");

    // Overfill: the ring keeps only the newest PROBE_HISTORY_SIZE entries.
    for n in 5..(PROBE_HISTORY_SIZE as i64 + 13) {
        history.push(result_for(n));
    }
    let recent = history.recent(usize::MAX);
    assert_eq!(recent.len(), PROBE_HISTORY_SIZE);
    assert_eq!(recent[0].dst_node, format!("node{}", PROBE_HISTORY_SIZE + 12));
    assert_eq!(recent.last().unwrap().dst_node, "node13");
}

#[test]
fn history_reader_respects_max() {
    let mut history = ProbeHistory::new();
    for n in 0..10 {
        history.push(result_for(n));
    }
    let recent = history.recent(3);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].dst_node, "node9");
}

fn scheduler_fixture(dir: &std::path::Path) -> MonitorScheduler {
    let log = common::test_logger(dir);
    let config = common::loopback_config();

    let engine = Arc::new(ProbeEngine::new(&config, Arc::clone(&log)).unwrap());
    // Explicit daemon choice so no PID file detection runs.
    let routing = Arc::new(
        RoutingAdapter::new(
            RoutingDaemonChoice::Olsr,
            RoutingPaths::default(),
            std::time::Duration::from_secs(5),
            Arc::clone(&log),
        )
        .unwrap(),
    );
    let discovery = Arc::new(AgentDiscovery::new(
        dir.join("agent_cache.txt"),
        SysinfoEndpoint::default(),
        "local.mesh".to_string(),
        "test-node".to_string(),
        Arc::clone(&log),
    ));
    let health = HealthMonitor::new(
        HealthPaths {
            health_json: dir.join("health.json"),
            crashes_json: dir.join("crashes.json"),
            crash_spool: dir.join("crash.spool"),
        },
        Arc::clone(&log),
    );

    MonitorScheduler::new(config, engine, routing, discovery, health, log)
}

#[test]
fn export_publishes_complete_network_document() {
    let dir = tempfile::tempdir().unwrap();
    let mut scheduler = scheduler_fixture(dir.path());
    let export = dir.path().join("network.json");
    scheduler.set_export_path(export.clone());

    // Nothing recorded yet: no file is written.
    scheduler.export_network_json();
    assert!(!export.exists());

    scheduler.record_result(result_for(1));
    scheduler.record_result(result_for(2));
    scheduler.export_network_json();

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&export).unwrap()).unwrap();
    assert_eq!(doc["schema"], "meshmon.v1");
    assert_eq!(doc["type"], "network_status");
    assert_eq!(doc["routing_daemon"], "olsr");
    assert_eq!(doc["probe_count"], 2);
    assert_eq!(doc["probes"][0]["dst_node"], "node2");
    assert_eq!(doc["probes"][1]["dst_node"], "node1");
    // Timestamps publish as ISO-8601 UTC.
    assert!(doc["probes"][0]["timestamp"]
        .as_str()
        .unwrap()
        .ends_with('Z'));

    // No torn write left behind.
    assert!(!dir.path().join("network.json.tmp").exists());
}
