//! Periodic probe and discovery cycles, plus the result history ring.

use crate::config::defaults::{
    DISCOVERY_RESCAN_FLOOR_S, DISCOVERY_SCAN_INTERVAL_S, MAX_HOPS, NETWORK_JSON_FILE,
    PROBE_HISTORY_SIZE,
};
use crate::config::MonitorConfig;
use crate::core::emit;
use crate::core::health::HealthMonitor;
use crate::core::logger::Logger;
use crate::core::mesh::discovery::AgentDiscovery;
use crate::core::mesh::probe_engine::ProbeEngine;
use crate::core::mesh::routing::{classify_link_type, RoutingAdapter};
use crate::core::mesh::types::{DiscoveredAgent, HopInfo, ProbeResult};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Probes per burst and their spacing.
const PROBES_PER_BURST: u32 = 10;
const PROBE_SPACING_MS: u64 = 100;

/// Scheduler tick.
const TICK: Duration = Duration::from_secs(1);
const TICKS_PER_WAKE: u32 = 5;

/// Circular buffer of probe results. Entries with a zero timestamp are empty;
/// the write cursor points at the next slot to overwrite.
pub struct ProbeHistory {
    slots: Vec<ProbeResult>,
    cursor: usize,
}

impl ProbeHistory {
    pub fn new() -> Self {
        Self {
            slots: vec![ProbeResult::empty(); PROBE_HISTORY_SIZE],
            cursor: 0,
        }
    }

    pub fn push(&mut self, result: ProbeResult) {
        self.slots[self.cursor] = result;
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Most recent results first, skipping empty slots.
    pub fn recent(&self, max: usize) -> Vec<ProbeResult> {
        let len = self.slots.len();
        let mut out = Vec::new();
        for i in 0..len {
            if out.len() >= max {
                break;
            }
            let idx = (self.cursor + len - 1 - i) % len;
            if self.slots[idx].timestamp != 0 {
                out.push(self.slots[idx].clone());
            }
        }
        out
    }
}

impl Default for ProbeHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Published `network_status` document.
#[derive(Serialize)]
struct NetworkStatusDoc {
    schema: &'static str,
    #[serde(rename = "type")]
    doc_type: &'static str,
    node: String,
    sent_at: String,
    routing_daemon: String,
    probe_count: usize,
    probes: Vec<ProbeEntry>,
}

#[derive(Serialize)]
struct ProbeEntry {
    dst_node: String,
    dst_ip: String,
    timestamp: String,
    routing_daemon: String,
    rtt_ms_avg: f64,
    rtt_ms_min: f64,
    rtt_ms_max: f64,
    jitter_ms: f64,
    loss_pct: f64,
    hop_count: usize,
    path: Vec<HopInfo>,
}

pub struct MonitorScheduler {
    config: MonitorConfig,
    engine: Arc<ProbeEngine>,
    routing: Arc<RoutingAdapter>,
    discovery: Arc<AgentDiscovery>,
    health: Arc<HealthMonitor>,
    history: Mutex<ProbeHistory>,
    rotation: AtomicUsize,
    running: AtomicBool,
    export_path: PathBuf,
    log: Arc<Logger>,
}

impl MonitorScheduler {
    pub fn new(
        config: MonitorConfig,
        engine: Arc<ProbeEngine>,
        routing: Arc<RoutingAdapter>,
        discovery: Arc<AgentDiscovery>,
        health: Arc<HealthMonitor>,
        log: Arc<Logger>,
    ) -> Self {
        Self {
            config,
            engine,
            routing,
            discovery,
            health,
            history: Mutex::new(ProbeHistory::new()),
            rotation: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            export_path: PathBuf::from(NETWORK_JSON_FILE),
            log,
        }
    }

    /// Redirect the JSON export, for tests.
    pub fn set_export_path(&mut self, path: PathBuf) {
        self.export_path = path;
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Copy of the most recent probe results, newest first.
    pub fn recent_probes(&self, max: usize) -> Vec<ProbeResult> {
        self.history.lock().expect("history lock").recent(max)
    }

    /// Record a finished probe result, e.g. from an embedding server.
    pub fn record_result(&self, result: ProbeResult) {
        self.history.lock().expect("history lock").push(result);
    }

    /// Main loop. Wakes every few seconds, runs the probe cycle when its
    /// interval expires, and runs discovery hourly or on demand when the
    /// cache is empty at probe time.
    pub fn run(&self) {
        self.log.info("MESH_MONITOR", "mesh monitor thread started");
        let thread = self.health.register_thread("monitor");

        let now = epoch_secs();
        // Past timestamp so the first wake probes immediately; discovery
        // starts from the cached agent list.
        let mut last_probe = now - self.config.network_status_interval_s as i64 - 1;
        let mut last_discovery = now;

        while self.is_running() {
            self.health.heartbeat(thread);
            let now = epoch_secs();

            if now - last_discovery >= DISCOVERY_SCAN_INTERVAL_S as i64 {
                self.log.info("MESH_MONITOR", "running periodic agent discovery scan");
                self.discovery.scan();
                last_discovery = now;
            }

            if now - last_probe >= self.config.network_status_interval_s as i64 {
                let mut targets = self.select_targets();

                if targets.is_empty() && now - last_discovery >= DISCOVERY_RESCAN_FLOOR_S as i64 {
                    self.log
                        .debug("MESH_MONITOR", "no discovered agents, forcing a scan");
                    self.discovery.scan();
                    last_discovery = now;
                    targets = self.select_targets();
                }

                for agent in &targets {
                    if !self.is_running() {
                        break;
                    }
                    self.probe_target(agent);
                }

                self.export_network_json();
                last_probe = now;
            }

            for _ in 0..TICKS_PER_WAKE {
                if !self.is_running() {
                    break;
                }
                std::thread::sleep(TICK);
            }
        }

        self.log.info("MESH_MONITOR", "mesh monitor thread stopped");
    }

    /// Targets for this cycle: the first `neighbour_targets` cached agents,
    /// plus one rotating peer from the remainder when enabled.
    fn select_targets(&self) -> Vec<DiscoveredAgent> {
        let all = self.discovery.agents(usize::MAX);
        let near = self.config.neighbour_targets.min(all.len());
        let mut targets: Vec<DiscoveredAgent> = all[..near].to_vec();

        if self.config.rotating_peer && all.len() > near {
            let pool = all.len() - near;
            let pick = near + self.rotation.fetch_add(1, Ordering::Relaxed) % pool;
            targets.push(all[pick].clone());
        }
        targets
    }

    /// Inter-packet spacing honoring the probe bandwidth cap.
    fn burst_spacing_ms(&self) -> u64 {
        if self.config.max_probe_kbps == 0 {
            return PROBE_SPACING_MS;
        }
        // One probe datagram is 94 bytes of payload; spread packets so the
        // burst never exceeds the configured rate.
        let min_spacing = (94 * 8) / u64::from(self.config.max_probe_kbps) + 1;
        PROBE_SPACING_MS.max(min_spacing)
    }

    fn probe_target(&self, agent: &DiscoveredAgent) {
        let dst = agent.mesh_ip;
        let sent = match self
            .engine
            .send_probes(&dst.to_string(), PROBES_PER_BURST, self.burst_spacing_ms())
        {
            Ok(sent) => sent,
            Err(e) => {
                self.log
                    .warn("MESH_MONITOR", &format!("probe burst to {} failed: {}", dst, e));
                self.health.record_probe_failure();
                return;
            }
        };
        if sent == 0 {
            self.health.record_probe_failure();
            return;
        }

        self.health.set_probe_queue_depth(self.engine.pending_depth());

        // Let the echoes arrive before measuring.
        let window_end =
            std::time::Instant::now() + Duration::from_secs(self.config.probe_window_s);
        while self.is_running() && std::time::Instant::now() < window_end {
            std::thread::sleep(TICK.min(Duration::from_millis(250)));
        }

        let window = self.engine.calculate_metrics(dst);
        if window.received == 0 {
            self.health.record_probe_failure();
        }

        let mut result = ProbeResult {
            dst_node: agent.node.clone(),
            dst_ip: dst.to_string(),
            timestamp: epoch_secs(),
            routing_daemon: self.routing.daemon_name().to_string(),
            rtt_ms_avg: window.rtt_ms_avg,
            rtt_ms_min: window.rtt_ms_min,
            rtt_ms_max: window.rtt_ms_max,
            jitter_ms: window.jitter_ms,
            loss_pct: window.loss_pct,
            hop_count: 0,
            path: Vec::new(),
        };

        let hops: Vec<HopInfo> = self
            .routing
            .path_hops(dst, MAX_HOPS)
            .into_iter()
            .map(|h| HopInfo {
                node: h.node,
                link_type: classify_link_type(Some(&h.interface)).to_string(),
                interface: h.interface,
                lq: h.lq,
                nlq: h.nlq,
                etx: h.etx,
                // Per-hop RTT needs per-hop probing, which we do not do.
                rtt_ms: 0.0,
            })
            .collect();
        result.set_path(hops);

        self.log.debug(
            "MESH_MONITOR",
            &format!(
                "probe {} rtt_avg={:.2}ms jitter={:.2}ms loss={:.1}% hops={}",
                dst, result.rtt_ms_avg, result.jitter_ms, result.loss_pct, result.hop_count
            ),
        );

        self.history.lock().expect("history lock").push(result);
        self.health.mark_probe_sent();
    }

    /// Publish the ring as `/tmp/meshmon_network.json`.
    pub fn export_network_json(&self) {
        let probes = self.recent_probes(PROBE_HISTORY_SIZE);
        if probes.is_empty() {
            return;
        }

        let doc = NetworkStatusDoc {
            schema: emit::SCHEMA,
            doc_type: "network_status",
            node: emit::node_name(),
            sent_at: emit::iso8601_now(),
            routing_daemon: self.routing.daemon_name().to_string(),
            probe_count: probes.len(),
            probes: probes
                .into_iter()
                .map(|p| ProbeEntry {
                    dst_node: p.dst_node,
                    dst_ip: p.dst_ip,
                    timestamp: emit::iso8601_from_epoch(p.timestamp),
                    routing_daemon: p.routing_daemon,
                    rtt_ms_avg: p.rtt_ms_avg,
                    rtt_ms_min: p.rtt_ms_min,
                    rtt_ms_max: p.rtt_ms_max,
                    jitter_ms: p.jitter_ms,
                    loss_pct: p.loss_pct,
                    hop_count: p.hop_count,
                    path: p.path,
                })
                .collect(),
        };

        let _ = emit::publish_json(&self.export_path, &doc, &self.log);
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
