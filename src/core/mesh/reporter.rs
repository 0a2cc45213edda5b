//! Optional remote reporting to a central collector.
//!
//! When a collector URL is configured, this thread POSTs the current health
//! document every minute and the published network status at the configured
//! interval. Collector outages are logged and retried on the next tick.

use crate::config::defaults::NETWORK_JSON_FILE;
use crate::core::health::HealthMonitor;
use crate::core::logger::Logger;
use crate::core::mesh::http_client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const TICK: Duration = Duration::from_secs(10);
const MAX_NETWORK_JSON: u64 = 1024 * 1024;

pub struct RemoteReporter {
    collector_url: String,
    network_report_interval: Duration,
    network_json_path: PathBuf,
    health: Arc<HealthMonitor>,
    running: AtomicBool,
    log: Arc<Logger>,
}

impl RemoteReporter {
    pub fn new(
        collector_url: String,
        network_report_interval_s: u64,
        health: Arc<HealthMonitor>,
        log: Arc<Logger>,
    ) -> Self {
        Self {
            collector_url,
            network_report_interval: Duration::from_secs(network_report_interval_s),
            network_json_path: PathBuf::from(NETWORK_JSON_FILE),
            health,
            running: AtomicBool::new(true),
            log,
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn run(&self) {
        self.log.info(
            "REMOTE_REPORTER",
            &format!(
                "remote reporter started (interval={}s, url={})",
                self.network_report_interval.as_secs(),
                self.collector_url
            ),
        );

        let mut last_health: Option<Instant> = None;
        let mut last_network: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            if last_health.map(|t| t.elapsed() >= HEALTH_REPORT_INTERVAL).unwrap_or(true) {
                self.send_health_report();
                last_health = Some(Instant::now());
            }

            if !self.network_report_interval.is_zero()
                && last_network
                    .map(|t| t.elapsed() >= self.network_report_interval)
                    .unwrap_or(true)
            {
                self.send_network_report();
                last_network = Some(Instant::now());
            }

            std::thread::sleep(TICK);
        }

        self.log.info("REMOTE_REPORTER", "remote reporter stopped");
    }

    pub fn send_health_report(&self) {
        let doc = self.health.snapshot();
        let json = match serde_json::to_string(&doc) {
            Ok(json) => json,
            Err(e) => {
                self.log
                    .error("REMOTE_REPORTER", &format!("failed to build health JSON: {}", e));
                return;
            }
        };
        match http_client::http_post_json(&self.collector_url, &json) {
            Ok(()) => self.log.debug("REMOTE_REPORTER", "health report sent"),
            Err(e) => self
                .log
                .warn("REMOTE_REPORTER", &format!("health report failed: {}", e)),
        }
    }

    /// Forward the already-published network JSON file instead of rebuilding
    /// the document.
    pub fn send_network_report(&self) {
        let json = match std::fs::metadata(&self.network_json_path) {
            Ok(meta) if meta.len() > 0 && meta.len() <= MAX_NETWORK_JSON => {
                match std::fs::read_to_string(&self.network_json_path) {
                    Ok(json) => json,
                    Err(_) => return,
                }
            }
            Ok(meta) if meta.len() > MAX_NETWORK_JSON => {
                self.log.warn(
                    "REMOTE_REPORTER",
                    &format!("network JSON too large ({} bytes), skipping", meta.len()),
                );
                return;
            }
            _ => {
                self.log.debug("REMOTE_REPORTER", "no network data to report yet");
                return;
            }
        };

        match http_client::http_post_json(&self.collector_url, &json) {
            Ok(()) => self.log.debug("REMOTE_REPORTER", "network report sent"),
            Err(e) => self
                .log
                .warn("REMOTE_REPORTER", &format!("network report failed: {}", e)),
        }
    }
}
