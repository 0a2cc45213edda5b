//! Background phone quality monitoring.
//!
//! A long-lived thread walks the registrar's user table on a fixed cycle,
//! probes every phone that resolves on the mesh, keeps the latest result
//! per phone, and publishes them as `/tmp/phone_quality.json`.

use crate::config::defaults::{MAX_QUALITY_RECORDS, PHONE_QUALITY_JSON_FILE};
use crate::config::VoipMonitorConfig;
use crate::core::emit;
use crate::core::health::HealthMonitor;
use crate::core::logger::Logger;
use crate::core::mesh::probe_engine::resolve_mesh_host;
use crate::core::voip::probe::{self, SipTransport};
use crate::core::voip::types::{RegistrarView, VoipProbeConfig, VoipProbeResult, VoipProbeStatus};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latest quality result for one phone.
#[derive(Debug, Clone)]
pub struct PhoneQualityRecord {
    pub number: String,
    pub ip: String,
    pub last_test_epoch: i64,
    pub result: VoipProbeResult,
}

/// Published per-phone entry.
#[derive(Serialize)]
struct PhoneEntry {
    number: String,
    ip: String,
    last_test: i64,
    status: &'static str,
    sip_rtt_ms: i64,
    icmp_rtt_ms: i64,
    media_rtt_ms: i64,
    jitter_ms: f64,
    loss_percent: f64,
    packets_lost: u32,
    packets_sent: u32,
    reason: String,
}

#[derive(Serialize)]
struct PhoneQualityDoc {
    schema: &'static str,
    #[serde(rename = "type")]
    doc_type: &'static str,
    node: String,
    sent_at: String,
    phones: Vec<PhoneEntry>,
}

pub struct PhoneQualityMonitor {
    registrar: Arc<dyn RegistrarView>,
    transport: Arc<dyn SipTransport>,
    config: VoipMonitorConfig,
    probe_config: VoipProbeConfig,
    mesh_domain: String,
    records: Mutex<Vec<PhoneQualityRecord>>,
    export_path: PathBuf,
    running: AtomicBool,
    health: Arc<HealthMonitor>,
    log: Arc<Logger>,
}

impl PhoneQualityMonitor {
    pub fn new(
        registrar: Arc<dyn RegistrarView>,
        transport: Arc<dyn SipTransport>,
        config: VoipMonitorConfig,
        mesh_domain: String,
        health: Arc<HealthMonitor>,
        log: Arc<Logger>,
    ) -> Self {
        let probe_config = VoipProbeConfig {
            invite_timeout_ms: config.timeout_ms,
            ..VoipProbeConfig::default()
        };
        Self {
            registrar,
            transport,
            config,
            probe_config,
            mesh_domain,
            records: Mutex::new(Vec::new()),
            export_path: PathBuf::from(PHONE_QUALITY_JSON_FILE),
            running: AtomicBool::new(true),
            health,
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

    /// Latest record for one phone.
    pub fn record(&self, number: &str) -> Option<PhoneQualityRecord> {
        let records = self.records.lock().expect("records lock");
        records.iter().find(|r| r.number == number).cloned()
    }

    /// All current records.
    pub fn records(&self) -> Vec<PhoneQualityRecord> {
        self.records.lock().expect("records lock").clone()
    }

    /// Monitor thread body: test cycle, export, then sleep out the interval
    /// in one-second steps so shutdown stays prompt.
    pub fn run(&self) {
        self.log.info(
            "QUALITY",
            &format!(
                "quality monitor running (interval={}s, cycle_delay={}s)",
                self.config.test_interval_s, self.config.cycle_delay_s
            ),
        );
        let thread = self.health.register_thread("quality");

        while self.is_running() {
            self.health.heartbeat(thread);
            self.run_cycle();

            for _ in 0..self.config.test_interval_s {
                if !self.is_running() {
                    break;
                }
                self.health.heartbeat(thread);
                std::thread::sleep(Duration::from_secs(1));
            }
        }

        self.log.info("QUALITY", "quality monitor thread exiting");
    }

    /// One full test cycle over a snapshot of the registered users.
    pub fn run_cycle(&self) {
        let phones = self.registrar.snapshot();
        self.health
            .set_sip_counters(self.registrar.active_calls(), phones.len() as u32);

        // DNS gates the test list: a phone that does not resolve is offline.
        let mut to_test: Vec<(String, Ipv4Addr)> = Vec::new();
        for phone in phones {
            match resolve_mesh_host(&phone.number, &self.mesh_domain) {
                Ok(ip) => to_test.push((phone.number, ip)),
                Err(_) => continue,
            }
        }

        self.log.info(
            "QUALITY",
            &format!("starting test cycle for {} phones", to_test.len()),
        );

        let mut failures = 0;
        let total = to_test.len();
        for (i, (number, ip)) in to_test.iter().enumerate() {
            if !self.is_running() {
                break;
            }

            let result = if self.config.media_probe {
                probe::media_probe(
                    self.transport.as_ref(),
                    number,
                    *ip,
                    &self.probe_config,
                    &self.log,
                )
            } else {
                probe::options_probe(
                    self.transport.as_ref(),
                    number,
                    *ip,
                    &self.probe_config,
                    &self.log,
                )
            };

            if result.status == VoipProbeStatus::Success {
                self.log.info(
                    "QUALITY",
                    &format!(
                        "[{}/{}] phone {} ok: sip_rtt={}ms jitter={:.2}ms loss={:.1}%",
                        i + 1,
                        total,
                        number,
                        result.sip_rtt_ms,
                        result.jitter_ms,
                        result.loss_fraction * 100.0
                    ),
                );
            } else {
                failures += 1;
                self.health.record_sip_error();
                self.log.warn(
                    "QUALITY",
                    &format!(
                        "[{}/{}] phone {} failed: {} - {}",
                        i + 1,
                        total,
                        number,
                        result.status.as_str(),
                        result.reason
                    ),
                );
            }

            self.store_result(number, &ip.to_string(), result);

            if i + 1 < total && self.is_running() {
                std::thread::sleep(Duration::from_secs(self.config.cycle_delay_s));
            }
        }

        self.export_quality_json();
        self.log.info(
            "QUALITY",
            &format!(
                "cycle complete: {} tested, {} failed",
                total, failures
            ),
        );
    }

    /// Keep the newest result per phone, bounded by the record limit.
    pub fn store_result(&self, number: &str, ip: &str, result: VoipProbeResult) {
        let mut records = self.records.lock().expect("records lock");
        let now = epoch_secs();

        if let Some(record) = records.iter_mut().find(|r| r.number == number) {
            record.ip = ip.to_string();
            record.last_test_epoch = now;
            record.result = result;
            return;
        }
        if records.len() >= MAX_QUALITY_RECORDS {
            self.log.warn(
                "QUALITY",
                &format!("quality records full, cannot store result for {}", number),
            );
            return;
        }
        records.push(PhoneQualityRecord {
            number: number.to_string(),
            ip: ip.to_string(),
            last_test_epoch: now,
            result,
        });
    }

    /// Publish every tested phone to the quality JSON file.
    pub fn export_quality_json(&self) {
        let doc = PhoneQualityDoc {
            schema: emit::SCHEMA,
            doc_type: "phone_quality",
            node: emit::node_name(),
            sent_at: emit::iso8601_now(),
            phones: self
                .records()
                .into_iter()
                .map(|r| PhoneEntry {
                    number: r.number,
                    ip: r.ip,
                    last_test: r.last_test_epoch,
                    status: r.result.status.as_str(),
                    sip_rtt_ms: r.result.sip_rtt_ms,
                    icmp_rtt_ms: r.result.icmp_rtt_ms,
                    media_rtt_ms: r.result.media_rtt_ms,
                    jitter_ms: r.result.jitter_ms,
                    loss_percent: r.result.loss_fraction * 100.0,
                    packets_lost: r.result.packets_lost,
                    packets_sent: r.result.packets_sent,
                    reason: r.result.reason,
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
