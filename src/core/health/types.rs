//! Health tracking state and the published document shapes.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Handle returned by thread registration, used for heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(pub(crate) usize);

/// Liveness record for one long-lived thread.
#[derive(Debug, Clone)]
pub struct ThreadHealth {
    pub name: String,
    pub started: Instant,
    pub last_heartbeat: Instant,
    pub is_responsive: bool,
}

/// Resident-set tracking with the leak heuristic inputs.
#[derive(Debug, Clone, Default)]
pub struct MemoryHealth {
    pub initial_rss_kb: u64,
    pub current_rss_kb: u64,
    pub peak_rss_kb: u64,
    pub growth_rate_mb_per_hour: f64,
    pub leak_suspected: bool,
}

/// Per-hour error counters, reset by the hourly sweep.
#[derive(Debug, Clone, Default)]
pub struct ErrorCounters {
    pub sip_errors_hour: u32,
    pub fetch_failures_hour: u32,
    pub probe_failures_hour: u32,
    pub total_errors_24h: u32,
}

impl ErrorCounters {
    pub fn hourly_total(&self) -> u32 {
        self.sip_errors_hour + self.fetch_failures_hour + self.probe_failures_hour
    }
}

/// Boolean check results nested in the health document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    pub memory_stable: bool,
    pub no_recent_crashes: bool,
    pub sip_service_ok: bool,
    pub phonebook_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipServiceCounters {
    pub active_calls: u32,
    pub registered_users: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringCounters {
    pub probe_queue_depth: usize,
    pub last_probe_sent: String,
}

/// Published `agent_health` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthDoc {
    pub schema: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub node: String,
    pub sent_at: String,
    pub cpu_pct: f64,
    pub mem_mb: f64,
    pub queue_len: usize,
    pub uptime_seconds: u64,
    pub restart_count: u32,
    pub threads_responsive: bool,
    pub health_score: f64,
    pub checks: HealthChecks,
    pub sip_service: SipServiceCounters,
    pub monitoring: MonitoringCounters,
}

/// Published `crash_report` document; the crashes file is an array of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub schema: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub node: String,
    pub sent_at: String,
    pub crash_at: String,
    pub signal: i32,
    pub signal_name: String,
    pub reason: String,
    pub uptime_before_crash: u64,
    pub restart_count: u32,
}
