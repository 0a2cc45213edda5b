//! Process self-health tracking.
//!
//! Tracks thread liveness through heartbeats, resident-set growth, CPU use,
//! per-hour error rates and crash history, folds them into a 0..100 health
//! score, and publishes `agent_health` and `crash_report` documents.

use crate::config::defaults::{
    CRASHES_JSON_FILE, CRASH_SPOOL_FILE, HEALTH_JSON_FILE, MAX_CRASH_HISTORY,
    THREAD_TIMEOUT_SECONDS,
};
use crate::core::emit;
use crate::core::health::crash::{self, SpoolRecord};
use crate::core::health::types::*;
use crate::core::logger::Logger;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Seconds between resident-set samples.
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// Seconds between health JSON exports.
const HEALTH_EXPORT_INTERVAL: Duration = Duration::from_secs(60);
/// Error counters reset once per hour.
const ERROR_RATE_WINDOW: Duration = Duration::from_secs(3600);

/// File locations, overridable for tests.
#[derive(Debug, Clone)]
pub struct HealthPaths {
    pub health_json: PathBuf,
    pub crashes_json: PathBuf,
    pub crash_spool: PathBuf,
}

impl Default for HealthPaths {
    fn default() -> Self {
        Self {
            health_json: PathBuf::from(HEALTH_JSON_FILE),
            crashes_json: PathBuf::from(CRASHES_JSON_FILE),
            crash_spool: PathBuf::from(CRASH_SPOOL_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    process_jiffies: u64,
    total_jiffies: u64,
}

struct HealthState {
    threads: Vec<ThreadHealth>,
    memory: MemoryHealth,
    errors: ErrorCounters,
    crashes: Vec<CrashReport>,
    restart_count: u32,
    cpu_pct: f64,
    cpu_prev: Option<CpuSample>,
    sip_active_calls: u32,
    sip_registered_users: u32,
    probe_queue_depth: usize,
    last_probe_sent: String,
    last_memory_sample: Option<Instant>,
    last_export: Option<Instant>,
    hour_started: Instant,
}

pub struct HealthMonitor {
    state: Mutex<HealthState>,
    start: Instant,
    paths: HealthPaths,
    running: AtomicBool,
    log: Arc<Logger>,
}

impl HealthMonitor {
    /// Construct the monitor: take the initial resident-set sample, fold any
    /// crash spool left by a previous run into the bounded history, and
    /// install the crash signal handlers.
    pub fn new(paths: HealthPaths, log: Arc<Logger>) -> Arc<Self> {
        let initial_rss = read_vmrss_kb().unwrap_or(0);

        let mut crashes = load_crash_history(&paths.crashes_json);
        let spooled = crash::drain_spool(&paths.crash_spool);
        let restart_count = crashes.len() as u32 + spooled.len() as u32;
        for record in &spooled {
            push_crash(&mut crashes, crash_report_from_spool(record, restart_count));
        }

        let monitor = Arc::new(Self {
            state: Mutex::new(HealthState {
                threads: Vec::new(),
                memory: MemoryHealth {
                    initial_rss_kb: initial_rss,
                    current_rss_kb: initial_rss,
                    peak_rss_kb: initial_rss,
                    growth_rate_mb_per_hour: 0.0,
                    leak_suspected: false,
                },
                errors: ErrorCounters::default(),
                crashes,
                restart_count,
                cpu_pct: 0.0,
                cpu_prev: sample_cpu(),
                sip_active_calls: 0,
                sip_registered_users: 0,
                probe_queue_depth: 0,
                last_probe_sent: String::new(),
                last_memory_sample: Some(Instant::now()),
                last_export: None,
                hour_started: Instant::now(),
            }),
            start: Instant::now(),
            paths,
            running: AtomicBool::new(true),
            log,
        });

        if !spooled.is_empty() {
            monitor.log.warn(
                "HEALTH",
                &format!("recovered {} crash record(s) from previous run", spooled.len()),
            );
            monitor.export_crashes_json();
        }
        if let Err(e) = crash::install_handlers(&monitor.paths.crash_spool) {
            monitor
                .log
                .error("HEALTH", &format!("failed to install crash handlers: {}", e));
        }

        monitor
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ---- thread liveness -------------------------------------------------

    pub fn register_thread(&self, name: &str) -> ThreadId {
        let mut state = self.state.lock().expect("health lock");
        let now = Instant::now();
        state.threads.push(ThreadHealth {
            name: name.to_string(),
            started: now,
            last_heartbeat: now,
            is_responsive: true,
        });
        ThreadId(state.threads.len() - 1)
    }

    pub fn heartbeat(&self, id: ThreadId) {
        let mut state = self.state.lock().expect("health lock");
        if let Some(thread) = state.threads.get_mut(id.0) {
            thread.last_heartbeat = Instant::now();
            thread.is_responsive = true;
        }
    }

    /// Mark threads whose heartbeat is older than the timeout.
    pub fn sweep_threads(&self) {
        let timeout = Duration::from_secs(THREAD_TIMEOUT_SECONDS);
        let mut state = self.state.lock().expect("health lock");
        for thread in &mut state.threads {
            let silent = thread.last_heartbeat.elapsed();
            if silent > timeout && thread.is_responsive {
                thread.is_responsive = false;
                self.log.warn(
                    "HEALTH",
                    &format!(
                        "thread '{}' silent for {}s, marking unresponsive",
                        thread.name,
                        silent.as_secs()
                    ),
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_unresponsive(&self, id: ThreadId) {
        let mut state = self.state.lock().expect("health lock");
        if let Some(thread) = state.threads.get_mut(id.0) {
            thread.is_responsive = false;
        }
    }

    // ---- counters fed by the other subsystems ----------------------------

    pub fn record_sip_error(&self) {
        let mut state = self.state.lock().expect("health lock");
        state.errors.sip_errors_hour += 1;
        state.errors.total_errors_24h += 1;
    }

    pub fn record_fetch_error(&self) {
        let mut state = self.state.lock().expect("health lock");
        state.errors.fetch_failures_hour += 1;
        state.errors.total_errors_24h += 1;
    }

    pub fn record_probe_failure(&self) {
        let mut state = self.state.lock().expect("health lock");
        state.errors.probe_failures_hour += 1;
        state.errors.total_errors_24h += 1;
    }

    pub fn set_sip_counters(&self, active_calls: u32, registered_users: u32) {
        let mut state = self.state.lock().expect("health lock");
        state.sip_active_calls = active_calls;
        state.sip_registered_users = registered_users;
    }

    pub fn set_probe_queue_depth(&self, depth: usize) {
        self.state.lock().expect("health lock").probe_queue_depth = depth;
    }

    pub fn mark_probe_sent(&self) {
        self.state.lock().expect("health lock").last_probe_sent = emit::iso8601_now();
    }

    // ---- scoring ---------------------------------------------------------

    pub fn health_score(&self) -> f64 {
        let state = self.state.lock().expect("health lock");
        let unresponsive = state.threads.iter().filter(|t| !t.is_responsive).count();
        score(
            unresponsive,
            state.memory.leak_suspected,
            crashes_in_last_24h(&state.crashes),
            state.restart_count,
            state.errors.hourly_total(),
        )
    }

    pub fn is_healthy(&self) -> bool {
        self.health_score() >= 80.0
    }

    /// Current `agent_health` document.
    pub fn snapshot(&self) -> AgentHealthDoc {
        let state = self.state.lock().expect("health lock");
        let unresponsive = state.threads.iter().filter(|t| !t.is_responsive).count();
        let crashes_24h = crashes_in_last_24h(&state.crashes);
        let score = score(
            unresponsive,
            state.memory.leak_suspected,
            crashes_24h,
            state.restart_count,
            state.errors.hourly_total(),
        );

        AgentHealthDoc {
            schema: emit::SCHEMA.to_string(),
            doc_type: "agent_health".to_string(),
            node: emit::node_name(),
            sent_at: emit::iso8601_now(),
            cpu_pct: state.cpu_pct,
            mem_mb: state.memory.current_rss_kb as f64 / 1024.0,
            queue_len: state.probe_queue_depth,
            uptime_seconds: self.start.elapsed().as_secs(),
            restart_count: state.restart_count,
            threads_responsive: unresponsive == 0,
            health_score: score,
            checks: HealthChecks {
                memory_stable: !state.memory.leak_suspected,
                no_recent_crashes: crashes_24h == 0,
                sip_service_ok: state.errors.sip_errors_hour == 0,
                phonebook_current: state.errors.fetch_failures_hour == 0,
            },
            sip_service: SipServiceCounters {
                active_calls: state.sip_active_calls,
                registered_users: state.sip_registered_users,
            },
            monitoring: MonitoringCounters {
                probe_queue_depth: state.probe_queue_depth,
                last_probe_sent: state.last_probe_sent.clone(),
            },
        }
    }

    // ---- periodic work ---------------------------------------------------

    /// One pass of the periodic duties: memory sample when due, thread
    /// sweep, health JSON export every minute, hourly counter reset.
    pub fn periodic_health_check(&self) {
        self.sweep_threads();

        let (sample_memory, export, reset_hour) = {
            let state = self.state.lock().expect("health lock");
            (
                state
                    .last_memory_sample
                    .map(|t| t.elapsed() >= MEMORY_CHECK_INTERVAL)
                    .unwrap_or(true),
                state
                    .last_export
                    .map(|t| t.elapsed() >= HEALTH_EXPORT_INTERVAL)
                    .unwrap_or(true),
                state.hour_started.elapsed() >= ERROR_RATE_WINDOW,
            )
        };

        if sample_memory {
            self.sample_memory();
        }
        if reset_hour {
            let mut state = self.state.lock().expect("health lock");
            state.errors.sip_errors_hour = 0;
            state.errors.fetch_failures_hour = 0;
            state.errors.probe_failures_hour = 0;
            state.hour_started = Instant::now();
        }
        if export {
            self.export_health_json();
            self.state.lock().expect("health lock").last_export = Some(Instant::now());
        }
    }

    /// Supervisor loop for the health thread.
    pub fn run_periodic(&self) {
        let thread = self.register_thread("health");
        while self.running.load(Ordering::SeqCst) {
            self.heartbeat(thread);
            self.periodic_health_check();
            std::thread::sleep(Duration::from_secs(5));
        }
    }

    /// Sample VmRSS and CPU and refresh the leak heuristic.
    pub fn sample_memory(&self) {
        let rss_kb = match read_vmrss_kb() {
            Some(v) => v,
            None => return,
        };
        let cpu_now = sample_cpu();

        let mut state = self.state.lock().expect("health lock");
        let elapsed_h = state
            .last_memory_sample
            .map(|t| t.elapsed().as_secs_f64() / 3600.0)
            .unwrap_or(0.0);

        if elapsed_h > 0.0 {
            let delta_mb = (rss_kb as f64 - state.memory.current_rss_kb as f64) / 1024.0;
            state.memory.growth_rate_mb_per_hour = delta_mb / elapsed_h;
        }
        state.memory.current_rss_kb = rss_kb;
        state.memory.peak_rss_kb = state.memory.peak_rss_kb.max(rss_kb);
        state.memory.leak_suspected = leak_suspected(
            state.memory.initial_rss_kb,
            rss_kb,
            state.memory.growth_rate_mb_per_hour,
        );
        state.last_memory_sample = Some(Instant::now());

        if let (Some(prev), Some(now)) = (state.cpu_prev, cpu_now) {
            let dp = now.process_jiffies.saturating_sub(prev.process_jiffies) as f64;
            let dt = now.total_jiffies.saturating_sub(prev.total_jiffies) as f64;
            if dt > 0.0 {
                state.cpu_pct = 100.0 * dp / dt;
            }
        }
        if cpu_now.is_some() {
            state.cpu_prev = cpu_now;
        }

        if state.memory.leak_suspected {
            self.log.warn(
                "HEALTH",
                &format!(
                    "memory leak suspected: rss {} KiB vs initial {} KiB, growth {:.2} MB/h",
                    rss_kb, state.memory.initial_rss_kb, state.memory.growth_rate_mb_per_hour
                ),
            );
        }
    }

    // ---- exports ---------------------------------------------------------

    pub fn export_health_json(&self) {
        let doc = self.snapshot();
        let _ = emit::publish_json(&self.paths.health_json, &doc, &self.log);
    }

    pub fn export_crashes_json(&self) {
        let crashes = {
            let state = self.state.lock().expect("health lock");
            state.crashes.clone()
        };
        let _ = emit::publish_json(&self.paths.crashes_json, &crashes, &self.log);
    }

    pub fn crash_history(&self) -> Vec<CrashReport> {
        self.state.lock().expect("health lock").crashes.clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.state.lock().expect("health lock").restart_count
    }

    pub fn memory_health(&self) -> MemoryHealth {
        self.state.lock().expect("health lock").memory.clone()
    }
}

/// Health score per the published scale: start at 100, subtract 20 per
/// unresponsive thread, 15 for a suspected leak, 10 per crash in the last
/// day, 10 when the restart count exceeds 5, and 1 per error this hour,
/// clamped to 0..100.
pub fn score(
    unresponsive_threads: usize,
    leak_suspected: bool,
    crashes_24h: u32,
    restart_count: u32,
    hourly_errors: u32,
) -> f64 {
    let mut score = 100.0;
    score -= 20.0 * unresponsive_threads as f64;
    if leak_suspected {
        score -= 15.0;
    }
    score -= 10.0 * f64::from(crashes_24h);
    if restart_count > 5 {
        score -= 10.0;
    }
    score -= f64::from(hourly_errors);
    score.clamp(0.0, 100.0)
}

/// Leak heuristic: resident set half again over the starting point while
/// still growing measurably.
pub fn leak_suspected(initial_rss_kb: u64, current_rss_kb: u64, growth_mb_per_hour: f64) -> bool {
    current_rss_kb as f64 > 1.5 * initial_rss_kb as f64 && growth_mb_per_hour > 0.1
}

fn crashes_in_last_24h(crashes: &[CrashReport]) -> u32 {
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
    crashes
        .iter()
        .filter(|c| {
            chrono::DateTime::parse_from_rfc3339(&c.crash_at)
                .map(|t| t.with_timezone(&chrono::Utc) >= cutoff)
                .unwrap_or(false)
        })
        .count() as u32
}

fn push_crash(crashes: &mut Vec<CrashReport>, report: CrashReport) {
    if crashes.len() >= MAX_CRASH_HISTORY {
        crashes.remove(0);
    }
    crashes.push(report);
}

fn crash_report_from_spool(record: &SpoolRecord, restart_count: u32) -> CrashReport {
    let name = crash::signal_name(record.signal);
    CrashReport {
        schema: emit::SCHEMA.to_string(),
        doc_type: "crash_report".to_string(),
        node: emit::node_name(),
        sent_at: emit::iso8601_now(),
        crash_at: emit::iso8601_from_epoch(record.crash_epoch),
        signal: record.signal,
        signal_name: name.to_string(),
        reason: format!("terminated by {}", name),
        uptime_before_crash: record.uptime_seconds.max(0) as u64,
        restart_count,
    }
}

fn load_crash_history(path: &std::path::Path) -> Vec<CrashReport> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut crashes: Vec<CrashReport> = serde_json::from_str(&content).unwrap_or_default();
    if crashes.len() > MAX_CRASH_HISTORY {
        let excess = crashes.len() - MAX_CRASH_HISTORY;
        crashes.drain(0..excess);
    }
    crashes
}

fn read_vmrss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

/// Process and system jiffies, for CPU percent deltas.
fn sample_cpu() -> Option<CpuSample> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15 (utime, stime) come after the parenthesised comm,
    // which may itself contain spaces.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;

    let total = std::fs::read_to_string("/proc/stat").ok()?;
    let cpu_line = total.lines().find(|l| l.starts_with("cpu "))?;
    let total_jiffies: u64 = cpu_line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse::<u64>().ok())
        .sum();

    Some(CpuSample {
        process_jiffies: utime + stime,
        total_jiffies,
    })
}
