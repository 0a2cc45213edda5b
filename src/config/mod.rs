//! Typed agent configuration and the `/etc/sipserver.conf` loader.
//!
//! The configuration file is flat `key=value` text, optionally grouped into
//! INI sections. Keys for this agent live in `[mesh_monitor]` and
//! `[phone_quality]`; a file without section headers is treated as one big
//! `[mesh_monitor]` section so older installs keep working. Unknown keys are
//! ignored, malformed values fall back to the documented defaults.

pub mod defaults;

use crate::core::logger::LogLevel;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Monitoring mode for the mesh subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Disabled,
    #[default]
    Lightweight,
    Full,
}

/// Which routing daemon to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingDaemonChoice {
    #[default]
    Auto,
    Olsr,
    Babel,
}

/// Mesh monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub mode: MonitorMode,

    // Network status measurement
    pub network_status_interval_s: u64,
    pub probe_window_s: u64,
    pub neighbour_targets: usize,
    pub rotating_peer: bool,
    pub max_probe_kbps: u32,
    pub probe_port: u16,
    pub dscp_ef: bool,

    // Routing daemon integration
    pub routing_daemon: RoutingDaemonChoice,
    pub routing_cache_s: u64,

    // Remote reporting (optional)
    pub network_status_report_s: u64,
    pub collector_url: String,

    /// DNS suffix appended to bare node and phone names.
    pub mesh_domain: String,

    pub log_level: LogLevel,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: MonitorMode::Lightweight,
            network_status_interval_s: 40,
            probe_window_s: 5,
            neighbour_targets: 2,
            rotating_peer: true,
            max_probe_kbps: 80,
            probe_port: 40050,
            dscp_ef: true,
            routing_daemon: RoutingDaemonChoice::Auto,
            routing_cache_s: 5,
            network_status_report_s: 40,
            collector_url: String::new(),
            mesh_domain: defaults::MESH_DOMAIN.to_string(),
            log_level: LogLevel::Info,
        }
    }
}

/// Phone quality monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoipMonitorConfig {
    pub enabled: bool,
    /// Seconds between full test cycles.
    pub test_interval_s: u64,
    /// Seconds between phones within one cycle.
    pub cycle_delay_s: u64,
    /// SIP OPTIONS / INVITE response timeout.
    pub timeout_ms: u64,
    /// Run the full media probe instead of OPTIONS-only.
    pub media_probe: bool,
}

impl Default for VoipMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            test_interval_s: 300,
            cycle_delay_s: 1,
            timeout_ms: 5000,
            media_probe: false,
        }
    }
}

/// Everything the agent reads from disk at boot.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub monitor: MonitorConfig,
    pub voip: VoipMonitorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    MeshMonitor,
    PhoneQuality,
    Other,
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// is missing or a value does not parse. Returns the config plus a list of
    /// warnings for the caller to log once the logger exists.
    pub fn load(path: &Path) -> (Self, Vec<String>) {
        let mut cfg = AgentConfig::default();
        let mut warnings = Vec::new();

        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(_) => {
                warnings.push(format!(
                    "configuration file {} not found, using defaults",
                    path.display()
                ));
                return (cfg, warnings);
            }
        };

        // Files without section headers are treated as [mesh_monitor].
        let mut section = Section::MeshMonitor;

        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                section = match line {
                    "[mesh_monitor]" => Section::MeshMonitor,
                    "[phone_quality]" => Section::PhoneQuality,
                    _ => Section::Other,
                };
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match section {
                Section::MeshMonitor => cfg.apply_monitor_key(key, value, &mut warnings),
                Section::PhoneQuality => cfg.apply_voip_key(key, value, &mut warnings),
                Section::Other => {}
            }
        }

        (cfg, warnings)
    }

    fn apply_monitor_key(&mut self, key: &str, value: &str, warnings: &mut Vec<String>) {
        let m = &mut self.monitor;
        match key {
            "enabled" => m.enabled = parse_flag(value),
            "mode" => match value {
                "disabled" => m.mode = MonitorMode::Disabled,
                "lightweight" => m.mode = MonitorMode::Lightweight,
                "full" => m.mode = MonitorMode::Full,
                other => warnings.push(format!("unknown mode '{}', keeping default", other)),
            },
            "network_status_interval_s" => parse_num(value, &mut m.network_status_interval_s, key, warnings),
            "probe_window_s" => parse_num(value, &mut m.probe_window_s, key, warnings),
            "neighbour_targets" | "neighbor_targets" => {
                parse_num(value, &mut m.neighbour_targets, key, warnings)
            }
            "rotating_peer" => m.rotating_peer = parse_flag(value),
            "max_probe_kbps" => parse_num(value, &mut m.max_probe_kbps, key, warnings),
            "probe_port" => parse_num(value, &mut m.probe_port, key, warnings),
            "dscp_ef" => m.dscp_ef = parse_flag(value),
            "routing_daemon" => match value {
                "auto" => m.routing_daemon = RoutingDaemonChoice::Auto,
                "olsr" => m.routing_daemon = RoutingDaemonChoice::Olsr,
                "babel" => m.routing_daemon = RoutingDaemonChoice::Babel,
                other => warnings.push(format!("unknown routing_daemon '{}', keeping auto", other)),
            },
            "routing_cache_s" => parse_num(value, &mut m.routing_cache_s, key, warnings),
            "network_status_report_s" => parse_num(value, &mut m.network_status_report_s, key, warnings),
            "collector_url" => m.collector_url = value.to_string(),
            "mesh_domain" => m.mesh_domain = value.to_string(),
            "LOG_LEVEL" | "log_level" => match LogLevel::parse(value) {
                Some(level) => m.log_level = level,
                None => warnings.push(format!("unknown LOG_LEVEL '{}', keeping info", value)),
            },
            _ => {}
        }
    }

    fn apply_voip_key(&mut self, key: &str, value: &str, warnings: &mut Vec<String>) {
        let v = &mut self.voip;
        match key {
            "enabled" => v.enabled = parse_flag(value),
            "test_interval_s" => parse_num(value, &mut v.test_interval_s, key, warnings),
            "cycle_delay_s" => parse_num(value, &mut v.cycle_delay_s, key, warnings),
            "timeout_ms" => parse_num(value, &mut v.timeout_ms, key, warnings),
            "media_probe" => v.media_probe = parse_flag(value),
            _ => {}
        }
    }
}

/// `1`/`true`/`yes` are on; everything else is off.
fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_num<T: std::str::FromStr>(
    value: &str,
    slot: &mut T,
    key: &str,
    warnings: &mut Vec<String>,
) {
    match value.parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warnings.push(format!("bad value '{}' for {}, keeping default", value, key)),
    }
}
