//! Core types for mesh monitoring.

use crate::config::defaults::MAX_HOPS;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One adjacency as reported by the routing daemon. Transient per query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbour {
    pub ip: Ipv4Addr,
    /// Node label; falls back to the address text when the daemon has no name.
    pub node: String,
    pub interface: String,
    /// Link quality toward the neighbour (0.0 when unknown).
    pub lq: f64,
    /// Link quality reported back by the neighbour.
    pub nlq: f64,
    /// Expected transmission count.
    pub etx: f64,
}

/// An installed route to a destination. Transient per query.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteInfo {
    pub dst_ip: Ipv4Addr,
    pub next_hop_ip: Option<Ipv4Addr>,
    pub hop_count: u32,
    pub etx: f64,
}

/// One entry in a probe result's hop path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopInfo {
    pub node: String,
    pub interface: String,
    pub link_type: String,
    pub lq: f64,
    pub nlq: f64,
    pub etx: f64,
    /// Per-hop RTT; zero when not measured.
    pub rtt_ms: f64,
}

/// Full outcome of one probe window against a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub dst_node: String,
    pub dst_ip: String,
    /// Unix epoch seconds; zero marks an empty history slot.
    pub timestamp: i64,
    pub routing_daemon: String,

    pub rtt_ms_avg: f64,
    pub rtt_ms_min: f64,
    pub rtt_ms_max: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,

    pub hop_count: usize,
    pub path: Vec<HopInfo>,
}

impl ProbeResult {
    pub fn empty() -> Self {
        Self {
            dst_node: String::new(),
            dst_ip: String::new(),
            timestamp: 0,
            routing_daemon: String::new(),
            rtt_ms_avg: 0.0,
            rtt_ms_min: 0.0,
            rtt_ms_max: 0.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            hop_count: 0,
            path: Vec::new(),
        }
    }

    /// Cap the hop path at the wire limit.
    pub fn set_path(&mut self, mut hops: Vec<HopInfo>) {
        hops.truncate(MAX_HOPS);
        self.hop_count = hops.len();
        self.path = hops;
    }
}

/// A peer node confirmed to answer agent probes. Owned by discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredAgent {
    /// Mesh-side address, the one we can reach.
    pub mesh_ip: Ipv4Addr,
    /// LAN-side address reported by the peer's hello endpoint.
    pub lan_ip: Ipv4Addr,
    pub node: String,
    /// Unix epoch seconds of the last successful probe.
    pub last_seen: i64,
    pub is_active: bool,
}

/// Mesh monitoring errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DNS resolution failed for {0}")]
    Dns(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("routing daemon unavailable: {0}")]
    Routing(String),
    #[error("engine not running")]
    NotRunning,
    #[error("configuration error: {0}")]
    Config(String),
}
