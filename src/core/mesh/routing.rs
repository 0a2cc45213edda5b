//! Daemon-agnostic read access to the local routing daemon.
//!
//! Two backends share one adapter surface: OLSR via the jsoninfo HTTP plugin
//! on loopback, and Babel via its control UNIX socket. Every query fails
//! closed; a daemon that is down or answers garbage yields an empty result,
//! never partial data.

use crate::config::defaults;
use crate::config::RoutingDaemonChoice;
use crate::core::logger::Logger;
use crate::core::mesh::http_client;
use crate::core::mesh::types::{MonitorError, Neighbour, RouteInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const BABEL_MAX_DUMP: usize = 128 * 1024;

/// Filesystem and endpoint locations, overridable for tests.
#[derive(Debug, Clone)]
pub struct RoutingPaths {
    pub olsr_pid: PathBuf,
    pub babel_pid: PathBuf,
    pub babel_socket: PathBuf,
    pub olsr_host: String,
    pub olsr_port: u16,
}

impl Default for RoutingPaths {
    fn default() -> Self {
        Self {
            olsr_pid: PathBuf::from(defaults::OLSR_PID_FILE),
            babel_pid: PathBuf::from(defaults::BABEL_PID_FILE),
            babel_socket: PathBuf::from(defaults::BABEL_SOCKET_PATH),
            olsr_host: defaults::OLSR_JSONINFO_HOST.to_string(),
            olsr_port: defaults::OLSR_JSONINFO_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveDaemon {
    Olsr,
    Babel,
}

/// Read adapter over the detected routing daemon.
pub struct RoutingAdapter {
    daemon: ActiveDaemon,
    paths: RoutingPaths,
    /// Raw query responses cached briefly; a probe cycle hits the same
    /// tables several times in a row.
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, String)>>,
    log: Arc<Logger>,
}

/// Classify an interface name into a link type tag.
///
/// Pure prefix table: `wlan*` is RF, `tun*` a tunnel, `eth*` ethernet,
/// `br-*` a bridge; anything else (including a missing name) is unknown.
pub fn classify_link_type(interface: Option<&str>) -> &'static str {
    let Some(interface) = interface else {
        return "unknown";
    };
    if interface.starts_with("wlan") {
        "RF"
    } else if interface.starts_with("tun") {
        "tunnel"
    } else if interface.starts_with("eth") {
        "ethernet"
    } else if interface.starts_with("br-") {
        "bridge"
    } else {
        "unknown"
    }
}

impl RoutingAdapter {
    /// Detect (or accept) the routing daemon. `Auto` checks the OLSR PID file
    /// first, then Babel; with neither present initialisation fails.
    pub fn new(
        choice: RoutingDaemonChoice,
        paths: RoutingPaths,
        cache_ttl: Duration,
        log: Arc<Logger>,
    ) -> Result<Self, MonitorError> {
        let daemon = match choice {
            RoutingDaemonChoice::Olsr => ActiveDaemon::Olsr,
            RoutingDaemonChoice::Babel => ActiveDaemon::Babel,
            RoutingDaemonChoice::Auto => {
                if paths.olsr_pid.exists() {
                    log.info("ROUTING", "detected OLSR routing daemon");
                    ActiveDaemon::Olsr
                } else if paths.babel_pid.exists() {
                    log.info("ROUTING", "detected Babel routing daemon");
                    ActiveDaemon::Babel
                } else {
                    return Err(MonitorError::Routing(
                        "no routing daemon detected".to_string(),
                    ));
                }
            }
        };

        Ok(Self {
            daemon,
            paths,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            log,
        })
    }

    pub fn daemon_name(&self) -> &'static str {
        match self.daemon {
            ActiveDaemon::Olsr => "olsr",
            ActiveDaemon::Babel => "babel",
        }
    }

    /// Current adjacencies. Empty on any transport or parse failure.
    pub fn neighbours(&self) -> Vec<Neighbour> {
        match self.daemon {
            ActiveDaemon::Olsr => match self.olsr_query("/neighbors") {
                Some(body) => parse_olsr_neighbours(&body),
                None => Vec::new(),
            },
            ActiveDaemon::Babel => match self.babel_dump() {
                Some(dump) => parse_babel_neighbours(&dump),
                None => Vec::new(),
            },
        }
    }

    /// Installed route toward `dst`, if the daemon has one.
    pub fn route(&self, dst: Ipv4Addr) -> Option<RouteInfo> {
        match self.daemon {
            ActiveDaemon::Olsr => parse_olsr_route(&self.olsr_query("/routes")?, dst),
            ActiveDaemon::Babel => parse_babel_route(&self.babel_dump()?, dst),
        }
    }

    /// Ordered hop path from this node to `dst`.
    ///
    /// A single-hop route yields the destination alone. For longer routes the
    /// path is approximated as gateway followed by destination; the OLSR
    /// topology table, when reachable, contributes the final edge's link
    /// qualities.
    pub fn path_hops(&self, dst: Ipv4Addr, max_hops: usize) -> Vec<Neighbour> {
        let Some(route) = self.route(dst) else {
            self.log
                .debug("ROUTING", &format!("no route for path analysis to {}", dst));
            return Vec::new();
        };

        let dst_entry = |etx: f64, lq: f64, nlq: f64| Neighbour {
            ip: dst,
            node: dst.to_string(),
            interface: "unknown".to_string(),
            lq,
            nlq,
            etx,
        };

        if route.hop_count <= 1 {
            return vec![dst_entry(route.etx, 0.0, 0.0)];
        }

        let mut hops = Vec::new();
        if let Some(gw) = route.next_hop_ip {
            if gw != dst {
                hops.push(Neighbour {
                    ip: gw,
                    node: gw.to_string(),
                    interface: "unknown".to_string(),
                    lq: 0.0,
                    nlq: 0.0,
                    etx: 0.0,
                });
            }
        }

        // Enrich the final edge from the topology table when available.
        let (lq, nlq) = match self.daemon {
            ActiveDaemon::Olsr => self
                .olsr_query("/topology")
                .and_then(|body| {
                    topology_edge(&body, route.next_hop_ip.unwrap_or(dst), dst)
                })
                .unwrap_or((0.0, 0.0)),
            ActiveDaemon::Babel => (0.0, 0.0),
        };
        hops.push(dst_entry(route.etx, lq, nlq));

        hops.truncate(max_hops);
        hops
    }

    fn olsr_query(&self, endpoint: &str) -> Option<String> {
        if let Some(cached) = self.cached(endpoint) {
            return Some(cached);
        }
        match http_client::http_get(&self.paths.olsr_host, self.paths.olsr_port, endpoint) {
            Ok(body) => {
                self.store(endpoint, &body);
                Some(body)
            }
            Err(e) => {
                self.log
                    .debug("ROUTING", &format!("OLSR query {} failed: {}", endpoint, e));
                None
            }
        }
    }

    fn babel_dump(&self) -> Option<String> {
        if let Some(cached) = self.cached("dump") {
            return Some(cached);
        }
        match babel_control_command(&self.paths.babel_socket, "dump\n") {
            Ok(dump) => {
                self.store("dump", &dump);
                Some(dump)
            }
            Err(e) => {
                self.log
                    .debug("ROUTING", &format!("Babel dump failed: {}", e));
                None
            }
        }
    }

    fn cached(&self, key: &str) -> Option<String> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let cache = self.cache.lock().expect("routing cache lock");
        cache
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, body)| body.clone())
    }

    fn store(&self, key: &str, body: &str) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let mut cache = self.cache.lock().expect("routing cache lock");
        cache.insert(key.to_string(), (Instant::now(), body.to_string()));
    }
}

fn babel_control_command(socket: &std::path::Path, command: &str) -> Result<String, MonitorError> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|e| MonitorError::Socket(format!("babel control socket: {}", e)))?;
    stream.set_read_timeout(Some(CONTROL_TIMEOUT)).ok();
    stream
        .write_all(command.as_bytes())
        .map_err(|e| MonitorError::Socket(format!("babel command send: {}", e)))?;

    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                // The dump terminates with "ok" or "done" on its own line.
                if out.len() > BABEL_MAX_DUMP || dump_complete(&out) {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn dump_complete(buf: &[u8]) -> bool {
    let tail = &buf[buf.len().saturating_sub(8)..];
    let tail = String::from_utf8_lossy(tail);
    tail.contains("ok\n") || tail.contains("done\n")
}

/// Pull the neighbours array out of a jsoninfo `/neighbors` document.
pub fn parse_olsr_neighbours(json: &str) -> Vec<Neighbour> {
    let Ok(doc) = serde_json::from_str::<Value>(json) else {
        return Vec::new();
    };
    let Some(entries) = doc.get("neighbors").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut neighbours = Vec::new();
    for entry in entries {
        let ip_text = entry
            .get("ipAddress")
            .or_else(|| entry.get("neighborIP"))
            .and_then(Value::as_str);
        let Some(ip) = ip_text.and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
            continue;
        };

        let node = entry
            .get("hostname")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| ip.to_string());

        neighbours.push(Neighbour {
            ip,
            node,
            interface: "unknown".to_string(),
            lq: entry.get("linkQuality").and_then(Value::as_f64).unwrap_or(0.0),
            nlq: entry
                .get("neighborLinkQuality")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            etx: 0.0,
        });
    }
    neighbours
}

/// Find the `/routes` entry for `dst` (with or without a `/32` suffix).
pub fn parse_olsr_route(json: &str, dst: Ipv4Addr) -> Option<RouteInfo> {
    let doc = serde_json::from_str::<Value>(json).ok()?;
    let entries = doc.get("routes").and_then(Value::as_array)?;

    let dst_text = dst.to_string();
    let dst_host = format!("{}/32", dst_text);

    for entry in entries {
        let Some(destination) = entry.get("destination").and_then(Value::as_str) else {
            continue;
        };
        let genmask = entry.get("genmask").and_then(Value::as_u64);
        let matches = destination == dst_text
            || destination == dst_host
            || (destination.starts_with(&dst_text) && genmask == Some(32));
        if !matches {
            continue;
        }

        let next_hop_ip = entry
            .get("gateway")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Ipv4Addr>().ok());
        let etx = entry.get("metric").and_then(Value::as_f64).unwrap_or(0.0);
        let hop_count = entry
            .get("hops")
            .and_then(Value::as_u64)
            .map(|h| h as u32)
            // Without a hop field, a gateway equal to the destination is one hop.
            .unwrap_or_else(|| if next_hop_ip == Some(dst) { 1 } else { 2 });

        return Some(RouteInfo {
            dst_ip: dst,
            next_hop_ip,
            hop_count,
            etx,
        });
    }
    None
}

/// Link qualities of the topology edge `last_hop -> dst`, if present.
fn topology_edge(json: &str, last_hop: Ipv4Addr, dst: Ipv4Addr) -> Option<(f64, f64)> {
    let doc = serde_json::from_str::<Value>(json).ok()?;
    let entries = doc.get("topology").and_then(Value::as_array)?;

    let last_text = last_hop.to_string();
    let dst_text = dst.to_string();
    for entry in entries {
        let (Some(from), Some(to)) = (
            entry.get("lastHopIP").and_then(Value::as_str),
            entry.get("destinationIP").and_then(Value::as_str),
        ) else {
            continue;
        };
        if from == last_text && to == dst_text {
            let lq = entry.get("linkQuality").and_then(Value::as_f64).unwrap_or(0.0);
            let nlq = entry
                .get("neighborLinkQuality")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            return Some((lq, nlq));
        }
    }
    None
}

/// Parse `neighbour ...` lines out of a Babel dump.
///
/// Line shape: `neighbour <id> address <ip> if <interface> reach <r>
/// rxcost <cost> txcost <cost>`. Babel costs are 256 per unit, so ETX is
/// rxcost divided by 256.
pub fn parse_babel_neighbours(dump: &str) -> Vec<Neighbour> {
    let mut neighbours = Vec::new();
    for line in dump.lines() {
        if !line.starts_with("neighbour ") {
            continue;
        }
        let Some(ip) = babel_field(line, "address").and_then(|s| s.parse::<Ipv4Addr>().ok())
        else {
            continue;
        };
        let interface = babel_field(line, "if").unwrap_or("unknown").to_string();
        let etx = babel_field(line, "rxcost")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|cost| cost / 256.0)
            .unwrap_or(0.0);

        neighbours.push(Neighbour {
            ip,
            node: ip.to_string(),
            interface,
            lq: 0.0,
            nlq: 0.0,
            etx,
        });
    }
    neighbours
}

/// Find the `route ...` line covering `dst` in a Babel dump.
pub fn parse_babel_route(dump: &str, dst: Ipv4Addr) -> Option<RouteInfo> {
    let dst_text = dst.to_string();
    for line in dump.lines() {
        if !line.starts_with("route ") {
            continue;
        }
        let prefix = line.split_whitespace().nth(1)?;
        let matches = prefix == dst_text
            || prefix == format!("{}/32", dst_text)
            || prefix
                .split_once('/')
                .map(|(p, _)| p == dst_text)
                .unwrap_or(false);
        if !matches {
            continue;
        }

        let next_hop_ip = babel_field(line, "via").and_then(|s| s.parse::<Ipv4Addr>().ok());
        let metric = babel_field(line, "metric")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        return Some(RouteInfo {
            dst_ip: dst,
            next_hop_ip,
            // Babel metric is roughly 256 per hop.
            hop_count: (metric + 128) / 256,
            etx: f64::from(metric) / 256.0,
        });
    }
    None
}

fn babel_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == key {
            return words.next();
        }
    }
    None
}
