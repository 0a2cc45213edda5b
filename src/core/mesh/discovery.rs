//! Agent discovery: find mesh peers that run this agent.
//!
//! The scan walks the firmware's sysinfo host list, filters out phones and
//! interface aliases, and confirms each remaining candidate with a DNS lookup
//! followed by a hit on its hello endpoint. Confirmed peers land in a bounded
//! cache that persists across restarts as a small CSV file.

use crate::config::defaults::{
    HELLO_PATH, HELLO_PORT, MAX_DISCOVERED_AGENTS, SYSINFO_PARSE_LIMIT,
};
use crate::core::logger::Logger;
use crate::core::mesh::http_client;
use crate::core::mesh::probe_engine::resolve_mesh_host;
use crate::core::mesh::types::DiscoveredAgent;
use regex::Regex;
use serde_json::Value;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where the sysinfo host list is fetched from.
#[derive(Debug, Clone)]
pub struct SysinfoEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for SysinfoEndpoint {
    fn default() -> Self {
        Self {
            host: crate::config::defaults::SYSINFO_HOST.to_string(),
            port: crate::config::defaults::SYSINFO_PORT,
            path: crate::config::defaults::SYSINFO_PATH.to_string(),
        }
    }
}

pub struct AgentDiscovery {
    cache: Mutex<Vec<DiscoveredAgent>>,
    cache_path: PathBuf,
    sysinfo: SysinfoEndpoint,
    mesh_domain: String,
    local_node: String,
    ip_token: Regex,
    log: Arc<Logger>,
}

impl AgentDiscovery {
    pub fn new(
        cache_path: PathBuf,
        sysinfo: SysinfoEndpoint,
        mesh_domain: String,
        local_node: String,
        log: Arc<Logger>,
    ) -> Self {
        let discovery = Self {
            cache: Mutex::new(Vec::new()),
            cache_path,
            sysinfo,
            mesh_domain,
            local_node,
            ip_token: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b")
                .expect("static regex"),
            log,
        };
        discovery.load_cache();
        discovery
    }

    /// Copy out at most `max` cached agents, in cache order.
    pub fn agents(&self, max: usize) -> Vec<DiscoveredAgent> {
        let cache = self.cache.lock().expect("discovery lock");
        cache.iter().take(max).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("discovery lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one discovery scan. Returns the number of agents confirmed during
    /// this pass. A missing sysinfo endpoint is a soft failure worth a
    /// warning only, since older firmware does not expose it.
    pub fn scan(&self) -> usize {
        let body = match http_client::http_get(
            &self.sysinfo.host,
            self.sysinfo.port,
            &self.sysinfo.path,
        ) {
            Ok(body) => body,
            Err(e) => {
                self.log.warn(
                    "AGENT_DISCOVERY",
                    &format!("sysinfo endpoint unavailable: {}", e),
                );
                return 0;
            }
        };

        let hosts = parse_sysinfo_hosts(&body, SYSINFO_PARSE_LIMIT);
        self.log.debug(
            "AGENT_DISCOVERY",
            &format!("sysinfo returned {} host entries", hosts.len()),
        );

        let mut confirmed = 0;
        for (name, _listed_ip) in hosts {
            if !candidate_node_name(&name, &self.local_node) {
                continue;
            }

            // DNS doubles as the reachability test.
            let Ok(mesh_ip) = resolve_mesh_host(&name, &self.mesh_domain) else {
                continue;
            };

            let Some(lan_ip) = self.hello(&name, mesh_ip) else {
                continue;
            };

            if self.upsert(mesh_ip, lan_ip, &name) {
                confirmed += 1;
            }
        }

        if confirmed > 0 {
            self.save_cache();
        }
        self.log.info(
            "AGENT_DISCOVERY",
            &format!("discovery scan complete, {} agents confirmed", confirmed),
        );
        confirmed
    }

    /// Hit the peer's hello endpoint. The body carries the peer's LAN address
    /// as ASCII; when it does not, the mesh address stands in.
    fn hello(&self, name: &str, mesh_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let host = format!("{}.{}", name, self.mesh_domain);
        let body = http_client::http_get(&host, HELLO_PORT, HELLO_PATH).ok()?;

        let lan_ip = self
            .ip_token
            .find(&body)
            .and_then(|m| m.as_str().parse::<Ipv4Addr>().ok())
            .unwrap_or(mesh_ip);
        Some(lan_ip)
    }

    /// Insert or refresh a cache entry keyed by mesh address. Additions past
    /// the cache bound are rejected. Returns whether the entry was recorded.
    fn upsert(&self, mesh_ip: Ipv4Addr, lan_ip: Ipv4Addr, node: &str) -> bool {
        let now = epoch_secs();
        let mut cache = self.cache.lock().expect("discovery lock");

        if let Some(entry) = cache.iter_mut().find(|a| a.mesh_ip == mesh_ip) {
            entry.lan_ip = lan_ip;
            entry.node = node.to_string();
            entry.last_seen = now;
            entry.is_active = true;
            return true;
        }

        if cache.len() >= MAX_DISCOVERED_AGENTS {
            self.log.warn(
                "AGENT_DISCOVERY",
                &format!("agent cache full, dropping {}", node),
            );
            return false;
        }

        cache.push(DiscoveredAgent {
            mesh_ip,
            lan_ip,
            node: node.to_string(),
            last_seen: now,
            is_active: true,
        });
        true
    }

    /// Load the CSV cache. Rows are `mesh_ip,lan_ip,node,last_seen_epoch`;
    /// the legacy three-field form `mesh_ip,node,last_seen_epoch` is still
    /// accepted, with the LAN address defaulting to the mesh address.
    pub fn load_cache(&self) {
        let Ok(content) = std::fs::read_to_string(&self.cache_path) else {
            return;
        };

        let mut cache = self.cache.lock().expect("discovery lock");
        cache.clear();
        for line in content.lines() {
            let Some(agent) = parse_cache_line(line) else {
                continue;
            };
            if cache.len() >= MAX_DISCOVERED_AGENTS {
                break;
            }
            cache.push(agent);
        }
        self.log.info(
            "AGENT_DISCOVERY",
            &format!("loaded {} cached agents", cache.len()),
        );
    }

    /// Persist the cache in the four-field CSV form.
    pub fn save_cache(&self) {
        let rows: Vec<String> = {
            let cache = self.cache.lock().expect("discovery lock");
            cache
                .iter()
                .map(|a| format!("{},{},{},{}", a.mesh_ip, a.lan_ip, a.node, a.last_seen))
                .collect()
        };

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&self.cache_path)?;
            for row in &rows {
                writeln!(file, "{}", row)?;
            }
            Ok(())
        };
        if let Err(e) = write() {
            self.log.error(
                "AGENT_DISCOVERY",
                &format!("failed to save agent cache: {}", e),
            );
        }
    }
}

/// Whether a sysinfo host name can be another agent node. Numeric-only names
/// are phones, `lan.` prefixes are interface aliases, and our own name is not
/// a peer.
pub fn candidate_node_name(name: &str, local_node: &str) -> bool {
    if name.is_empty() || name.eq_ignore_ascii_case(local_node) {
        return false;
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if name.to_ascii_lowercase().starts_with("lan.") {
        return false;
    }
    true
}

/// Pull `(name, ip)` pairs out of the sysinfo `hosts` array.
pub fn parse_sysinfo_hosts(json: &str, limit: usize) -> Vec<(String, Option<Ipv4Addr>)> {
    let Ok(doc) = serde_json::from_str::<Value>(json) else {
        return Vec::new();
    };
    let Some(hosts) = doc.get("hosts").and_then(Value::as_array) else {
        return Vec::new();
    };

    hosts
        .iter()
        .take(limit)
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let ip = entry
                .get("ip")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Ipv4Addr>().ok());
            Some((name.to_string(), ip))
        })
        .collect()
}

/// Parse one cache CSV row in either the four- or the legacy three-field
/// format.
pub fn parse_cache_line(line: &str) -> Option<DiscoveredAgent> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    let (mesh_ip, lan_ip, node, last_seen) = match fields.as_slice() {
        [mesh, lan, node, seen] => {
            let mesh_ip = mesh.parse::<Ipv4Addr>().ok()?;
            let lan_ip = lan.parse::<Ipv4Addr>().ok()?;
            (mesh_ip, lan_ip, node, seen)
        }
        [mesh, node, seen] => {
            let mesh_ip = mesh.parse::<Ipv4Addr>().ok()?;
            (mesh_ip, mesh_ip, node, seen)
        }
        _ => return None,
    };

    Some(DiscoveredAgent {
        mesh_ip,
        lan_ip,
        node: node.to_string(),
        last_seen: last_seen.parse::<i64>().ok()?,
        is_active: false,
    })
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
