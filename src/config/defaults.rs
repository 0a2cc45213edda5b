//! Fixed limits and well-known paths.

/// UDP probes outstanding at once, across all targets.
pub const MAX_PENDING_PROBES: usize = 100;

/// Slots in the probe result history ring.
pub const PROBE_HISTORY_SIZE: usize = 20;

/// Longest hop path recorded per probe result.
pub const MAX_HOPS: usize = 10;

/// Discovery cache capacity; additions beyond this are rejected.
pub const MAX_DISCOVERED_AGENTS: usize = 100;

/// Seconds between periodic discovery scans.
pub const DISCOVERY_SCAN_INTERVAL_S: u64 = 3600;

/// Floor between on-demand discovery scans triggered by an empty cache.
pub const DISCOVERY_RESCAN_FLOOR_S: u64 = 60;

/// Entries parsed out of the sysinfo hosts array at most.
pub const SYSINFO_PARSE_LIMIT: usize = 500;

/// Crash reports retained in the history and the published JSON.
pub const MAX_CRASH_HISTORY: usize = 5;

/// Seconds without a heartbeat before a thread counts as unresponsive.
pub const THREAD_TIMEOUT_SECONDS: u64 = 30;

/// SIP responses queued for the quality monitor before the oldest is dropped.
pub const RESPONSE_QUEUE_SLOTS: usize = 10;

/// Phone quality records retained.
pub const MAX_QUALITY_RECORDS: usize = 100;

pub const AGENT_CACHE_FILE: &str = "/tmp/aredn_agent_cache.txt";
pub const NETWORK_JSON_FILE: &str = "/tmp/meshmon_network.json";
pub const HEALTH_JSON_FILE: &str = "/tmp/meshmon_health.json";
pub const CRASHES_JSON_FILE: &str = "/tmp/meshmon_crashes.json";
pub const CRASH_SPOOL_FILE: &str = "/tmp/meshmon_crash.spool";
pub const PHONE_QUALITY_JSON_FILE: &str = "/tmp/phone_quality.json";
pub const LOG_FILE: &str = "/tmp/meshmon.log";

pub const OLSR_PID_FILE: &str = "/var/run/olsrd.pid";
pub const BABEL_PID_FILE: &str = "/var/run/babeld.pid";
pub const BABEL_SOCKET_PATH: &str = "/var/run/babeld.sock";
pub const OLSR_JSONINFO_HOST: &str = "127.0.0.1";
pub const OLSR_JSONINFO_PORT: u16 = 9090;

pub const SYSINFO_HOST: &str = "localnode.local.mesh";
pub const SYSINFO_PORT: u16 = 8080;
pub const SYSINFO_PATH: &str = "/cgi-bin/sysinfo.json?hosts=1";
pub const HELLO_PORT: u16 = 8080;
pub const HELLO_PATH: &str = "/cgi-bin/hello";

/// Default DNS suffix for mesh node names.
pub const MESH_DOMAIN: &str = "local.mesh";

pub const SIP_PORT: u16 = 5060;
