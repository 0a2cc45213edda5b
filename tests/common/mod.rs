//! Shared fixtures for the integration tests.

use meshmon::config::MonitorConfig;
use meshmon::core::logger::{LogLevel, Logger};
use std::path::Path;
use std::sync::Arc;

/// Logger writing into a temp dir so tests never touch real log files.
pub fn test_logger(dir: &Path) -> Arc<Logger> {
    Arc::new(Logger::new(dir.join("meshmon-test.log"), LogLevel::Error))
}

/// Monitor config suitable for loopback tests: ephemeral probe port, no
/// DSCP (needs no privilege), tight windows.
pub fn loopback_config() -> MonitorConfig {
    MonitorConfig {
        enabled: true,
        probe_port: 0,
        dscp_ef: false,
        probe_window_s: 1,
        ..MonitorConfig::default()
    }
}
