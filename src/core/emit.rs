//! `meshmon.v1` document publishing.
//!
//! Every published file is written in full to `<path>.tmp` and renamed over
//! the destination, so readers either see the previous document or a
//! complete new one, never a torn write. The envelope fields (`schema`,
//! `type`, `node`, `sent_at`) are shared by all document types.

use crate::core::logger::Logger;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::path::Path;

pub const SCHEMA: &str = "meshmon.v1";

/// Current time as ISO-8601 UTC, second precision.
pub fn iso8601_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Unix epoch seconds as ISO-8601 UTC.
pub fn iso8601_from_epoch(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0) {
        chrono::LocalResult::Single(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        _ => String::from("1970-01-01T00:00:00Z"),
    }
}

/// Local hostname, `unknown` when unavailable.
pub fn node_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Serialize `doc` and publish it atomically at `path`.
pub fn publish_json<T: Serialize>(path: &Path, doc: &T, log: &Logger) -> std::io::Result<()> {
    let body = serde_json::to_string_pretty(doc)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, body.as_bytes())?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        log.error(
            "EMIT",
            &format!("failed to rename {} into place: {}", tmp_path.display(), e),
        );
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}
