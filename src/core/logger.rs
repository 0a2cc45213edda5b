//! Structured JSONL logging with size-based rotation.
//!
//! One `Logger` is constructed at boot and handed to every component as an
//! `Arc`. Each line is a self-contained JSON object so collectors can tail
//! the file without a parser state machine.
//!
//! Rotation works like logrotate's copytruncate with numbered slots: when
//! the live file passes the size limit it is gzipped into `<log>.1.gz` and
//! truncated in place, with older archives shifted up one slot and the
//! oldest dropped. An advisory lock on the live file keeps two processes
//! from rotating at the same time; appends never wait on it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use chrono::Local;
use flate2::{write::GzEncoder, Compression};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Rotate once the live log reaches this size.
const ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Archives kept as `<log>.1.gz` (newest) through `<log>.N.gz` (oldest).
const ARCHIVE_SLOTS: u32 = 5;

/// Log verbosity, ordered from most to least chatty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug = 0,
    #[default]
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Serialize, Debug)]
struct LogEntry<'a> {
    timestamp: String,
    level: &'a str,
    component: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    fields: HashMap<&'a str, serde_json::Value>,
}

/// Component-tagged rotating logger.
pub struct Logger {
    log_path: PathBuf,
    min_level: AtomicU8,
    /// Running estimate of the live file's size; seeded from disk at boot
    /// and re-read after every rotation attempt.
    live_bytes: AtomicU64,
    rotate_bytes: u64,
}

impl Logger {
    pub fn new(log_path: PathBuf, min_level: LogLevel) -> Self {
        Self::with_rotate_bytes(log_path, min_level, ROTATE_BYTES)
    }

    /// Constructor with an explicit rotation threshold, for tests.
    pub fn with_rotate_bytes(log_path: PathBuf, min_level: LogLevel, rotate_bytes: u64) -> Self {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let on_disk = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
        Self {
            log_path,
            min_level: AtomicU8::new(min_level as u8),
            live_bytes: AtomicU64::new(on_disk),
            rotate_bytes,
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, message, HashMap::new());
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, message, HashMap::new());
    }

    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, message, HashMap::new());
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, message, HashMap::new());
    }

    /// Log with extra structured fields.
    pub fn log(
        &self,
        level: LogLevel,
        component: &str,
        message: &str,
        fields: HashMap<&str, serde_json::Value>,
    ) {
        if (level as u8) < self.min_level.load(Ordering::Relaxed) {
            return;
        }

        let entry = LogEntry {
            timestamp: Local::now().to_rfc3339(),
            level: level.tag(),
            component,
            message,
            fields,
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            // Logging failures must never take the agent down.
            let _ = self.append_line(&line);
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        drop(file);

        let written = line.len() as u64 + 1;
        let total = self.live_bytes.fetch_add(written, Ordering::Relaxed) + written;
        if total >= self.rotate_bytes {
            let _ = self.rotate();
            // Whatever happened, trust the file over the estimate.
            let on_disk = std::fs::metadata(&self.log_path)
                .map(|m| m.len())
                .unwrap_or(0);
            self.live_bytes.store(on_disk, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Archive the live file into slot 1 and truncate it in place.
    fn rotate(&self) -> std::io::Result<()> {
        let live = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.log_path)?;

        // Whoever holds the lock rotates; everyone else moves on and lets
        // the size re-check after this call settle things.
        if live.try_lock_exclusive().is_err() {
            return Ok(());
        }
        let result = self.rotate_locked(&live);
        let _ = FileExt::unlock(&live);
        result
    }

    fn rotate_locked(&self, live: &File) -> std::io::Result<()> {
        // The file may already be fresh if another process rotated while we
        // were acquiring the lock.
        if live.metadata()?.len() < self.rotate_bytes {
            return Ok(());
        }

        // Oldest slot falls off the end, the rest shuffle up by one.
        let _ = std::fs::remove_file(self.archive_slot(ARCHIVE_SLOTS));
        for slot in (1..ARCHIVE_SLOTS).rev() {
            let _ = std::fs::rename(self.archive_slot(slot), self.archive_slot(slot + 1));
        }

        let mut gz = GzEncoder::new(File::create(self.archive_slot(1))?, Compression::default());
        std::io::copy(&mut BufReader::new(live), &mut gz)?;
        gz.finish()?;

        live.set_len(0)
    }

    fn archive_slot(&self, slot: u32) -> PathBuf {
        let mut os = self.log_path.as_os_str().to_os_string();
        os.push(format!(".{}.gz", slot));
        PathBuf::from(os)
    }
}
