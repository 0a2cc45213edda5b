//! Crash signal capture.
//!
//! A signal handler in a multi-threaded process may only touch
//! async-signal-safe primitives, so the handler here does three things:
//! format a fixed-shape record on the stack, `write(2)` it to a spool fd
//! opened ahead of time, and re-raise the signal with the default
//! disposition restored. The spool is folded into the JSON crash history at
//! the next start, where allocation and serde are safe again.

use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Signals that indicate a crash rather than an orderly shutdown.
pub const CRASH_SIGNALS: [i32; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGABRT];

static SPOOL_FD: AtomicI32 = AtomicI32::new(-1);
static PROCESS_START_EPOCH: AtomicI64 = AtomicI64::new(0);

/// A record recovered from the crash spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolRecord {
    pub signal: i32,
    pub crash_epoch: i64,
    pub uptime_seconds: i64,
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        libc::SIGILL => "SIGILL",
        _ => "UNKNOWN",
    }
}

/// Open the spool file and install handlers for the crash signals.
pub fn install_handlers(spool_path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(spool_path)?;
    // The fd stays open for the life of the process; the handler owns it.
    SPOOL_FD.store(file.into_raw_fd(), Ordering::SeqCst);
    PROCESS_START_EPOCH.store(unsafe { libc::time(std::ptr::null_mut()) }, Ordering::SeqCst);

    for &signal in &CRASH_SIGNALS {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = crash_handler as usize;
            action.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// The handler itself. Nothing here may allocate or lock.
extern "C" fn crash_handler(signal: libc::c_int) {
    let fd = SPOOL_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let now = unsafe { libc::time(std::ptr::null_mut()) };
        let uptime = now - PROCESS_START_EPOCH.load(Ordering::SeqCst);

        let mut buf = [0u8; 96];
        let mut pos = 0;
        pos = put(&mut buf, pos, b"sig ");
        pos = put_i64(&mut buf, pos, i64::from(signal));
        pos = put(&mut buf, pos, b" epoch ");
        pos = put_i64(&mut buf, pos, now);
        pos = put(&mut buf, pos, b" uptime ");
        pos = put_i64(&mut buf, pos, uptime.max(0));
        pos = put(&mut buf, pos, b"\n");

        unsafe {
            libc::write(fd, buf.as_ptr().cast(), pos);
        }
    }

    // SA_RESETHAND already restored the default disposition.
    unsafe {
        libc::raise(signal);
    }
}

fn put(buf: &mut [u8], pos: usize, bytes: &[u8]) -> usize {
    let n = bytes.len().min(buf.len() - pos);
    buf[pos..pos + n].copy_from_slice(&bytes[..n]);
    pos + n
}

/// Decimal formatting without allocation, for use inside the handler.
fn put_i64(buf: &mut [u8], pos: usize, value: i64) -> usize {
    if value < 0 {
        let pos = put(buf, pos, b"-");
        return put_u64(buf, pos, value.unsigned_abs());
    }
    put_u64(buf, pos, value as u64)
}

fn put_u64(buf: &mut [u8], mut pos: usize, mut value: u64) -> usize {
    let mut digits = [0u8; 20];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    while n > 0 && pos < buf.len() {
        n -= 1;
        buf[pos] = digits[n];
        pos += 1;
    }
    pos
}

/// Read and clear the spool left behind by a previous run.
pub fn drain_spool(spool_path: &Path) -> Vec<SpoolRecord> {
    let Ok(content) = std::fs::read_to_string(spool_path) else {
        return Vec::new();
    };
    let records: Vec<SpoolRecord> = content.lines().filter_map(parse_spool_line).collect();
    if !records.is_empty() {
        let _ = std::fs::write(spool_path, b"");
    }
    records
}

fn parse_spool_line(line: &str) -> Option<SpoolRecord> {
    let mut words = line.split_whitespace();
    let mut signal = None;
    let mut epoch = None;
    let mut uptime = None;
    while let Some(key) = words.next() {
        let value = words.next()?;
        match key {
            "sig" => signal = value.parse().ok(),
            "epoch" => epoch = value.parse().ok(),
            "uptime" => uptime = value.parse().ok(),
            _ => {}
        }
    }
    Some(SpoolRecord {
        signal: signal?,
        crash_epoch: epoch?,
        uptime_seconds: uptime.unwrap_or(0),
    })
}
