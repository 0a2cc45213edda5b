//! UDP echo probe engine and responder.
//!
//! The engine holds two sockets. The *sender* is bound to an ephemeral port
//! and carries outbound probe bursts plus their echoes; the *responder* is
//! bound to the well-known probe port and only echoes peer probes back.
//! Keeping them apart means outbound traffic can never collide with the
//! well-known port while echoes still arrive on a predictable socket.
//!
//! A probe datagram embeds an explicit return address and port chosen by the
//! sender. The responder replies to that embedded address, not to the source
//! of the IP header, so probes survive asymmetric routing and NAT between
//! tunnel endpoints.

use crate::config::defaults::MAX_PENDING_PROBES;
use crate::config::MonitorConfig;
use crate::core::emit;
use crate::core::logger::Logger;
use crate::core::mesh::types::MonitorError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wire size of a probe packet; anything shorter is dropped.
pub const PROBE_PACKET_LEN: usize = 94;

/// RTT samples at or beyond this are clock skew or spoofs, not measurements.
const RTT_SANITY_MS: f64 = 10_000.0;

/// Per-poll wait while collecting echoes.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Upper bound on echo collection polls per window.
const RECV_MAX_ATTEMPTS: u32 = 50;

/// DSCP Expedited Forwarding, shifted into the TOS byte.
const TOS_DSCP_EF: u32 = 0xB8;

/// Fixed-layout probe datagram, all multi-byte fields big-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbePacket {
    pub sequence: u32,
    pub sent_sec: u32,
    pub sent_usec: u32,
    /// Sender's node label, at most 63 bytes on the wire.
    pub src_node: String,
    /// Where the echo must be sent, regardless of the IP header source.
    pub return_addr: Ipv4Addr,
    pub return_port: u16,
}

impl ProbePacket {
    pub fn encode(&self) -> [u8; PROBE_PACKET_LEN] {
        let mut buf = [0u8; PROBE_PACKET_LEN];
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sent_sec.to_be_bytes());
        buf[8..12].copy_from_slice(&self.sent_usec.to_be_bytes());

        let node = self.src_node.as_bytes();
        let n = node.len().min(63);
        buf[12..12 + n].copy_from_slice(&node[..n]);

        let addr = self.return_addr.to_string();
        let a = addr.as_bytes();
        buf[76..76 + a.len()].copy_from_slice(a);

        buf[92..94].copy_from_slice(&self.return_port.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PROBE_PACKET_LEN {
            return None;
        }
        let sequence = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        let sent_sec = u32::from_be_bytes(buf[4..8].try_into().ok()?);
        let sent_usec = u32::from_be_bytes(buf[8..12].try_into().ok()?);
        let src_node = nul_str(&buf[12..76]);
        let return_addr = nul_str(&buf[76..92]).parse::<Ipv4Addr>().ok()?;
        let return_port = u16::from_be_bytes(buf[92..94].try_into().ok()?);
        Some(Self {
            sequence,
            sent_sec,
            sent_usec,
            src_node,
            return_addr,
            return_port,
        })
    }
}

fn nul_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A probe that was emitted and is awaiting its echo.
#[derive(Debug, Clone)]
struct PendingProbe {
    sequence: u32,
    dst: Ipv4Addr,
}

/// Metrics for one completed probe window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeWindow {
    pub sent: usize,
    pub received: usize,
    pub rtt_ms_avg: f64,
    pub rtt_ms_min: f64,
    pub rtt_ms_max: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

pub struct ProbeEngine {
    sender: UdpSocket,
    responder: UdpSocket,
    /// Port peers listen on; equal to the responder's bound port.
    probe_port: u16,
    mesh_domain: String,
    local_node: String,
    pending: Mutex<Vec<PendingProbe>>,
    short_datagrams: AtomicU64,
    running: AtomicBool,
    log: Arc<Logger>,
}

impl ProbeEngine {
    /// Acquire both sockets and capture the local hostname. Fails when either
    /// bind fails.
    pub fn new(config: &MonitorConfig, log: Arc<Logger>) -> Result<Self, MonitorError> {
        let sender = bind_probe_socket(0, config.dscp_ef, &log)?;
        sender
            .set_read_timeout(Some(RECV_POLL))
            .map_err(|e| MonitorError::Socket(format!("sender timeout: {}", e)))?;

        let responder = bind_probe_socket(config.probe_port, config.dscp_ef, &log)?;
        responder
            .set_nonblocking(true)
            .map_err(|e| MonitorError::Socket(format!("responder nonblocking: {}", e)))?;

        // Read the port back so a port-0 test bind still targets itself.
        let probe_port = responder
            .local_addr()
            .map_err(|e| MonitorError::Socket(e.to_string()))?
            .port();

        let local_node = emit::node_name();
        log.info(
            "PROBE_ENGINE",
            &format!("probe engine initialized (port={})", probe_port),
        );

        Ok(Self {
            sender,
            responder,
            probe_port,
            mesh_domain: config.mesh_domain.clone(),
            local_node,
            pending: Mutex::new(Vec::new()),
            short_datagrams: AtomicU64::new(0),
            running: AtomicBool::new(true),
            log,
        })
    }

    /// Unblock the responder loop and stop accepting work.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.log.info("PROBE_ENGINE", "probe engine shutdown");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Port the responder listens on.
    pub fn probe_port(&self) -> u16 {
        self.probe_port
    }

    /// Outstanding probes across all targets.
    pub fn pending_depth(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Short or malformed datagrams dropped by the responder.
    pub fn short_datagram_count(&self) -> u64 {
        self.short_datagrams.load(Ordering::Relaxed)
    }

    /// Resolve a probe target: a literal IPv4 address passes through, a bare
    /// node label gets the mesh domain appended.
    pub fn resolve_target(&self, target: &str) -> Result<Ipv4Addr, MonitorError> {
        resolve_mesh_host(target, &self.mesh_domain)
    }

    /// Send `count` probes to `target`, spaced by `interval_ms`. Returns how
    /// many went out; individual send errors are logged and skipped.
    pub fn send_probes(
        &self,
        target: &str,
        count: u32,
        interval_ms: u64,
    ) -> Result<u32, MonitorError> {
        if !self.is_running() {
            return Err(MonitorError::NotRunning);
        }
        let dst = self.resolve_target(target)?;

        let return_addr = preferred_source(dst, self.probe_port).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let return_port = self
            .sender
            .local_addr()
            .map_err(|e| MonitorError::Socket(e.to_string()))?
            .port();

        let mut sent = 0u32;
        for sequence in 0..count {
            let (sec, usec) = epoch_now();
            let packet = ProbePacket {
                sequence,
                sent_sec: sec,
                sent_usec: usec,
                src_node: self.local_node.clone(),
                return_addr,
                return_port,
            };

            match self
                .sender
                .send_to(&packet.encode(), SocketAddrV4::new(dst, self.probe_port))
            {
                Ok(_) => {
                    let mut pending = self.pending.lock().expect("pending lock");
                    if pending.len() < MAX_PENDING_PROBES {
                        pending.push(PendingProbe { sequence, dst });
                    }
                    sent += 1;
                }
                Err(e) => {
                    self.log
                        .error("PROBE_ENGINE", &format!("failed to send probe to {}: {}", dst, e));
                }
            }

            if sequence + 1 < count && interval_ms > 0 {
                std::thread::sleep(Duration::from_millis(interval_ms));
            }
        }

        self.log
            .debug("PROBE_ENGINE", &format!("sent {} probes to {}", sent, dst));
        Ok(sent)
    }

    /// Collect echoes for the probes pending against `dst` and fold them into
    /// window metrics. All of the target's pending entries are cleared
    /// afterwards, matched or not.
    pub fn calculate_metrics(&self, dst: Ipv4Addr) -> ProbeWindow {
        let outstanding = {
            let pending = self.pending.lock().expect("pending lock");
            pending.iter().filter(|p| p.dst == dst).count()
        };

        if outstanding == 0 {
            return ProbeWindow {
                loss_pct: 100.0,
                ..ProbeWindow::default()
            };
        }

        let mut samples: Vec<f64> = Vec::with_capacity(outstanding);
        let mut buf = [0u8; 1024];

        for _ in 0..RECV_MAX_ATTEMPTS {
            if samples.len() >= outstanding {
                break;
            }
            let (len, _from) = match self.sender.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => break,
            };

            let Some(packet) = ProbePacket::decode(&buf[..len]) else {
                continue;
            };

            // Consume the matching pending entry, if this echo is ours.
            {
                let mut pending = self.pending.lock().expect("pending lock");
                let Some(idx) = pending
                    .iter()
                    .position(|p| p.dst == dst && p.sequence == packet.sequence)
                else {
                    continue;
                };
                pending.swap_remove(idx);
            }

            let (now_sec, now_usec) = epoch_now();
            let rtt_ms = (f64::from(now_sec) - f64::from(packet.sent_sec)) * 1000.0
                + (f64::from(now_usec) - f64::from(packet.sent_usec)) / 1000.0;
            if rtt_ms.abs() >= RTT_SANITY_MS {
                self.log.debug(
                    "PROBE_ENGINE",
                    &format!("discarding skewed RTT sample {:.1} ms from {}", rtt_ms, dst),
                );
                continue;
            }
            samples.push(rtt_ms.max(0.0));
        }

        // Window teardown: anything still pending for this target is lost.
        self.pending
            .lock()
            .expect("pending lock")
            .retain(|p| p.dst != dst);

        window_from_samples(outstanding, &samples)
    }

    /// Echo loop for the responder socket. Runs until `shutdown`.
    ///
    /// Any datagram at least one probe packet long is echoed back to the
    /// address embedded in its payload; shorter or unparseable datagrams are
    /// counted and dropped.
    pub fn run_responder(&self) {
        self.log.info("PROBE_ENGINE", "probe responder thread started");
        let mut buf = [0u8; 1024];

        while self.is_running() {
            match self.responder.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    if len < PROBE_PACKET_LEN {
                        self.short_datagrams.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let Some(packet) = ProbePacket::decode(&buf[..len]) else {
                        self.short_datagrams.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let reply_to = SocketAddrV4::new(packet.return_addr, packet.return_port);
                    if let Err(e) = self.responder.send_to(&buf[..len], reply_to) {
                        self.log
                            .error("PROBE_ENGINE", &format!("failed to echo probe: {}", e));
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    if self.is_running() {
                        self.log
                            .error("PROBE_ENGINE", &format!("responder recv error: {}", e));
                    }
                    break;
                }
            }
        }

        self.log.info("PROBE_ENGINE", "probe responder thread stopped");
    }
}

/// Fold received RTT samples into window metrics.
///
/// Loss is `1 - received/sent`. Jitter is the mean absolute difference of
/// consecutive RTT samples in arrival order, zero for a single sample.
pub fn window_from_samples(sent: usize, samples: &[f64]) -> ProbeWindow {
    let received = samples.len();
    let loss_pct = if sent == 0 {
        100.0
    } else {
        100.0 * (1.0 - received as f64 / sent as f64)
    };

    if received == 0 {
        return ProbeWindow {
            sent,
            received,
            loss_pct,
            ..ProbeWindow::default()
        };
    }

    let sum: f64 = samples.iter().sum();
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let jitter_ms = if received > 1 {
        let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        total / (received - 1) as f64
    } else {
        0.0
    };

    ProbeWindow {
        sent,
        received,
        rtt_ms_avg: sum / received as f64,
        rtt_ms_min: min,
        rtt_ms_max: max,
        jitter_ms,
        loss_pct,
    }
}

fn bind_probe_socket(port: u16, dscp_ef: bool, log: &Logger) -> Result<UdpSocket, MonitorError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| MonitorError::Socket(format!("socket create: {}", e)))?;
    socket.set_reuse_address(true).ok();
    if dscp_ef {
        if socket.set_tos(TOS_DSCP_EF).is_err() {
            log.warn("PROBE_ENGINE", "failed to set DSCP EF on probe socket");
        }
    }
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .map_err(|e| MonitorError::Socket(format!("bind port {}: {}", port, e)))?;
    Ok(socket.into())
}

/// Resolve `target` as a literal address or `<label>.<domain>` mesh name.
pub fn resolve_mesh_host(target: &str, domain: &str) -> Result<Ipv4Addr, MonitorError> {
    if let Ok(ip) = target.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let host = if target.ends_with(domain) {
        target.to_string()
    } else {
        format!("{}.{}", target, domain)
    };

    let addrs = (host.as_str(), 0u16)
        .to_socket_addrs()
        .map_err(|_| MonitorError::Dns(host.clone()))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(MonitorError::Dns(host))
}

/// Source address the kernel would pick toward `dst`, learned from a
/// throwaway connected UDP socket.
fn preferred_source(dst: Ipv4Addr, port: u16) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((dst, port.max(1))).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

fn epoch_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    (now.as_secs() as u32, now.subsec_micros())
}
