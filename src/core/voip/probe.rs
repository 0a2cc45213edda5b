//! The phone probes: OPTIONS timing and the full media probe.

use crate::core::logger::Logger;
use crate::core::voip::queue::ResponseQueue;
use crate::core::voip::rtp::{self, RtpStats};
use crate::core::voip::sip::{self, DialogIds};
use crate::core::voip::types::{VoipProbeConfig, VoipProbeResult, VoipProbeStatus};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::defaults::SIP_PORT;

/// How SIP requests leave the node and responses come back.
///
/// When the probe borrows the registrar's UDP/5060 socket it must not read
/// from it; the registrar's receive loop routes matching responses into a
/// queue instead. A standalone probe owns its socket and reads it directly.
pub trait SipTransport: Send + Sync {
    fn send(&self, dest: SocketAddrV4, data: &[u8]) -> std::io::Result<()>;
    /// Next incoming SIP message, waiting at most `timeout`.
    fn recv(&self, timeout: Duration) -> Option<Vec<u8>>;
    /// Address to advertise in Via/Contact/SDP toward `dest`.
    fn local_ip(&self, dest: Ipv4Addr) -> Ipv4Addr;
}

/// Transport borrowing the registrar's socket, receiving via the queue.
pub struct BorrowedSocketTransport {
    socket: Arc<UdpSocket>,
    queue: Arc<ResponseQueue>,
    server_ip: Ipv4Addr,
}

impl BorrowedSocketTransport {
    pub fn new(socket: Arc<UdpSocket>, queue: Arc<ResponseQueue>, server_ip: Ipv4Addr) -> Self {
        Self {
            socket,
            queue,
            server_ip,
        }
    }
}

impl SipTransport for BorrowedSocketTransport {
    fn send(&self, dest: SocketAddrV4, data: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(data, dest).map(|_| ())
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.queue.dequeue(timeout)
    }

    fn local_ip(&self, _dest: Ipv4Addr) -> Ipv4Addr {
        self.server_ip
    }
}

/// Transport owning a freshly bound socket.
pub struct OwnedSocketTransport {
    socket: UdpSocket,
}

impl OwnedSocketTransport {
    pub fn new() -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(Self { socket })
    }
}

impl SipTransport for OwnedSocketTransport {
    fn send(&self, dest: SocketAddrV4, data: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(data, dest).map(|_| ())
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.socket.set_read_timeout(Some(timeout)).ok()?;
        let mut buf = [0u8; 4096];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => Some(buf[..len].to_vec()),
            Err(_) => None,
        }
    }

    fn local_ip(&self, dest: Ipv4Addr) -> Ipv4Addr {
        route_source(dest).unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

/// OPTIONS reachability probe.
///
/// Sends one OPTIONS request and waits for a final response whose Via branch
/// matches ours. 2xx is success, 486 busy, any other final response a SIP
/// error, silence a timeout. SIP RTT is monotonic elapsed from send to the
/// first final response.
pub fn options_probe(
    transport: &dyn SipTransport,
    number: &str,
    phone_ip: Ipv4Addr,
    config: &VoipProbeConfig,
    log: &Logger,
) -> VoipProbeResult {
    let mut result = VoipProbeResult::failed(VoipProbeStatus::SipError, "not started");

    if config.icmp_probe {
        result.icmp_rtt_ms = icmp_rtt(phone_ip, Duration::from_secs(1))
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1);
    }

    let local_ip = transport.local_ip(phone_ip);
    let ids = DialogIds::generate(local_ip);
    let request = sip::build_options(number, phone_ip, local_ip, &ids);
    let dest = SocketAddrV4::new(phone_ip, SIP_PORT);

    let sent_at = Instant::now();
    if let Err(e) = transport.send(dest, request.as_bytes()) {
        result.reason = format!("failed to send OPTIONS: {}", e);
        return result;
    }

    let deadline = sent_at + Duration::from_millis(config.invite_timeout_ms);
    loop {
        let now = Instant::now();
        if now >= deadline {
            result.status = VoipProbeStatus::SipTimeout;
            result.reason = format!("no SIP response within {}ms", config.invite_timeout_ms);
            return result;
        }

        let Some(message) = transport.recv(deadline - now) else {
            continue;
        };
        let text = String::from_utf8_lossy(&message);
        if !sip::branch_matches(&text, &ids.branch) {
            log.debug("VOIP_PROBE", "ignoring response for a different branch");
            continue;
        }
        let Some(status) = sip::parse_status_code(&text) else {
            continue;
        };
        if status < 200 {
            continue;
        }

        result.sip_rtt_ms = sent_at.elapsed().as_millis() as i64;
        match status {
            200..=299 => {
                result.status = VoipProbeStatus::Success;
                result.reason = format!("phone answered OPTIONS with {}", status);
            }
            486 => {
                result.status = VoipProbeStatus::Busy;
                result.reason = "phone busy (486)".to_string();
            }
            other => {
                result.status = VoipProbeStatus::SipError;
                result.reason = format!("SIP error response {}", other);
            }
        }
        return result;
    }
}

/// Full media probe: INVITE, PCMU silence burst, RTP statistics, RTCP.
pub fn media_probe(
    transport: &dyn SipTransport,
    number: &str,
    phone_ip: Ipv4Addr,
    config: &VoipProbeConfig,
    log: &Logger,
) -> VoipProbeResult {
    let mut result = VoipProbeResult::failed(VoipProbeStatus::SipError, "not started");

    if config.icmp_probe {
        result.icmp_rtt_ms = icmp_rtt(phone_ip, Duration::from_secs(1))
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1);
    }

    // Media sockets on an even RTP port with RTCP right above it.
    let Some((rtp_sock, rtcp_sock, rtp_port)) = bind_media_ports() else {
        result.reason = "failed to bind RTP/RTCP sockets".to_string();
        return result;
    };

    let local_ip = transport.local_ip(phone_ip);
    let ids = DialogIds::generate(local_ip);
    let invite = sip::build_invite(number, phone_ip, local_ip, rtp_port, &ids);
    let dest = SocketAddrV4::new(phone_ip, SIP_PORT);

    let sent_at = Instant::now();
    if let Err(e) = transport.send(dest, invite.as_bytes()) {
        result.reason = format!("failed to send INVITE: {}", e);
        return result;
    }

    // Wait for the final response; 100/180 mean keep waiting.
    let deadline = sent_at + Duration::from_millis(config.invite_timeout_ms);
    let mut ringing = false;
    let answer = loop {
        let now = Instant::now();
        if now >= deadline {
            if ringing {
                result.status = VoipProbeStatus::NoAnswer;
                result.reason = "phone rang but no answer within timeout".to_string();
            } else {
                result.status = VoipProbeStatus::SipTimeout;
                result.reason = format!("no SIP response within {}ms", config.invite_timeout_ms);
            }
            return result;
        }

        let Some(message) = transport.recv(deadline - now) else {
            continue;
        };
        let text = String::from_utf8_lossy(&message).into_owned();
        if !sip::branch_matches(&text, &ids.branch) {
            continue;
        }
        let Some(status) = sip::parse_status_code(&text) else {
            continue;
        };
        match status {
            100 => continue,
            180 | 183 => {
                ringing = true;
                continue;
            }
            200..=299 => {
                result.sip_rtt_ms = sent_at.elapsed().as_millis() as i64;
                break text;
            }
            486 => {
                result.status = VoipProbeStatus::Busy;
                result.reason = "phone busy (486)".to_string();
                return result;
            }
            other => {
                result.status = VoipProbeStatus::SipError;
                result.reason = format!("SIP error response {}", other);
                return result;
            }
        }
    };

    let Some(to_tag) = sip::extract_to_tag(&answer) else {
        result.reason = "no To tag in 200 OK".to_string();
        return result;
    };
    let media = match sip::parse_sdp(&answer, phone_ip) {
        Some(m) => m,
        None => {
            // No usable SDP; assume symmetric ports on the phone.
            sip::SdpMedia {
                addr: phone_ip,
                rtp_port,
                rtcp_port: rtp_port + 1,
            }
        }
    };

    let ack = sip::build_ack(number, phone_ip, local_ip, &ids, &to_tag);
    let _ = transport.send(dest, ack.as_bytes());

    let rtp_dest = SocketAddrV4::new(media.addr, media.rtp_port);
    let rtcp_dest = SocketAddrV4::new(media.addr, media.rtcp_port);
    rtp_sock.set_nonblocking(true).ok();
    rtcp_sock.set_nonblocking(true).ok();

    // Silence burst with SR compounds at the start, near one second in, and
    // at the end, draining any incoming RTP as we go.
    let ssrc = ssrc_from_clock();
    let cname = format!("meshmon@{}", local_ip);
    let mut stats = RtpStats::new();
    let mut lsr = 0u32;

    let (sr, first_lsr) = rtp::build_sr_compound(ssrc, 0, 0, 0, &cname);
    if rtcp_sock.send_to(&sr, rtcp_dest).is_ok() {
        lsr = first_lsr;
    }

    let packets_to_send = (config.burst_duration_ms / config.rtp_ptime_ms.max(1)) as u32;
    let mid_sr_at = (1000 / config.rtp_ptime_ms.max(1)) as u32;
    let payload = [0xFFu8; 160]; // PCMU silence
    let ticks_per_packet = (config.rtp_ptime_ms * 8) as u32;
    let mut timestamp = 0u32;

    for i in 0..packets_to_send {
        let packet = rtp::encode_rtp(i as u16, timestamp, ssrc, &payload);
        let _ = rtp_sock.send_to(&packet, rtp_dest);
        result.packets_sent += 1;
        timestamp = timestamp.wrapping_add(ticks_per_packet);

        drain_rtp(&rtp_sock, &mut stats);

        if i == mid_sr_at {
            let (sr, new_lsr) = rtp::build_sr_compound(
                ssrc,
                timestamp,
                result.packets_sent,
                result.packets_sent * 160,
                &cname,
            );
            if rtcp_sock.send_to(&sr, rtcp_dest).is_ok() {
                lsr = new_lsr;
            }
        }

        std::thread::sleep(Duration::from_millis(config.rtp_ptime_ms));
    }

    let (sr, final_lsr) = rtp::build_sr_compound(
        ssrc,
        timestamp,
        result.packets_sent,
        result.packets_sent * 160,
        &cname,
    );
    if rtcp_sock.send_to(&sr, rtcp_dest).is_ok() {
        lsr = final_lsr;
    }
    drain_rtp(&rtp_sock, &mut stats);

    // Grace period for late RTP and the receiver report.
    let mut rr: Option<rtp::RrReport> = None;
    let rr_deadline = Instant::now() + Duration::from_millis(config.rtcp_wait_ms);
    let mut rtcp_buf = [0u8; 512];
    while Instant::now() < rr_deadline {
        drain_rtp(&rtp_sock, &mut stats);
        if rr.is_none() {
            if let Ok((len, _)) = rtcp_sock.recv_from(&mut rtcp_buf) {
                rr = rtp::parse_rr(&rtcp_buf[..len], lsr);
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    drain_rtp(&rtp_sock, &mut stats);

    if stats.packets_received >= 5 {
        result.status = VoipProbeStatus::Success;
        // SIP RTT stands in for media RTT unless an RR gives the real one.
        result.media_rtt_ms = result.sip_rtt_ms;
        result.jitter_ms = stats.jitter_ms();
        result.packets_lost = stats.lost();
        result.loss_fraction = stats.loss_fraction();
        result.reason = format!(
            "probe successful with local RTP metrics ({} packets received)",
            stats.packets_received
        );
    } else {
        result.status = VoipProbeStatus::NoRr;
        result.reason = format!(
            "no/insufficient RTP received from phone ({} packets, need 5)",
            stats.packets_received
        );
    }

    if let Some(report) = rr {
        result.jitter_ms = report.jitter_ms;
        result.loss_fraction = report.fraction_lost;
        result.packets_lost = report.cumulative_lost;
        if let Some(rtt) = report.rtt_ms {
            result.media_rtt_ms = rtt;
        }
        log.debug("VOIP_PROBE", "applied RTCP receiver report metrics");
    }

    let bye = sip::build_bye(number, phone_ip, local_ip, &ids, &to_tag);
    let _ = transport.send(dest, bye.as_bytes());

    result
}

fn drain_rtp(socket: &UdpSocket, stats: &mut RtpStats) {
    let mut buf = [0u8; 2048];
    while let Ok((len, _)) = socket.recv_from(&mut buf) {
        if let Some(header) = rtp::decode_rtp(&buf[..len]) {
            let arrival_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64()
                * 1000.0;
            stats.process(header, arrival_ms);
        }
    }
}

/// Bind RTP on an even port with RTCP one above. Retries a handful of bases
/// before giving up.
fn bind_media_ports() -> Option<(UdpSocket, UdpSocket, u16)> {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u16;

    for attempt in 0..20u16 {
        let base = 10000 + ((seed.wrapping_add(attempt * 37)) % 1000) * 2;
        let rtp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, base));
        let rtcp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, base + 1));
        if let (Ok(rtp), Ok(rtcp)) = (rtp, rtcp) {
            return Some((rtp, rtcp, base));
        }
    }
    None
}

fn ssrc_from_clock() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        ^ 0x6D65_7368 // "mesh"
}

/// Source address the kernel picks toward `dest`.
fn route_source(dest: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((dest, SIP_PORT)).ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}

/// Best-effort ICMP echo RTT over a raw socket. Needs privilege; any failure
/// is silent and reported as `None`.
pub fn icmp_rtt(dest: Ipv4Addr, timeout: Duration) -> Option<Duration> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).ok()?;
    socket.set_read_timeout(Some(timeout)).ok()?;

    let ident = (std::process::id() & 0xFFFF) as u16;
    let request = build_icmp_echo(ident, 1);

    let addr: std::net::SocketAddr = SocketAddrV4::new(dest, 0).into();
    let started = Instant::now();
    socket.send_to(&request, &addr.into()).ok()?;

    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1024];
    let deadline = started + timeout;
    loop {
        if Instant::now() >= deadline {
            return None;
        }
        let (len, _) = socket.recv_from(&mut buf).ok()?;
        let bytes: Vec<u8> = buf[..len]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();

        // Raw IPv4 sockets deliver the IP header too.
        let header_len = ((bytes.first()? & 0x0F) as usize) * 4;
        let icmp = bytes.get(header_len..)?;
        if icmp.len() >= 8
            && icmp[0] == 0 // echo reply
            && u16::from_be_bytes([icmp[4], icmp[5]]) == ident
        {
            return Some(started.elapsed());
        }
    }
}

fn build_icmp_echo(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![8u8, 0, 0, 0]; // type 8 (echo), code 0, checksum 0
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(b"meshmon-ping....");

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
