//! RTP/RTCP packet handling for the media probe (RFC 3550).
//!
//! Covers exactly what the probe needs: encode PCMU RTP packets, build
//! Sender Report + SDES compounds, parse Receiver Reports, and keep the
//! interarrival jitter estimator over received RTP.

use std::time::{SystemTime, UNIX_EPOCH};

/// PCMU payload type at 8 kHz.
pub const RTP_PAYLOAD_PCMU: u8 = 0;
pub const RTP_HEADER_LEN: usize = 12;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const RTCP_PT_SR: u8 = 200;
const RTCP_PT_RR: u8 = 201;
const RTCP_PT_SDES: u8 = 202;

/// Current NTP timestamp as (seconds, fraction).
pub fn ntp_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sec = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    // 2^32 fractions per second.
    let frac = ((u64::from(now.subsec_nanos()) << 32) / 1_000_000_000) as u32;
    (sec, frac)
}

/// Middle 32 bits of an NTP timestamp, the format LSR/DLSR use.
pub fn ntp_middle(sec: u32, frac: u32) -> u32 {
    ((sec & 0xFFFF) << 16) | (frac >> 16)
}

/// Encode one RTP packet: fixed header, no CSRC, no extensions.
pub fn encode_rtp(seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
    packet.push(0x80); // version 2
    packet.push(RTP_PAYLOAD_PCMU);
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&timestamp.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Decoded RTP header fields the statistics need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

pub fn decode_rtp(buf: &[u8]) -> Option<RtpHeader> {
    if buf.len() < RTP_HEADER_LEN || buf[0] >> 6 != 2 {
        return None;
    }
    Some(RtpHeader {
        seq: u16::from_be_bytes([buf[2], buf[3]]),
        timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    })
}

/// Build a Sender Report + SDES CNAME compound. Returns the packet and the
/// LSR value (middle NTP bits) a receiver will reflect back.
pub fn build_sr_compound(
    ssrc: u32,
    rtp_timestamp: u32,
    packet_count: u32,
    byte_count: u32,
    cname: &str,
) -> (Vec<u8>, u32) {
    let (ntp_sec, ntp_frac) = ntp_now();
    let lsr = ntp_middle(ntp_sec, ntp_frac);

    let mut packet = Vec::with_capacity(64);
    // SR, no reception report blocks.
    packet.push(0x80);
    packet.push(RTCP_PT_SR);
    packet.extend_from_slice(&6u16.to_be_bytes()); // length in words - 1
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(&ntp_sec.to_be_bytes());
    packet.extend_from_slice(&ntp_frac.to_be_bytes());
    packet.extend_from_slice(&rtp_timestamp.to_be_bytes());
    packet.extend_from_slice(&packet_count.to_be_bytes());
    packet.extend_from_slice(&byte_count.to_be_bytes());

    // SDES with one CNAME chunk, padded to a word boundary.
    let cname = &cname.as_bytes()[..cname.len().min(255)];
    let chunk_len = 4 + 2 + cname.len() + 1; // SSRC + item header + text + END
    let padded = (chunk_len + 3) & !3;
    let words = (4 + padded) / 4 - 1;

    packet.push(0x81); // version 2, one source chunk
    packet.push(RTCP_PT_SDES);
    packet.extend_from_slice(&(words as u16).to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.push(1); // CNAME
    packet.push(cname.len() as u8);
    packet.extend_from_slice(cname);
    packet.push(0); // END
    packet.resize(packet.len() + padded - chunk_len, 0);

    (packet, lsr)
}

/// Fields of interest from a Receiver Report block.
#[derive(Debug, Clone, PartialEq)]
pub struct RrReport {
    /// Fraction of packets lost since the last report, 0.0..1.0.
    pub fraction_lost: f64,
    pub cumulative_lost: u32,
    /// Interarrival jitter converted from 8 kHz ticks to milliseconds.
    pub jitter_ms: f64,
    /// Media RTT derived from LSR/DLSR when the report reflects our SR.
    pub rtt_ms: Option<i64>,
}

/// Parse an RTCP RR. `expected_lsr` is the LSR of the last SR we sent; the
/// RTT is only computed when the receiver reflects exactly that value.
pub fn parse_rr(buf: &[u8], expected_lsr: u32) -> Option<RrReport> {
    if buf.len() < 32 || buf[0] >> 6 != 2 || buf[1] != RTCP_PT_RR {
        return None;
    }

    let fraction_lost = f64::from(buf[12]) / 256.0;
    let cumulative_lost =
        (u32::from(buf[13]) << 16) | (u32::from(buf[14]) << 8) | u32::from(buf[15]);
    let jitter_ticks = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    let lsr = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);
    let dlsr = u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]);

    let rtt_ms = if lsr != 0 && lsr == expected_lsr {
        let (sec, frac) = ntp_now();
        let now = ntp_middle(sec, frac);
        // 1/65536-second units; wrapping arithmetic handles the 16-bit rollover.
        let rtt_units = now.wrapping_sub(lsr).wrapping_sub(dlsr);
        Some((f64::from(rtt_units) / 65536.0 * 1000.0) as i64)
    } else {
        None
    };

    Some(RrReport {
        fraction_lost,
        cumulative_lost,
        jitter_ms: f64::from(jitter_ticks) / 8.0,
        rtt_ms,
    })
}

/// Receiver-side RTP statistics with the RFC 3550 appendix A.8 jitter
/// estimator, kept in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct RtpStats {
    initialized: bool,
    first_seq: u16,
    highest_seq: u16,
    pub packets_received: u32,
    prev_transit: f64,
    jitter: f64,
}

impl RtpStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one received packet. `arrival_ms` is wall-clock arrival in
    /// milliseconds; the RTP timestamp is converted at 8 samples per ms.
    pub fn process(&mut self, header: RtpHeader, arrival_ms: f64) {
        let transit = arrival_ms - f64::from(header.timestamp) / 8.0;

        if !self.initialized {
            self.initialized = true;
            self.first_seq = header.seq;
            self.highest_seq = header.seq;
            self.packets_received = 1;
            self.prev_transit = transit;
            self.jitter = 0.0;
            return;
        }

        // Signed 16-bit difference keeps ordering across wrap-around.
        if (header.seq.wrapping_sub(self.highest_seq) as i16) > 0 {
            self.highest_seq = header.seq;
        }
        self.packets_received += 1;

        let d = (transit - self.prev_transit).abs();
        self.jitter += (d - self.jitter) / 16.0;
        self.prev_transit = transit;
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter
    }

    /// Packets the sequence span says we should have seen.
    pub fn expected(&self) -> u32 {
        if !self.initialized {
            return 0;
        }
        u32::from(self.highest_seq.wrapping_sub(self.first_seq)) + 1
    }

    pub fn lost(&self) -> u32 {
        self.expected().saturating_sub(self.packets_received)
    }

    pub fn loss_fraction(&self) -> f64 {
        let expected = self.expected();
        if expected == 0 {
            return 0.0;
        }
        f64::from(self.lost()) / f64::from(expected)
    }
}
