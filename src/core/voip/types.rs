//! Types shared across the VoIP quality subsystem.

use serde::{Deserialize, Serialize};

/// Outcome classification of one phone probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoipProbeStatus {
    Success,
    Busy,
    SipTimeout,
    SipError,
    /// Call set up but no (or too little) media came back.
    NoRr,
    /// Phone rang but never answered within the timeout.
    NoAnswer,
}

impl VoipProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VoipProbeStatus::Success => "SUCCESS",
            VoipProbeStatus::Busy => "BUSY",
            VoipProbeStatus::SipTimeout => "SIP_TIMEOUT",
            VoipProbeStatus::SipError => "SIP_ERROR",
            VoipProbeStatus::NoRr => "NO_RR",
            VoipProbeStatus::NoAnswer => "NO_ANSWER",
        }
    }
}

/// Probe tunables.
#[derive(Debug, Clone)]
pub struct VoipProbeConfig {
    pub invite_timeout_ms: u64,
    /// Length of the RTP silence burst in the media probe.
    pub burst_duration_ms: u64,
    /// RTP packet time; PCMU at 8 kHz means 8 samples per millisecond.
    pub rtp_ptime_ms: u64,
    /// Grace period after the burst for late RTP and the receiver report.
    pub rtcp_wait_ms: u64,
    /// Try a raw-socket ICMP echo before the SIP probe.
    pub icmp_probe: bool,
}

impl Default for VoipProbeConfig {
    fn default() -> Self {
        Self {
            invite_timeout_ms: 5000,
            burst_duration_ms: 1200,
            rtp_ptime_ms: 40,
            rtcp_wait_ms: 2000,
            icmp_probe: true,
        }
    }
}

/// Result of one phone probe, OPTIONS-only or full media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoipProbeResult {
    pub status: VoipProbeStatus,
    pub sip_rtt_ms: i64,
    /// ICMP echo RTT for comparison, -1 when unavailable.
    pub icmp_rtt_ms: i64,
    pub media_rtt_ms: i64,
    pub jitter_ms: f64,
    pub loss_fraction: f64,
    pub packets_sent: u32,
    pub packets_lost: u32,
    pub reason: String,
}

impl VoipProbeResult {
    pub fn failed(status: VoipProbeStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            sip_rtt_ms: 0,
            icmp_rtt_ms: -1,
            media_rtt_ms: 0,
            jitter_ms: 0.0,
            loss_fraction: 0.0,
            packets_sent: 0,
            packets_lost: 0,
            reason: reason.into(),
        }
    }
}

/// One phone as seen in the registrar's user table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPhone {
    /// The directory number, which is also its DNS label on the mesh.
    pub number: String,
}

/// Read access to the SIP registrar's user table.
///
/// The registrar owns the table and its lock; `snapshot` copies the current
/// registrations out under that lock and releases it before returning, so
/// the quality cycle never holds a registrar lock while probing.
pub trait RegistrarView: Send + Sync {
    fn snapshot(&self) -> Vec<RegisteredPhone>;
    fn active_calls(&self) -> u32 {
        0
    }
}

/// Stand-in registrar for running the agent outside a SIP server.
pub struct EmptyRegistrar;

impl RegistrarView for EmptyRegistrar {
    fn snapshot(&self) -> Vec<RegisteredPhone> {
        Vec::new()
    }
}
