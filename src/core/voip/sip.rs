//! SIP message construction and the few parses the probe needs.
//!
//! Requests follow RFC 3261 closely enough for the phones on the mesh:
//! OPTIONS for reachability, INVITE/ACK/BYE with an SDP offer for the media
//! probe. Responses are matched to requests by the Via branch, which always
//! starts with the `z9hG4bK` magic cookie.

use std::net::Ipv4Addr;
use uuid::Uuid;

pub const SIP_USER_AGENT: &str = concat!("meshmon/", env!("CARGO_PKG_VERSION"));

/// Dialog identifiers generated per probe.
#[derive(Debug, Clone)]
pub struct DialogIds {
    pub branch: String,
    pub call_id: String,
    pub from_tag: String,
}

impl DialogIds {
    pub fn generate(local_ip: Ipv4Addr) -> Self {
        Self {
            branch: new_branch(),
            call_id: format!("{}@{}", Uuid::new_v4().simple(), local_ip),
            from_tag: Uuid::new_v4().simple().to_string()[..12].to_string(),
        }
    }
}

/// A fresh Via branch carrying the RFC 3261 magic cookie.
pub fn new_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

pub fn build_options(
    number: &str,
    phone_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    ids: &DialogIds,
) -> String {
    format!(
        "OPTIONS sip:{number}@{phone_ip} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local_ip}:5060;branch={branch}\r\n\
         From: <sip:meshmon@{local_ip}>;tag={tag}\r\n\
         To: <sip:{number}@{phone_ip}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Contact: <sip:meshmon@{local_ip}:5060>\r\n\
         Max-Forwards: 70\r\n\
         User-Agent: {ua}\r\n\
         Accept: application/sdp\r\n\
         Content-Length: 0\r\n\r\n",
        number = number,
        phone_ip = phone_ip,
        local_ip = local_ip,
        branch = ids.branch,
        tag = ids.from_tag,
        call_id = ids.call_id,
        ua = SIP_USER_AGENT,
    )
}

/// INVITE with a PCMU offer. The auto-answer headers let test calls complete
/// without anyone picking up the handset.
pub fn build_invite(
    number: &str,
    phone_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    rtp_port: u16,
    ids: &DialogIds,
) -> String {
    let sdp = format!(
        "v=0\r\n\
         o=meshmon {sess} 1 IN IP4 {local_ip}\r\n\
         s=Quality Probe\r\n\
         c=IN IP4 {local_ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=ptime:40\r\n\
         a=sendrecv\r\n",
        sess = &ids.from_tag,
        local_ip = local_ip,
        rtp_port = rtp_port,
    );

    format!(
        "INVITE sip:{number}@{phone_ip} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local_ip}:5060;branch={branch}\r\n\
         From: <sip:meshmon@{local_ip}>;tag={tag}\r\n\
         To: <sip:{number}@{phone_ip}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:meshmon@{local_ip}:5060>\r\n\
         Max-Forwards: 70\r\n\
         Call-Info: answer-after=0\r\n\
         Alert-Info: info=alert-autoanswer\r\n\
         User-Agent: {ua}\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{sdp}",
        number = number,
        phone_ip = phone_ip,
        local_ip = local_ip,
        branch = ids.branch,
        tag = ids.from_tag,
        call_id = ids.call_id,
        ua = SIP_USER_AGENT,
        len = sdp.len(),
        sdp = sdp,
    )
}

pub fn build_ack(
    number: &str,
    phone_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    ids: &DialogIds,
    to_tag: &str,
) -> String {
    in_dialog_request("ACK", "1 ACK", number, phone_ip, local_ip, ids, to_tag)
}

pub fn build_bye(
    number: &str,
    phone_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    ids: &DialogIds,
    to_tag: &str,
) -> String {
    in_dialog_request("BYE", "2 BYE", number, phone_ip, local_ip, ids, to_tag)
}

fn in_dialog_request(
    method: &str,
    cseq: &str,
    number: &str,
    phone_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    ids: &DialogIds,
    to_tag: &str,
) -> String {
    format!(
        "{method} sip:{number}@{phone_ip} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local_ip}:5060;branch={branch}\r\n\
         From: <sip:meshmon@{local_ip}>;tag={tag}\r\n\
         To: <sip:{number}@{phone_ip}>;tag={to_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        method = method,
        number = number,
        phone_ip = phone_ip,
        local_ip = local_ip,
        branch = new_branch(),
        tag = ids.from_tag,
        to_tag = to_tag,
        call_id = ids.call_id,
        cseq = cseq,
    )
}

/// Status code of a SIP response, `None` for requests or garbage.
pub fn parse_status_code(message: &str) -> Option<u16> {
    let first = message.lines().next()?;
    let mut parts = first.split_whitespace();
    if !parts.next()?.starts_with("SIP/2.0") {
        return None;
    }
    parts.next()?.parse::<u16>().ok().filter(|c| (100..700).contains(c))
}

/// Whether a response's Via carries exactly the given branch.
pub fn branch_matches(message: &str, branch: &str) -> bool {
    for line in message.lines() {
        let lower = line.to_ascii_lowercase();
        if !(lower.starts_with("via:") || lower.starts_with("v:")) {
            continue;
        }
        if let Some(idx) = line.find("branch=") {
            let rest = &line[idx + 7..];
            let end = rest
                .find(|c: char| c == ';' || c == ',' || c.is_ascii_whitespace())
                .unwrap_or(rest.len());
            if &rest[..end] == branch {
                return true;
            }
        }
    }
    false
}

/// Tag parameter of the To header, needed for ACK and BYE.
pub fn extract_to_tag(message: &str) -> Option<String> {
    for line in message.lines() {
        let lower = line.to_ascii_lowercase();
        if !(lower.starts_with("to:") || lower.starts_with("t:")) {
            continue;
        }
        let idx = lower.find("tag=")?;
        let rest = &line[idx + 4..];
        let end = rest
            .find(|c: char| matches!(c, ';' | '>' | ' ' | '\r' | '\n'))
            .unwrap_or(rest.len());
        if end > 0 {
            return Some(rest[..end].to_string());
        }
    }
    None
}

/// Media description pulled from an SDP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub addr: Ipv4Addr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Parse the answer SDP: connection address, audio port, and the RTCP port
/// (RTP + 1 unless an `a=rtcp:` attribute overrides it).
pub fn parse_sdp(message: &str, fallback_addr: Ipv4Addr) -> Option<SdpMedia> {
    let mut addr = fallback_addr;
    let mut rtp_port: Option<u16> = None;
    let mut rtcp_port: Option<u16> = None;

    for line in message.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            if let Ok(a) = rest.trim().parse::<Ipv4Addr>() {
                addr = a;
            }
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            rtp_port = rest.split_whitespace().next().and_then(|p| p.parse().ok());
        } else if let Some(rest) = line.strip_prefix("a=rtcp:") {
            rtcp_port = rest.split_whitespace().next().and_then(|p| p.parse().ok());
        }
    }

    let rtp_port = rtp_port?;
    Some(SdpMedia {
        addr,
        rtp_port,
        rtcp_port: rtcp_port.unwrap_or(rtp_port + 1),
    })
}
