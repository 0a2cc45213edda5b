//! OPTIONS probe behaviour against a scripted phone.
//!
//! The fake phone implements `SipTransport`: it captures the outgoing
//! request, lifts the Via branch out of it, and feeds scripted responses
//! through a real `ResponseQueue`, which is exactly how responses travel
//! when the probe borrows the registrar's socket.

use crate::common;
use meshmon::core::logger::Logger;
use meshmon::core::voip::probe::{options_probe, SipTransport};
use meshmon::core::voip::queue::ResponseQueue;
use meshmon::core::voip::types::{VoipProbeConfig, VoipProbeStatus};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PHONE: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Response script: status lines to play back, with the captured branch
/// substituted, or `None` to stay silent.
struct ScriptedPhone {
    script: Vec<ScriptEntry>,
    queue: Arc<ResponseQueue>,
    sent: Mutex<Vec<String>>,
}

enum ScriptEntry {
    /// Respond with this status line, echoing the request's branch.
    Respond(&'static str),
    /// Respond with this status line under an unrelated branch.
    WrongBranch(&'static str),
}

impl ScriptedPhone {
    fn new(script: Vec<ScriptEntry>) -> Self {
        Self {
            script,
            queue: Arc::new(ResponseQueue::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

fn branch_of(request: &str) -> String {
    let idx = request.find("branch=").expect("request has a branch");
    let rest = &request[idx + 7..];
    let end = rest
        .find(|c: char| c == ';' || c.is_ascii_whitespace())
        .unwrap_or(rest.len());
    rest[..end].to_string()
}

impl SipTransport for ScriptedPhone {
    fn send(&self, _dest: SocketAddrV4, data: &[u8]) -> std::io::Result<()> {
        let request = String::from_utf8_lossy(data).into_owned();
        let branch = branch_of(&request);
        self.sent.lock().unwrap().push(request);

        for entry in &self.script {
            let message = match entry {
                ScriptEntry::Respond(status) => format!(
                    "SIP/2.0 {}\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\n\
                     To: <sip:441530@10.0.0.2>;tag=resp1\r\nContent-Length: 0\r\n\r\n",
                    status, branch
                ),
                ScriptEntry::WrongBranch(status) => format!(
                    "SIP/2.0 {}\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKsomeoneelse\r\n\
                     Content-Length: 0\r\n\r\n",
                    status
                ),
            };
            self.queue.enqueue(message.into_bytes());
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.queue.dequeue(timeout)
    }

    fn local_ip(&self, _dest: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }
}

fn probe_with(script: Vec<ScriptEntry>, timeout_ms: u64) -> (VoipProbeStatus, i64, String) {
    let dir = tempfile::tempdir().unwrap();
    let log: Arc<Logger> = common::test_logger(dir.path());
    let phone = ScriptedPhone::new(script);
    let config = VoipProbeConfig {
        invite_timeout_ms: timeout_ms,
        icmp_probe: false,
        ..VoipProbeConfig::default()
    };

    let result = options_probe(&phone, "441530", PHONE, &config, &log);
    let requests = phone.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("OPTIONS sip:441530@127.0.0.1 SIP/2.0"));
    (result.status, result.sip_rtt_ms, result.reason)
}

#[test]
fn provisional_then_ok_is_success() {
    // 180 Ringing keeps the probe waiting; the 200 ends it.
    let (status, rtt, _) = probe_with(
        vec![
            ScriptEntry::Respond("180 Ringing"),
            ScriptEntry::Respond("200 OK"),
        ],
        2000,
    );
    assert_eq!(status, VoipProbeStatus::Success);
    assert!(rtt >= 0);
    assert!(rtt < 2000);
}

#[test]
fn busy_here_classifies_as_busy() {
    let (status, _, reason) = probe_with(vec![ScriptEntry::Respond("486 Busy Here")], 2000);
    assert_eq!(status, VoipProbeStatus::Busy);
    assert!(reason.contains("486"));
}

#[test]
fn not_found_classifies_as_sip_error() {
    let (status, _, reason) = probe_with(vec![ScriptEntry::Respond("404 Not Found")], 2000);
    assert_eq!(status, VoipProbeStatus::SipError);
    assert!(reason.contains("404"));
}

#[test]
fn silence_classifies_as_timeout() {
    let (status, _, reason) = probe_with(Vec::new(), 200);
    assert_eq!(status, VoipProbeStatus::SipTimeout);
    assert!(reason.contains("200ms"));
}

#[test]
fn foreign_branch_responses_are_ignored() {
    // A 200 for some other transaction must not satisfy this probe.
    let (status, _, _) = probe_with(vec![ScriptEntry::WrongBranch("200 OK")], 200);
    assert_eq!(status, VoipProbeStatus::SipTimeout);
}

#[test]
fn foreign_branch_then_matching_ok_succeeds() {
    let (status, _, _) = probe_with(
        vec![
            ScriptEntry::WrongBranch("200 OK"),
            ScriptEntry::Respond("200 OK"),
        ],
        2000,
    );
    assert_eq!(status, VoipProbeStatus::Success);
}
