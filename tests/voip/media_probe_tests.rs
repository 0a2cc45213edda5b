//! Media probe against a scripted phone that actually answers with RTP.

use crate::common;
use meshmon::core::voip::probe::{media_probe, SipTransport};
use meshmon::core::voip::queue::ResponseQueue;
use meshmon::core::voip::rtp;
use meshmon::core::voip::types::{VoipProbeConfig, VoipProbeStatus};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PHONE_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Fake phone: answers the INVITE with 100 + 200-with-SDP and, when asked,
/// streams a short RTP burst back at the port the probe offered.
struct MediaPhone {
    queue: Arc<ResponseQueue>,
    requests: Mutex<Vec<String>>,
    media_socket: Arc<UdpSocket>,
    answer_with_rtp: bool,
}

impl MediaPhone {
    fn new(answer_with_rtp: bool) -> Self {
        let media_socket = UdpSocket::bind((PHONE_IP, 0)).unwrap();
        Self {
            queue: Arc::new(ResponseQueue::new()),
            requests: Mutex::new(Vec::new()),
            media_socket: Arc::new(media_socket),
            answer_with_rtp,
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn offered_rtp_port(request: &str) -> u16 {
        request
            .lines()
            .find_map(|l| l.strip_prefix("m=audio "))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|p| p.parse().ok())
            .expect("INVITE carries an audio offer")
    }
}

impl SipTransport for MediaPhone {
    fn send(&self, _dest: SocketAddrV4, data: &[u8]) -> std::io::Result<()> {
        let request = String::from_utf8_lossy(data).into_owned();
        let is_invite = request.starts_with("INVITE ");
        let branch = request
            .split("branch=")
            .nth(1)
            .and_then(|r| r.split([';', '\r']).next())
            .unwrap_or("")
            .to_string();
        self.requests.lock().unwrap().push(request.clone());

        if !is_invite {
            return Ok(());
        }

        let probe_rtp_port = Self::offered_rtp_port(&request);
        let phone_port = self.media_socket.local_addr().unwrap().port();

        let sdp = format!(
            "v=0\r\no=phone 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\n\
             t=0 0\r\nm=audio {} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
            phone_port
        );
        let trying = format!(
            "SIP/2.0 100 Trying\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\nContent-Length: 0\r\n\r\n",
            branch
        );
        let ok = format!(
            "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\n\
             To: <sip:441530@127.0.0.1>;tag=phonetag\r\nContent-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            branch,
            sdp.len(),
            sdp
        );
        self.queue.enqueue(trying.into_bytes());
        self.queue.enqueue(ok.into_bytes());

        if self.answer_with_rtp {
            let socket = Arc::clone(&self.media_socket);
            std::thread::spawn(move || {
                let dest = SocketAddrV4::new(PHONE_IP, probe_rtp_port);
                for seq in 0..8u16 {
                    let packet =
                        rtp::encode_rtp(seq, u32::from(seq) * 320, 0xCAFE, &[0xFF; 160]);
                    let _ = socket.send_to(&packet, dest);
                    std::thread::sleep(Duration::from_millis(10));
                }
            });
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.queue.dequeue(timeout)
    }

    fn local_ip(&self, _dest: Ipv4Addr) -> Ipv4Addr {
        PHONE_IP
    }
}

fn short_media_config() -> VoipProbeConfig {
    VoipProbeConfig {
        invite_timeout_ms: 2000,
        burst_duration_ms: 200,
        rtp_ptime_ms: 40,
        rtcp_wait_ms: 200,
        icmp_probe: false,
    }
}

#[test]
fn answered_call_with_media_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let log = common::test_logger(dir.path());
    let phone = MediaPhone::new(true);

    let result = media_probe(&phone, "441530", PHONE_IP, &short_media_config(), &log);

    assert_eq!(result.status, VoipProbeStatus::Success, "{}", result.reason);
    assert_eq!(result.packets_sent, 5); // 200 ms at 40 ms ptime
    assert!(result.sip_rtt_ms >= 0);
    assert_eq!(result.media_rtt_ms, result.sip_rtt_ms);
    assert!(result.jitter_ms >= 0.0);
    assert!(result.loss_fraction < 0.01);

    // The dialog completed: INVITE, then ACK, then BYE with the phone's tag.
    let requests = phone.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].starts_with("INVITE "));
    assert!(requests[1].starts_with("ACK "));
    assert!(requests[2].starts_with("BYE "));
    assert!(requests[1].contains("tag=phonetag"));
    assert!(requests[2].contains("tag=phonetag"));
}

#[test]
fn answered_call_without_media_is_no_rr() {
    let dir = tempfile::tempdir().unwrap();
    let log = common::test_logger(dir.path());
    let phone = MediaPhone::new(false);

    let result = media_probe(&phone, "441530", PHONE_IP, &short_media_config(), &log);

    assert_eq!(result.status, VoipProbeStatus::NoRr);
    assert!(result.reason.contains("need 5"));
    assert_eq!(result.packets_sent, 5);

    // The call still terminates cleanly.
    let requests = phone.requests();
    assert!(requests.iter().any(|r| r.starts_with("BYE ")));
}
