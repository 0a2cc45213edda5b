use crate::common;
use meshmon::core::mesh::probe_engine::{ProbeEngine, ProbePacket, PROBE_PACKET_LEN};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (Arc<ProbeEngine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = common::test_logger(dir.path());
    let engine = Arc::new(ProbeEngine::new(&common::loopback_config(), log).unwrap());
    (engine, dir)
}

#[test]
fn full_loss_without_responder() {
    // Ten probes toward our own responder port, but nobody echoes them.
    let (engine, _dir) = engine();

    let sent = engine.send_probes("127.0.0.1", 10, 0).unwrap();
    assert_eq!(sent, 10);
    assert_eq!(engine.pending_depth(), 10);

    let window = engine.calculate_metrics(Ipv4Addr::LOCALHOST);
    assert_eq!(window.sent, 10);
    assert_eq!(window.received, 0);
    assert_eq!(window.loss_pct, 100.0);
    assert_eq!(window.rtt_ms_avg, 0.0);
    assert_eq!(window.jitter_ms, 0.0);

    // Window teardown cleared every pending probe.
    assert_eq!(engine.pending_depth(), 0);
}

#[test]
fn loopback_echo_round_trip() {
    let (engine, _dir) = engine();
    let responder = Arc::clone(&engine);
    let handle = std::thread::spawn(move || responder.run_responder());

    let sent = engine.send_probes("127.0.0.1", 10, 5).unwrap();
    assert_eq!(sent, 10);

    // Loopback echoes arrive within the first poll or two.
    let window = engine.calculate_metrics(Ipv4Addr::LOCALHOST);
    assert_eq!(window.received, 10);
    assert_eq!(window.loss_pct, 0.0);
    assert!(window.rtt_ms_avg >= 0.0 && window.rtt_ms_avg < 50.0);
    assert!(window.jitter_ms >= 0.0);
    assert!(window.rtt_ms_min <= window.rtt_ms_avg);
    assert!(window.rtt_ms_avg <= window.rtt_ms_max);
    assert_eq!(engine.pending_depth(), 0);

    engine.shutdown();
    handle.join().unwrap();
}

#[test]
fn responder_echoes_to_embedded_address_not_source() {
    let (engine, _dir) = engine();
    let responder = Arc::clone(&engine);
    let handle = std::thread::spawn(move || responder.run_responder());

    // Send from one socket but point the embedded return address at another.
    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let return_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    return_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    sender
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();

    let packet = ProbePacket {
        sequence: 3,
        sent_sec: 1,
        sent_usec: 2,
        src_node: "test-node".to_string(),
        return_addr: Ipv4Addr::LOCALHOST,
        return_port: return_sock.local_addr().unwrap().port(),
    };
    sender
        .send_to(
            &packet.encode(),
            (Ipv4Addr::LOCALHOST, engine.probe_port()),
        )
        .unwrap();

    // The echo lands on the embedded return socket...
    let mut buf = [0u8; 1024];
    let (len, _) = return_sock.recv_from(&mut buf).unwrap();
    assert_eq!(ProbePacket::decode(&buf[..len]).unwrap(), packet);

    // ...and never on the sending socket.
    assert!(sender.recv_from(&mut buf).is_err());

    engine.shutdown();
    handle.join().unwrap();
}

#[test]
fn responder_counts_and_drops_short_datagrams() {
    let (engine, _dir) = engine();
    let responder = Arc::clone(&engine);
    let handle = std::thread::spawn(move || responder.run_responder());

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    sender
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    sender
        .send_to(&[0u8; PROBE_PACKET_LEN - 10], (Ipv4Addr::LOCALHOST, engine.probe_port()))
        .unwrap();

    // No echo for garbage, and the drop is counted.
    let mut buf = [0u8; 64];
    assert!(sender.recv_from(&mut buf).is_err());
    assert!(engine.short_datagram_count() >= 1);

    engine.shutdown();
    handle.join().unwrap();
}

#[test]
fn send_probes_refuses_unresolvable_target() {
    let (engine, _dir) = engine();
    assert!(engine
        .send_probes("no-such-node-xyzzy", 3, 0)
        .is_err());
    assert_eq!(engine.pending_depth(), 0);
}

#[test]
fn send_probes_after_shutdown_fails() {
    let (engine, _dir) = engine();
    engine.shutdown();
    assert!(engine.send_probes("127.0.0.1", 1, 0).is_err());
}
