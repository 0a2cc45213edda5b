use crate::common;
use meshmon::config::defaults::MAX_DISCOVERED_AGENTS;
use meshmon::core::mesh::discovery::{
    candidate_node_name, parse_cache_line, parse_sysinfo_hosts, AgentDiscovery, SysinfoEndpoint,
};
use std::net::Ipv4Addr;

fn discovery_at(path: std::path::PathBuf, dir: &std::path::Path) -> AgentDiscovery {
    AgentDiscovery::new(
        path,
        SysinfoEndpoint::default(),
        "local.mesh".to_string(),
        "this-node".to_string(),
        common::test_logger(dir),
    )
}

#[test]
fn candidate_filter_rejects_phones_aliases_and_self() {
    assert!(candidate_node_name("KD7AAA-hill", "this-node"));
    assert!(candidate_node_name("n0de-42", "this-node"));

    // Numeric-only names are phones.
    assert!(!candidate_node_name("441530", "this-node"));
    // Interface aliases.
    assert!(!candidate_node_name("lan.KD7AAA-hill", "this-node"));
    assert!(!candidate_node_name("LAN.KD7AAA-hill", "this-node"));
    // Ourselves, case-insensitively.
    assert!(!candidate_node_name("THIS-NODE", "this-node"));
    assert!(!candidate_node_name("", "this-node"));
}

#[test]
fn sysinfo_hosts_parsing_respects_limit() {
    let json = r#"{"hosts": [
        {"name": "nodeA", "ip": "10.1.1.1"},
        {"name": "nodeB", "ip": "10.1.1.2"},
        {"name": "441530", "ip": "10.1.1.3"},
        {"name": "broken"}
    ]}"#;

    let hosts = parse_sysinfo_hosts(json, 500);
    assert_eq!(hosts.len(), 4);
    assert_eq!(hosts[0].0, "nodeA");
    assert_eq!(hosts[0].1, Some("10.1.1.1".parse().unwrap()));
    assert_eq!(hosts[3].1, None);

    assert_eq!(parse_sysinfo_hosts(json, 2).len(), 2);
    assert!(parse_sysinfo_hosts("{}", 500).is_empty());
    assert!(parse_sysinfo_hosts("garbage", 500).is_empty());
}

#[test]
fn cache_line_accepts_both_formats() {
    let four = parse_cache_line("10.1.2.3,10.1.2.1,nodeA,1700000000").unwrap();
    assert_eq!(four.mesh_ip, "10.1.2.3".parse::<Ipv4Addr>().unwrap());
    assert_eq!(four.lan_ip, "10.1.2.1".parse::<Ipv4Addr>().unwrap());
    assert_eq!(four.node, "nodeA");
    assert_eq!(four.last_seen, 1700000000);

    // Legacy rows default the LAN address to the mesh address.
    let three = parse_cache_line("10.4.5.6,nodeB,1700000001").unwrap();
    assert_eq!(three.mesh_ip, three.lan_ip);
    assert_eq!(three.node, "nodeB");

    assert!(parse_cache_line("").is_none());
    assert!(parse_cache_line("not,an,ip").is_none());
    assert!(parse_cache_line("10.0.0.1,node").is_none());
}

#[test]
fn cache_round_trip_normalizes_legacy_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent_cache.txt");
    std::fs::write(
        &path,
        "10.1.2.3,10.1.2.1,nodeA,1700000000\n10.4.5.6,nodeB,1700000001\n",
    )
    .unwrap();

    let discovery = discovery_at(path.clone(), dir.path());
    assert_eq!(discovery.len(), 2);

    discovery.save_cache();
    let saved = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        saved,
        "10.1.2.3,10.1.2.1,nodeA,1700000000\n10.4.5.6,10.4.5.6,nodeB,1700000001\n"
    );

    // A second load/save cycle is idempotent.
    let reloaded = discovery_at(path.clone(), dir.path());
    assert_eq!(reloaded.len(), 2);
    reloaded.save_cache();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), saved);
}

#[test]
fn cache_load_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent_cache.txt");

    let mut content = String::new();
    for i in 0..(MAX_DISCOVERED_AGENTS + 20) {
        content.push_str(&format!("10.9.{}.{},node{},1700000000\n", i / 256, i % 256, i));
    }
    std::fs::write(&path, content).unwrap();

    let discovery = discovery_at(path, dir.path());
    assert_eq!(discovery.len(), MAX_DISCOVERED_AGENTS);
}

#[test]
fn agents_copies_at_most_max_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent_cache.txt");
    std::fs::write(
        &path,
        "10.1.0.1,a,1\n10.1.0.2,b,2\n10.1.0.3,c,3\n",
    )
    .unwrap();

    let discovery = discovery_at(path, dir.path());
    assert_eq!(discovery.agents(2).len(), 2);
    assert_eq!(discovery.agents(10).len(), 3);
}
