use meshmon::core::mesh::routing::{
    classify_link_type, parse_babel_neighbours, parse_babel_route, parse_olsr_neighbours,
    parse_olsr_route,
};
use std::net::Ipv4Addr;

#[test]
fn link_type_table_is_total() {
    assert_eq!(classify_link_type(Some("wlan0")), "RF");
    assert_eq!(classify_link_type(Some("wlan1-1")), "RF");
    assert_eq!(classify_link_type(Some("tun-x")), "tunnel");
    assert_eq!(classify_link_type(Some("tun50")), "tunnel");
    assert_eq!(classify_link_type(Some("eth0")), "ethernet");
    assert_eq!(classify_link_type(Some("br-lan")), "bridge");
    assert_eq!(classify_link_type(Some("foo")), "unknown");
    assert_eq!(classify_link_type(Some("")), "unknown");
    assert_eq!(classify_link_type(None), "unknown");
    // Prefix, not substring: a bridge is not "br" anywhere in the name.
    assert_eq!(classify_link_type(Some("xbr-lan")), "unknown");
}

#[test]
fn olsr_neighbours_parse_ip_and_hostname() {
    let json = r#"{
        "neighbors": [
            {"ipAddress": "10.54.1.2", "hostname": "KD7AAA-hill", "linkQuality": 0.84,
             "neighborLinkQuality": 0.92, "symmetric": true},
            {"neighborIP": "10.54.9.9"},
            {"ipAddress": "not-an-ip"},
            {"hostname": "no-address"}
        ]
    }"#;

    let neighbours = parse_olsr_neighbours(json);
    assert_eq!(neighbours.len(), 2);

    assert_eq!(neighbours[0].ip, "10.54.1.2".parse::<Ipv4Addr>().unwrap());
    assert_eq!(neighbours[0].node, "KD7AAA-hill");
    assert!((neighbours[0].lq - 0.84).abs() < 1e-9);
    assert!((neighbours[0].nlq - 0.92).abs() < 1e-9);
    assert_eq!(neighbours[0].interface, "unknown");

    // Without a hostname the address text stands in for the node label.
    assert_eq!(neighbours[1].node, "10.54.9.9");
}

#[test]
fn olsr_neighbours_fail_closed_on_garbage() {
    assert!(parse_olsr_neighbours("not json at all").is_empty());
    assert!(parse_olsr_neighbours("{}").is_empty());
    assert!(parse_olsr_neighbours(r#"{"neighbors": 42}"#).is_empty());
}

#[test]
fn olsr_route_matches_with_and_without_prefix() {
    let json = r#"{
        "routes": [
            {"destination": "10.1.1.0/24", "gateway": "10.54.1.1", "metric": 4.0, "hops": 3},
            {"destination": "10.2.2.2/32", "gateway": "10.54.1.2", "metric": 1.2, "hops": 2},
            {"destination": "10.3.3.3", "gateway": "10.3.3.3", "metric": 1.0, "hops": 1}
        ]
    }"#;

    let multi = parse_olsr_route(json, "10.2.2.2".parse().unwrap()).unwrap();
    assert_eq!(multi.next_hop_ip, Some("10.54.1.2".parse().unwrap()));
    assert_eq!(multi.hop_count, 2);
    assert!((multi.etx - 1.2).abs() < 1e-9);

    let direct = parse_olsr_route(json, "10.3.3.3".parse().unwrap()).unwrap();
    assert_eq!(direct.hop_count, 1);

    assert!(parse_olsr_route(json, "10.9.9.9".parse().unwrap()).is_none());
}

#[test]
fn babel_neighbour_lines_yield_etx_from_rxcost() {
    let dump = "add interface wlan0 up true\n\
                neighbour 8f001a address 10.77.0.3 if wlan0 reach ffff rxcost 512 txcost 256 cost 512\n\
                neighbour 8f001b address 10.77.0.9 if tun20 reach ff00 rxcost 256 txcost 256 cost 256\n\
                ok\n";

    let neighbours = parse_babel_neighbours(dump);
    assert_eq!(neighbours.len(), 2);
    assert_eq!(neighbours[0].ip, "10.77.0.3".parse::<Ipv4Addr>().unwrap());
    assert_eq!(neighbours[0].interface, "wlan0");
    assert!((neighbours[0].etx - 2.0).abs() < 1e-9);
    assert!((neighbours[1].etx - 1.0).abs() < 1e-9);
}

#[test]
fn babel_route_derives_hops_from_metric() {
    let dump = "route 10.77.5.0/24 via 10.77.0.3 if wlan0 metric 512 refmetric 256\n\
                route 10.77.9.9/32 via 10.77.0.9 if tun20 metric 768 refmetric 512\n\
                ok\n";

    let route = parse_babel_route(dump, "10.77.9.9".parse().unwrap()).unwrap();
    assert_eq!(route.next_hop_ip, Some("10.77.0.9".parse().unwrap()));
    assert_eq!(route.hop_count, 3); // (768 + 128) / 256
    assert!((route.etx - 3.0).abs() < 1e-9);

    assert!(parse_babel_route(dump, "10.88.0.1".parse().unwrap()).is_none());
}

#[test]
fn babel_route_prefix_match_covers_destination() {
    let dump = "route 10.77.5.5/32 via 10.77.0.3 if wlan0 metric 256\nok\n";
    assert!(parse_babel_route(dump, "10.77.5.5".parse().unwrap()).is_some());
}
