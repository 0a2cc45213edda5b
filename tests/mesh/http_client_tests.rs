use meshmon::core::mesh::http_client::{http_get, http_post_json};
use std::io::{Read, Write};
use std::net::TcpListener;

/// One-shot HTTP server answering with a canned response. Returns the port
/// and a handle that yields the request it received.
fn serve_once(response: &'static str) -> (u16, std::thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).unwrap_or(0);
        stream.write_all(response.as_bytes()).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    });
    (port, handle)
}

#[test]
fn get_strips_headers_and_returns_body() {
    let (port, handle) = serve_once(
        "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{\"hosts\":[]}",
    );

    let body = http_get("127.0.0.1", port, "/cgi-bin/sysinfo.json?hosts=1").unwrap();
    assert_eq!(body, "{\"hosts\":[]}");

    let request = handle.join().unwrap();
    assert!(request.starts_with("GET /cgi-bin/sysinfo.json?hosts=1 HTTP/1.0\r\n"));
    assert!(request.contains("Connection: close"));
}

#[test]
fn get_fails_when_nothing_listens() {
    // A freshly bound-then-dropped port is very likely unused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    assert!(http_get("127.0.0.1", port, "/").is_err());
}

#[test]
fn post_carries_body_and_accepts_200() {
    let (port, handle) = serve_once("HTTP/1.0 200 OK\r\n\r\n");

    let url = format!("http://127.0.0.1:{}/ingest", port);
    http_post_json(&url, "{\"schema\":\"meshmon.v1\"}").unwrap();

    let request = handle.join().unwrap();
    assert!(request.starts_with("POST /ingest HTTP/1.0\r\n"));
    assert!(request.contains("Content-Type: application/json"));
    assert!(request.contains("Content-Length: 23"));
    assert!(request.ends_with("{\"schema\":\"meshmon.v1\"}"));
}

#[test]
fn post_accepts_202_and_rejects_500() {
    let (port, handle) = serve_once("HTTP/1.0 202 Accepted\r\n\r\n");
    let url = format!("http://127.0.0.1:{}/ingest", port);
    assert!(http_post_json(&url, "{}").is_ok());
    handle.join().unwrap();

    let (port, handle) = serve_once("HTTP/1.0 500 Internal Server Error\r\n\r\n");
    let url = format!("http://127.0.0.1:{}/ingest", port);
    assert!(http_post_json(&url, "{}").is_err());
    handle.join().unwrap();
}
