//! Minimal blocking HTTP/1.0 client.
//!
//! Just enough HTTP for the daemons this agent talks to: jsoninfo on
//! loopback, the firmware sysinfo endpoint, peer hello endpoints and the
//! optional collector. GET and POST with a body, fixed receive timeout,
//! `Connection: close`, no TLS, no chunked encoding. The response headers
//! are stripped up to the blank line and only the body is returned.

use crate::core::mesh::types::MonitorError;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const GET_TIMEOUT: Duration = Duration::from_secs(5);
const POST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE: usize = 256 * 1024;

/// GET `http://host:port/path` and return the response body.
pub fn http_get(host: &str, port: u16, path: &str) -> Result<String, MonitorError> {
    let mut stream = connect(host, port, GET_TIMEOUT)?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| MonitorError::Http(format!("send to {}:{} failed: {}", host, port, e)))?;

    let raw = read_to_end_bounded(&mut stream)?;
    Ok(strip_headers(&raw).to_string())
}

/// POST a JSON body to `url` (plain `http://host[:port]/path`).
///
/// Returns `Ok` once the request went out and the response, if any, did not
/// carry an error status; an unreadable response is not treated as failure
/// because the payload has already left the node.
pub fn http_post_json(url: &str, json_body: &str) -> Result<(), MonitorError> {
    let (host, port, path) = parse_url(url)?;
    let mut stream = connect(&host, port, POST_TIMEOUT)?;

    let request = format!(
        "POST {} HTTP/1.0\r\nHost: {}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        host,
        json_body.len(),
        json_body
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| MonitorError::Http(format!("POST to {} failed: {}", url, e)))?;

    let mut status = [0u8; 512];
    match stream.read(&mut status) {
        Ok(n) if n > 0 => {
            let line = String::from_utf8_lossy(&status[..n]);
            let first = line.lines().next().unwrap_or("");
            if first.contains("200") || first.contains("202") {
                Ok(())
            } else {
                Err(MonitorError::Http(format!(
                    "collector answered '{}'",
                    first.trim()
                )))
            }
        }
        // No readable response; the POST itself succeeded.
        _ => Ok(()),
    }
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, MonitorError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|_| MonitorError::Dns(host.to_string()))?
        .next()
        .ok_or_else(|| MonitorError::Dns(host.to_string()))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| MonitorError::Http(format!("connect to {}:{} failed: {}", host, port, e)))?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();
    Ok(stream)
}

fn read_to_end_bounded(stream: &mut TcpStream) -> Result<String, MonitorError> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                raw.extend_from_slice(&buf[..n]);
                if raw.len() > MAX_RESPONSE {
                    break;
                }
            }
            Err(e) => {
                if raw.is_empty() {
                    return Err(MonitorError::Http(format!("recv failed: {}", e)));
                }
                // Partial response followed by a timeout; keep what we have.
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Drop the status line and headers, returning the body.
pub fn strip_headers(response: &str) -> &str {
    if let Some(idx) = response.find("\r\n\r\n") {
        &response[idx + 4..]
    } else if let Some(idx) = response.find("\n\n") {
        &response[idx + 2..]
    } else {
        response
    }
}

/// Split `http://host[:port]/path` into its parts. Default port 80, default
/// path `/`.
pub fn parse_url(url: &str) -> Result<(String, u16, String), MonitorError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| MonitorError::Http(format!("unsupported URL: {}", url)))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| MonitorError::Http(format!("bad port in URL: {}", url)))?;
            (h.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };

    if host.is_empty() {
        return Err(MonitorError::Http(format!("empty host in URL: {}", url)));
    }
    Ok((host, port, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing_variants() {
        assert_eq!(
            parse_url("http://10.0.0.9:8081/ingest").unwrap(),
            ("10.0.0.9".to_string(), 8081, "/ingest".to_string())
        );
        assert_eq!(
            parse_url("http://collector.local.mesh/api").unwrap(),
            ("collector.local.mesh".to_string(), 80, "/api".to_string())
        );
        assert_eq!(
            parse_url("http://127.0.0.1:9090").unwrap(),
            ("127.0.0.1".to_string(), 9090, "/".to_string())
        );
        assert!(parse_url("https://x/").is_err());
        assert!(parse_url("http://:80/").is_err());
    }

    #[test]
    fn header_stripping() {
        let resp = "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n10.0.0.5\n";
        assert_eq!(strip_headers(resp), "10.0.0.5\n");

        let bare_lf = "HTTP/1.0 200 OK\nX: y\n\nbody";
        assert_eq!(strip_headers(bare_lf), "body");

        assert_eq!(strip_headers("no headers here"), "no headers here");
    }
}
