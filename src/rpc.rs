//! Minimal HTTP/1.1 helpers for the chain index and RPC endpoints.
//!
//! Only plain `http://` endpoints are spoken here (TLS terminates at a
//! local proxy or gateway). Every call carries a connect and read
//! timeout so a stalled upstream degrades to "not found" instead of
//! hanging the request.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::Value;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

fn parse_http_url(url: &str) -> Option<ParsedUrl> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return None;
    }
    Some(ParsedUrl { host, port, path })
}

fn open_stream(host: &str, port: u16) -> Option<TcpStream> {
    let addr = (host, port).to_socket_addrs().ok()?.next()?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).ok()?;
    stream.set_read_timeout(Some(IO_TIMEOUT)).ok()?;
    stream.set_write_timeout(Some(IO_TIMEOUT)).ok()?;
    Some(stream)
}

fn read_response(stream: &mut TcpStream) -> Option<(u16, String)> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).ok()?;
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let status_line = head.lines().next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let body_bytes = &raw[split + 4..];
    let body = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        dechunk(body_bytes)?
    } else {
        body_bytes.to_vec()
    };
    Some((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Reassemble a chunked body by reading each size line and then exactly
/// that many bytes, so body content that happens to look like a chunk
/// size passes through untouched.
fn dechunk(mut rest: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = rest.windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size_field = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_field, 16).ok()?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if rest.len() < size {
            return None;
        }
        out.extend_from_slice(&rest[..size]);
        // Skip the CRLF that terminates the chunk data.
        rest = rest.get(size + 2..)?;
    }
}

/// GET `url`, expecting a JSON body. Any transport/parse failure and any
/// non-2xx status collapse to `None` — callers treat that as "not found",
/// never as "invalid".
pub fn get_json(url: &str, bearer: Option<&str>) -> Option<Value> {
    let parsed = parse_http_url(url)?;
    let mut stream = open_stream(&parsed.host, parsed.port)?;
    let auth = match bearer {
        Some(key) => format!("Authorization: Bearer {key}\r\n"),
        None => String::new(),
    };
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\n{}Connection: close\r\n\r\n",
        parsed.path, parsed.host, auth
    );
    stream.write_all(request.as_bytes()).ok()?;
    let (status, body) = read_response(&mut stream)?;
    if !(200..300).contains(&status) {
        return None;
    }
    serde_json::from_str(body.trim()).ok()
}

/// POST a JSON body to `url`. Returns the response body on 2xx, an error
/// string otherwise so the transfer layer can surface a submission reason.
pub fn post_json(url: &str, bearer: Option<&str>, body: &Value) -> Result<Value, String> {
    let parsed = parse_http_url(url).ok_or_else(|| format!("unsupported endpoint url: {url}"))?;
    let mut stream =
        open_stream(&parsed.host, parsed.port).ok_or_else(|| "connect failed".to_string())?;
    let payload = body.to_string();
    let auth = match bearer {
        Some(key) => format!("Authorization: Bearer {key}\r\n"),
        None => String::new(),
    };
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
        parsed.path,
        parsed.host,
        payload.len(),
        auth,
        payload
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("write failed: {e}"))?;
    let (status, body) = read_response(&mut stream).ok_or_else(|| "bad response".to_string())?;
    if !(200..300).contains(&status) {
        return Err(format!("endpoint returned status {status}"));
    }
    serde_json::from_str(body.trim()).map_err(|e| format!("invalid response body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        let u = parse_http_url("http://localhost:8080/v2/tx/abc").unwrap();
        assert_eq!(u.host, "localhost");
        assert_eq!(u.port, 8080);
        assert_eq!(u.path, "/v2/tx/abc");

        let u = parse_http_url("http://indexer.internal").unwrap();
        assert_eq!(u.port, 80);
        assert_eq!(u.path, "/");

        assert!(parse_http_url("https://tonapi.io/v2").is_none());
        assert!(parse_http_url("ftp://x").is_none());
    }

    #[test]
    fn chunked_bodies_reassemble_by_size_not_content() {
        // The second chunk carries a bare numeric line that a naive
        // line filter would mistake for a chunk size.
        let body = b"5\r\n{\"n\":\r\n6\r\n\n123\n}\r\n0\r\n\r\n";
        assert_eq!(dechunk(body).unwrap(), b"{\"n\":\n123\n}");

        // Chunk-extension parameters on the size line are ignored.
        let body = b"3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\n\r\n";
        assert_eq!(dechunk(body).unwrap(), b"abcde");

        // Truncated data is a parse failure, not a partial body.
        assert!(dechunk(b"a\r\nshort\r\n").is_none());
    }

    #[test]
    fn unreachable_get_is_none_not_panic() {
        // Reserved TEST-NET-1 address, nothing listens there.
        assert!(get_json("http://192.0.2.1:9/none", None).is_none());
    }
}
