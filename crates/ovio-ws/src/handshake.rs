//! HTTP/1.1 upgrade handshake.

use crate::settings::SessionSettings;

use ovio_core::error::{OvioError, Result};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::io::{BufRead, Read};

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Longest response head accepted before giving up.
const MAX_HEAD: usize = 16 * 1024;

/// Status codes that redirect the upgrade instead of failing it.
pub const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

pub const SWITCHING_PROTOCOLS: u16 = 101;

#[inline]
pub fn is_redirect(status: u16) -> bool {
    REDIRECT_CODES.contains(&status)
}

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// `Sec-WebSocket-Accept` expected for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// GET request asking `settings.host` to upgrade `path`.
pub fn build_request(settings: &SessionSettings, path: &str, key: &str) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let mut req = String::with_capacity(256);
    let _ = write!(req, "GET {} HTTP/1.1\r\n", path);
    let _ = write!(req, "Host: {}:{}\r\n", settings.host, settings.port);
    let _ = write!(req, "User-Agent: {}\r\n", settings.user_agent);
    req.push_str("Upgrade: websocket\r\n");
    req.push_str("Connection: Upgrade\r\n");
    let _ = write!(req, "Sec-WebSocket-Key: {}\r\n", key);
    req.push_str("Sec-WebSocket-Version: 13\r\n");
    for (name, value) in &settings.headers {
        let _ = write!(req, "{}: {}\r\n", name, value);
    }
    req.push_str("\r\n");
    req
}

/// Parsed response status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check the headers of a `101` against the key we sent.
    pub fn verify_upgrade(&self, key: &str) -> Result<()> {
        if self.status != SWITCHING_PROTOCOLS {
            return Err(OvioError::protocol(format!("upgrade refused with status {}", self.status)));
        }
        let upgrade = self.header("Upgrade").unwrap_or_default();
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(OvioError::protocol(format!("unexpected Upgrade header {:?}", upgrade)));
        }
        let connection = self.header("Connection").unwrap_or_default();
        if !connection.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")) {
            return Err(OvioError::protocol(format!("unexpected Connection header {:?}", connection)));
        }
        match self.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(key) => Ok(()),
            Some(accept) => Err(OvioError::protocol(format!("bad Sec-WebSocket-Accept {:?}", accept))),
            None => Err(OvioError::protocol("missing Sec-WebSocket-Accept")),
        }
    }
}

/// Read a response head, up to and including the blank line.
pub fn read_response<R: BufRead>(r: &mut R) -> Result<Response> {
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let mut line = String::new();
        // One byte past the limit tells an oversized head from a short one
        let limit = (MAX_HEAD - total) as u64 + 1;
        let n = r.by_ref().take(limit).read_line(&mut line)?;
        total += n;
        if total > MAX_HEAD {
            return Err(OvioError::protocol("response head too large"));
        }
        if !line.ends_with('\n') {
            return Err(OvioError::BrokenChannel("connection closed during handshake".into()));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    parse_response(&lines)
}

fn parse_response(lines: &[String]) -> Result<Response> {
    let status_line = lines
        .first()
        .ok_or_else(|| OvioError::protocol("empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(OvioError::protocol(format!("bad status line {:?}", status_line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| OvioError::protocol(format!("bad status line {:?}", status_line)))?;

    let mut headers = Vec::with_capacity(lines.len() - 1);
    for line in &lines[1..] {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| OvioError::protocol(format!("bad header line {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Response { status, headers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_accept_key_rfc_sample() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_key();
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 16);
        assert_ne!(a, generate_key());
    }

    #[test]
    fn test_request_contains_headers() {
        let settings = SessionSettings::new("localhost", 9001).header("Authorization", "Bearer t");
        let req = build_request(&settings, "", "k==");
        assert!(req.starts_with("GET / HTTP/1.1\r\n"));
        assert!(req.contains("Host: localhost:9001\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: k==\r\n"));
        assert!(req.contains("Authorization: Bearer t\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_read_and_verify() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let raw = "HTTP/1.1 101 Switching Protocols\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\nrest";
        let mut cursor = Cursor::new(raw.as_bytes());
        let resp = read_response(&mut cursor).unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(resp.header("upgrade"), Some("websocket"));
        resp.verify_upgrade(key).unwrap();
        assert!(resp.verify_upgrade("other").is_err());
        assert_eq!(cursor.position() as usize, raw.len() - 4);
    }

    #[test]
    fn test_redirect_and_garbage() {
        let raw = "HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\n\r\n";
        let resp = read_response(&mut Cursor::new(raw.as_bytes())).unwrap();
        assert!(is_redirect(resp.status));
        assert!(!is_redirect(200));

        assert!(read_response(&mut Cursor::new(&b"SSH-2.0\r\n\r\n"[..])).is_err());
        assert!(read_response(&mut Cursor::new(&b"HTTP/1.1 101"[..])).is_err());
    }

    #[test]
    fn test_endless_header_line_bounded() {
        // Never sends a line break
        let mut endless = std::io::BufReader::new(std::io::repeat(b'a'));
        assert!(matches!(read_response(&mut endless), Err(OvioError::Protocol(_))));

        let mut head = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
        head.extend(std::iter::repeat(b'x').take(MAX_HEAD));
        head.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(read_response(&mut Cursor::new(head)), Err(OvioError::Protocol(_))));
    }
}
