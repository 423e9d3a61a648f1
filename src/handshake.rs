//! WebSocket handshake: incremental HTTP upgrade parsing and the 101 reply
//!
//! Request bytes accumulate in a bounded buffer until the header block is
//! complete, then the upgrade is validated and the exact
//! `101 Switching Protocols` response is produced. Failures carry the HTTP
//! status that goes back on the wire before the connection is dropped.

use std::collections::BTreeMap;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// A validated upgrade request.
///
/// Header names are lower-cased and trimmed; repeated headers are joined
/// with `", "` in arrival order under the first-seen key.
#[derive(Debug)]
pub struct HandshakeRequest {
    /// The raw request line, e.g. `GET /chat HTTP/1.1`
    pub request_line: String,
    /// The request path
    pub path: String,
    headers: BTreeMap<String, String>,
}

impl HandshakeRequest {
    /// Look up a header by its lower-cased name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Iterate all headers as (lower-cased name, joined value)
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub struct Upgrade {
    /// The parsed request
    pub request: HandshakeRequest,
    /// The exact 101 response to write back
    pub response: Bytes,
    /// Bytes that arrived after the header block; they belong to the frame
    /// layer and must not be dropped
    pub leftover: Bytes,
}

/// Incremental server-side handshake parser
pub struct Handshake {
    buf: BytesMut,
    max_bytes: usize,
}

impl Handshake {
    /// Create a parser bounded at `max_bytes` of accumulated request
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(512),
            max_bytes,
        }
    }

    /// Number of request bytes accumulated so far
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed request bytes; returns the upgrade once the request is complete
    /// and valid.
    ///
    /// Returns:
    /// - `Ok(Some(upgrade))` when the request parsed and validated
    /// - `Ok(None)` while the header block is still incomplete
    /// - `Err(e)` with the HTTP status to send before dropping the peer
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Upgrade>> {
        self.buf.extend_from_slice(data);

        if self.buf.len() > self.max_bytes {
            return Err(Error::http(413, "handshake exceeds size limit"));
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);

        let consumed = match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(Error::http(400, "malformed HTTP request")),
        };

        let request = validate_request(&req)?;
        let key = request
            .header("sec-websocket-key")
            .ok_or(Error::http(400, "missing Sec-WebSocket-Key"))?;
        let response = build_accept_response(&accept_key(key));
        let leftover = self.buf.split_off(consumed).freeze();

        Ok(Some(Upgrade {
            request,
            response,
            leftover,
        }))
    }
}

/// Run the upgrade checks of RFC 6455 §4.2.1 against a parsed request
fn validate_request(req: &httparse::Request<'_, '_>) -> Result<HandshakeRequest> {
    if req.version != Some(1) {
        return Err(Error::http(400, "request line is not HTTP/1.1"));
    }
    if req.method != Some("GET") {
        return Err(Error::http(400, "method must be GET"));
    }
    let path = req.path.unwrap_or("/").to_string();
    let request_line = format!("{} {} HTTP/1.1", req.method.unwrap_or(""), path);

    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for header in req.headers.iter() {
        let name = header.name.trim().to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::http(400, "header value is not valid UTF-8"))?
            .trim();
        match map.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                map.insert(name, value.to_string());
            }
        }
    }

    let request = HandshakeRequest {
        request_line,
        path,
        headers: map,
    };

    if !header_has_token(&request, "connection", "upgrade") {
        return Err(Error::http(400, "Connection header does not request upgrade"));
    }
    if !header_has_token(&request, "upgrade", "websocket") {
        return Err(Error::http(400, "Upgrade header is not websocket"));
    }
    if request.header("sec-websocket-version") != Some("13") {
        return Err(Error::http(400, "unsupported Sec-WebSocket-Version"));
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(Error::http(400, "missing Sec-WebSocket-Key"))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| Error::http(400, "Sec-WebSocket-Key is not valid base64"))?;
    if decoded.len() != 16 {
        return Err(Error::http(400, "Sec-WebSocket-Key must decode to 16 bytes"));
    }

    Ok(request)
}

/// Case-insensitive membership test on a comma-separated header value
fn header_has_token(req: &HandshakeRequest, name: &str, token: &str) -> bool {
    req.header(name)
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Compute `base64(SHA1(key ++ GUID))` per RFC 6455 §1.3
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the exact 101 response for a computed accept key
fn build_accept_response(accept: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// Build the bare `HTTP/1.1 <code> <phrase>` response sent on handshake
/// failure
pub fn build_error_response(status: u16) -> Bytes {
    let phrase = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Error",
    };
    Bytes::from(format!("HTTP/1.1 {} {}\r\n\r\n", status, phrase))
}
