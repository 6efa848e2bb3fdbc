//! Connection preface detection
//!
//! A client must open with the 24-byte HTTP/2 preface (RFC 9113 Section
//! 3.4). Clients that speak HTTP/1.x to this endpoint by mistake are
//! recognized by their request line and answered with a plain 400 instead
//! of a GOAWAY they would not understand.

use crate::http::CRLF;

/// The HTTP/2 client connection preface
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Longest request line we wait for before giving up on HTTP/1.x detection
const MAX_REQUEST_LINE: usize = 8192;

const HTTP1_REFUSAL_BODY: &str = "An HTTP/1.x request was sent to an HTTP/2 only endpoint.";

/// What the first bytes of a connection look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefaceStatus {
    /// Not enough bytes to decide
    Incomplete,
    /// The HTTP/2 preface, which occupies the first 24 bytes
    Http2,
    /// An HTTP/1.x request line
    Http1,
    /// Neither
    Invalid,
}

/// Classify the bytes read so far
pub fn detect(buf: &[u8]) -> PrefaceStatus {
    if buf.len() >= CONNECTION_PREFACE.len() && buf.starts_with(CONNECTION_PREFACE) {
        return PrefaceStatus::Http2;
    }
    if CONNECTION_PREFACE.starts_with(buf) {
        return PrefaceStatus::Incomplete;
    }

    let Some(end) = buf.windows(2).position(|w| w == CRLF.as_bytes()) else {
        if buf.len() < MAX_REQUEST_LINE && buf.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return PrefaceStatus::Incomplete;
        }
        return PrefaceStatus::Invalid;
    };

    match std::str::from_utf8(&buf[..end]) {
        Ok(line) if is_http1_request_line(line) => PrefaceStatus::Http1,
        _ => PrefaceStatus::Invalid,
    }
}

fn is_http1_request_line(line: &str) -> bool {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 {
        return false;
    }

    let method_ok = !parts[0].is_empty() && parts[0].bytes().all(|b| b.is_ascii_uppercase());
    let target_ok = !parts[1].is_empty();
    let version_ok = matches!(parts[2], "HTTP/1.0" | "HTTP/1.1");
    method_ok && target_ok && version_ok
}

/// The response sent to HTTP/1.x clients before closing
pub fn http1_refusal() -> Vec<u8> {
    format!(
        "HTTP/1.1 400 Bad Request{crlf}Connection: close{crlf}Content-Type: text/plain{crlf}Content-Length: {len}{crlf}{crlf}{body}",
        crlf = CRLF,
        len = HTTP1_REFUSAL_BODY.len(),
        body = HTTP1_REFUSAL_BODY,
    )
    .into_bytes()
}
