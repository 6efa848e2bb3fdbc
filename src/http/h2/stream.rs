//! HTTP/2 stream state
//!
//! This module implements the server side of the stream lifecycle described
//! in RFC 9113 Section 5.1, plus request header validation (Section 8.3).
//!
//! A `Stream` is owned by exactly one structure at a time: the connection's
//! stream map, the completed-stream drain queue, or the stream pool. Its
//! body pipe and output producer are shared with the application worker and
//! the output scheduler through `Arc`s.

use super::error::{ErrorCode, ProtocolError};
use super::pipe::{BodyPipe, OutputProducer};
use crate::http::headers::HEADER_FIELD_OVERHEAD;
use crate::http::Headers;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as seen by the server (RFC 9113 Section 5.1)
///
/// Server push is never used, so the reserved states cannot occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been received
    Idle,
    /// Open: Request headers received, request body may follow
    Open,
    /// Half-closed (remote): The client sent END_STREAM
    HalfClosedRemote,
    /// Closed: Response flushed and the client is done, or the stream was reset
    Closed,
}

impl StreamState {
    /// Check if the client may still send DATA
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Completion flags
///
/// Independent bits that are only ever set, until the stream is reset for
/// reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionFlags(u8);

impl CompletionFlags {
    pub const RST_RECEIVED: u8 = 0x1;
    pub const END_STREAM_RECEIVED: u8 = 0x2;
    pub const ABORTED: u8 = 0x4;

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Request pseudo-header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    Method,
    Scheme,
    Authority,
    Path,
    Protocol,
}

impl PseudoHeader {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b":method" => Some(PseudoHeader::Method),
            b":scheme" => Some(PseudoHeader::Scheme),
            b":authority" => Some(PseudoHeader::Authority),
            b":path" => Some(PseudoHeader::Path),
            b":protocol" => Some(PseudoHeader::Protocol),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        match self {
            PseudoHeader::Method => 0x01,
            PseudoHeader::Scheme => 0x02,
            PseudoHeader::Authority => 0x04,
            PseudoHeader::Path => 0x08,
            PseudoHeader::Protocol => 0x10,
        }
    }
}

/// Decoded request head
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// Extended CONNECT protocol (RFC 8441)
    pub protocol: Option<String>,
    pub headers: Headers,
}

impl RequestHead {
    fn set_pseudo(&mut self, field: PseudoHeader, value: String) {
        let slot = match field {
            PseudoHeader::Method => &mut self.method,
            PseudoHeader::Scheme => &mut self.scheme,
            PseudoHeader::Authority => &mut self.authority,
            PseudoHeader::Path => &mut self.path,
            PseudoHeader::Protocol => &mut self.protocol,
        };
        *slot = Some(value);
    }

    pub fn is_connect(&self) -> bool {
        self.method.as_deref() == Some("CONNECT")
    }
}

/// Where the header block being decoded currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPhase {
    Ready,
    PseudoHeaderFields,
    Headers,
    Trailers,
}

/// A header field that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedField {
    Pseudo(PseudoHeader, String),
    Regular(String, String),
}

/// Incremental validator for one request header block or trailer block
///
/// Every failure here is a connection error: by the time a field is seen
/// the shared HPACK table has already been updated.
#[derive(Debug, Clone)]
pub struct HeaderValidator {
    phase: HeaderPhase,
    seen: u8,
    list_size: usize,
    max_list_size: usize,
    enable_connect_protocol: bool,
}

impl HeaderValidator {
    pub fn new(max_list_size: usize, enable_connect_protocol: bool) -> Self {
        HeaderValidator {
            phase: HeaderPhase::Ready,
            seen: 0,
            list_size: 0,
            max_list_size,
            enable_connect_protocol,
        }
    }

    /// Start a request header block
    pub fn begin_headers(&mut self) {
        self.phase = HeaderPhase::Ready;
        self.seen = 0;
        self.list_size = 0;
    }

    /// Start a trailer block
    pub fn begin_trailers(&mut self) {
        self.phase = HeaderPhase::Trailers;
        self.list_size = 0;
    }

    pub fn phase(&self) -> HeaderPhase {
        self.phase
    }

    /// Validate one decoded field
    pub fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<ValidatedField, ProtocolError> {
        self.list_size += name.len() + value.len() + HEADER_FIELD_OVERHEAD;
        if self.list_size > self.max_list_size {
            return Err(malformed("request headers exceed the maximum header list size"));
        }

        let trailers = self.phase == HeaderPhase::Trailers;

        if name.first() == Some(&b':') {
            if trailers {
                return Err(malformed("trailers contain a pseudo-header field"));
            }
            if self.phase == HeaderPhase::Headers {
                return Err(malformed("pseudo-header field after regular header fields"));
            }
            if name == b":status" {
                return Err(malformed("request contains the :status pseudo-header"));
            }
            let field = match PseudoHeader::from_name(name) {
                Some(PseudoHeader::Protocol) if !self.enable_connect_protocol => None,
                other => other,
            }
            .ok_or_else(|| {
                malformed(format!(
                    "unknown pseudo-header field {}",
                    String::from_utf8_lossy(name)
                ))
            })?;
            if self.seen & field.bit() != 0 {
                return Err(malformed(format!(
                    "duplicate pseudo-header field {}",
                    String::from_utf8_lossy(name)
                )));
            }
            self.seen |= field.bit();
            self.phase = HeaderPhase::PseudoHeaderFields;
            return Ok(ValidatedField::Pseudo(field, field_value(value)));
        }

        if !trailers {
            self.phase = HeaderPhase::Headers;
        }

        if name == b"connection" || (name == b"te" && value != b"trailers") {
            return Err(malformed("connection-specific header field"));
        }
        if name.iter().any(u8::is_ascii_uppercase) {
            return Err(malformed(if trailers {
                "trailer field name contains uppercase characters"
            } else {
                "header field name contains uppercase characters"
            }));
        }

        let name = std::str::from_utf8(name)
            .map_err(|_| malformed("header field name is not valid UTF-8"))?
            .to_string();
        Ok(ValidatedField::Regular(name, field_value(value)))
    }
}

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::connection(ErrorCode::ProtocolError, reason)
}

fn field_value(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// One HTTP/2 stream
pub struct Stream {
    id: StreamId,
    flags: CompletionFlags,
    head: RequestHead,
    trailers: Headers,
    validator: HeaderValidator,
    /// Body bytes still expected per content-length
    input_remaining: Option<u64>,
    pipe: Arc<BodyPipe>,
    producer: Arc<OutputProducer>,
    output_completed: bool,
    drain_expiration: Option<Instant>,
}

impl Stream {
    pub fn new(
        id: StreamId,
        pipe: Arc<BodyPipe>,
        producer: Arc<OutputProducer>,
        validator: HeaderValidator,
    ) -> Self {
        Stream {
            id,
            flags: CompletionFlags::default(),
            head: RequestHead::default(),
            trailers: Headers::new(),
            validator,
            input_remaining: None,
            pipe,
            producer,
            output_completed: false,
            drain_expiration: None,
        }
    }

    /// Bring a pooled stream back as a blank slate
    pub fn reset(&mut self, id: StreamId, receive_window: u32, send_window: u32) {
        self.id = id;
        self.flags = CompletionFlags::default();
        self.head = RequestHead::default();
        self.trailers.clear();
        self.validator.begin_headers();
        self.input_remaining = None;
        self.pipe.reset(id, receive_window);
        self.producer.reset(id, send_window);
        self.output_completed = false;
        self.drain_expiration = None;
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        let remote_done = self.end_stream_received() || self.rst_received();
        if self.rst_received() || (remote_done && self.output_completed) {
            StreamState::Closed
        } else if self.end_stream_received() {
            StreamState::HalfClosedRemote
        } else if self.head.method.is_some() || self.validator.phase() != HeaderPhase::Ready {
            StreamState::Open
        } else {
            StreamState::Idle
        }
    }

    pub fn flags(&self) -> CompletionFlags {
        self.flags
    }

    pub fn rst_received(&self) -> bool {
        self.flags.contains(CompletionFlags::RST_RECEIVED)
    }

    pub fn end_stream_received(&self) -> bool {
        self.flags.contains(CompletionFlags::END_STREAM_RECEIVED)
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.contains(CompletionFlags::ABORTED)
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Hand the decoded request head to the application
    pub fn take_head(&mut self) -> RequestHead {
        std::mem::take(&mut self.head)
    }

    pub fn pipe(&self) -> &Arc<BodyPipe> {
        &self.pipe
    }

    pub fn producer(&self) -> &Arc<OutputProducer> {
        &self.producer
    }

    /// Start decoding a trailer block
    pub fn begin_trailers(&mut self) {
        self.trailers.clear();
        self.validator.begin_trailers();
    }

    pub fn is_receiving_trailers(&self) -> bool {
        self.validator.phase() == HeaderPhase::Trailers
    }

    /// Accept one decoded request header or trailer field
    pub fn on_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), ProtocolError> {
        let trailers = self.is_receiving_trailers();
        match self.validator.on_header(name, value)? {
            ValidatedField::Pseudo(field, value) => self.head.set_pseudo(field, value),
            ValidatedField::Regular(name, value) if trailers => self.trailers.insert(name, value),
            ValidatedField::Regular(name, value) => self.head.headers.insert(name, value),
        }
        Ok(())
    }

    /// Check the request head once the header block is complete
    ///
    /// Failures are stream errors; the header block itself decoded fine.
    pub fn validate_request(&mut self) -> Result<(), ProtocolError> {
        let head = &self.head;

        if head.method.as_deref().map_or(true, str::is_empty) {
            return Err(self.malformed("missing :method pseudo-header"));
        }

        if head.is_connect() {
            if head.authority.is_none() {
                return Err(self.malformed("CONNECT request without :authority"));
            }
            if head.protocol.is_some() {
                if head.scheme.is_none() || head.path.is_none() {
                    return Err(self.malformed("extended CONNECT without :scheme and :path"));
                }
            } else if head.scheme.is_some() || head.path.is_some() {
                return Err(self.malformed("CONNECT request with :scheme or :path"));
            }
        } else {
            if head.protocol.is_some() {
                return Err(self.malformed(":protocol on a non-CONNECT request"));
            }
            if head.scheme.is_none() {
                return Err(self.malformed("missing :scheme pseudo-header"));
            }
            match head.path.as_deref() {
                None | Some("") => return Err(self.malformed("missing :path pseudo-header")),
                Some("*") if head.method.as_deref() == Some("OPTIONS") => {}
                Some(path) if path.starts_with('/') => {}
                Some(_) => return Err(self.malformed("invalid :path pseudo-header")),
            }
        }

        if let Some(value) = head.headers.get("content-length") {
            let length = value
                .trim()
                .parse::<u64>()
                .map_err(|_| self.malformed("invalid content-length"))?;
            self.input_remaining = Some(length);
        }
        Ok(())
    }

    /// Deliver a DATA frame's body bytes
    ///
    /// `flow_len` is the full frame payload including padding.
    pub fn on_data(&mut self, data: Bytes, flow_len: usize, end_stream: bool) -> Result<(), ProtocolError> {
        if let Some(remaining) = self.input_remaining {
            if data.len() as u64 > remaining {
                // Still charge the windows so the connection stays in sync.
                self.pipe.receive(Bytes::new(), flow_len)?;
                return Err(self.malformed("request body exceeds content-length"));
            }
            self.input_remaining = Some(remaining - data.len() as u64);
        }

        self.pipe.receive(data, flow_len)?;

        if end_stream {
            self.on_end_stream_received()?;
        }
        Ok(())
    }

    /// Handle END_STREAM from the client
    pub fn on_end_stream_received(&mut self) -> Result<(), ProtocolError> {
        self.flags.set(CompletionFlags::END_STREAM_RECEIVED);

        if self.input_remaining.map_or(false, |r| r > 0) {
            return Err(self.malformed("request body shorter than content-length"));
        }

        if !self.trailers.is_empty() {
            self.pipe.set_trailers(self.trailers.clone());
        }
        self.pipe.complete();
        Ok(())
    }

    /// Handle RST_STREAM from the client
    pub fn on_rst_received(&mut self) {
        self.flags.set(CompletionFlags::RST_RECEIVED);
        self.abort();
    }

    /// Abort the stream's body and output
    pub fn abort(&mut self) {
        self.flags.set(CompletionFlags::ABORTED);
        self.pipe.abort();
        self.producer.abort();
    }

    /// Record that the application finished with this stream
    pub fn on_output_completed(&mut self, aborted: bool) {
        self.output_completed = true;
        if aborted {
            self.flags.set(CompletionFlags::ABORTED);
        }
    }

    pub fn output_completed(&self) -> bool {
        self.output_completed
    }

    /// Whether the stream object may go back to the pool
    ///
    /// Nothing else may still hold its pipe, and the producer must be out
    /// of the scheduler's hands.
    pub fn can_reuse(&self) -> bool {
        !self.is_aborted()
            && self.output_completed
            && !self.pipe.is_aborted()
            && self.producer.is_released()
            && Arc::strong_count(&self.pipe) == 1
    }

    pub fn drain_expiration(&self) -> Option<Instant> {
        self.drain_expiration
    }

    pub fn set_drain_expiration(&mut self, at: Instant) {
        self.drain_expiration = Some(at);
    }

    fn malformed(&self, reason: &str) -> ProtocolError {
        ProtocolError::stream(self.id, ErrorCode::ProtocolError, reason)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::h2::pipe::ConnectionInput;
    use crate::http::h2::writer::tests::capture_writer;
    use std::sync::atomic::AtomicUsize;

    pub(crate) fn test_stream(id: StreamId) -> Stream {
        let (writer, _capture) = capture_writer();
        let connection = Arc::new(ConnectionInput::new(65_535, writer));
        let (tx, _) = crossbeam_channel::unbounded();
        Stream::new(
            id,
            Arc::new(BodyPipe::new(id, 65_535, connection)),
            Arc::new(OutputProducer::new(id, 65_535, tx, Arc::new(AtomicUsize::new(1)))),
            HeaderValidator::new(16 * 1024, false),
        )
    }

    fn get_request(stream: &mut Stream) {
        stream.on_header(b":method", b"GET").unwrap();
        stream.on_header(b":scheme", b"http").unwrap();
        stream.on_header(b":path", b"/").unwrap();
        stream.on_header(b":authority", b"a").unwrap();
    }

    #[test]
    fn test_valid_request_head() {
        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.on_header(b"accept", b"*/*").unwrap();
        stream.validate_request().unwrap();
        assert_eq!(stream.head().path.as_deref(), Some("/"));
        assert_eq!(stream.head().headers.get("accept"), Some("*/*"));
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[test]
    fn test_pseudo_after_regular_is_connection_error() {
        let mut stream = test_stream(1);
        stream.on_header(b":method", b"GET").unwrap();
        stream.on_header(b"accept", b"*/*").unwrap();
        let err = stream.on_header(b":path", b"/").unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_invalid_fields_rejected() {
        for (name, value) in [
            (&b":status"[..], &b"200"[..]),
            (b":foo", b"bar"),
            (b":protocol", b"websocket"),
            (b"connection", b"keep-alive"),
            (b"te", b"gzip"),
            (b"Accept", b"*/*"),
        ] {
            let mut stream = test_stream(1);
            let err = stream.on_header(name, value).unwrap_err();
            assert!(err.is_connection_error(), "{:?}", name);
        }

        let mut stream = test_stream(1);
        stream.on_header(b"te", b"trailers").unwrap();
    }

    #[test]
    fn test_duplicate_pseudo_header() {
        let mut stream = test_stream(1);
        stream.on_header(b":path", b"/").unwrap();
        assert!(stream.on_header(b":path", b"/x").is_err());
    }

    #[test]
    fn test_header_list_size_limit() {
        let mut validator = HeaderValidator::new(100, false);
        validator.on_header(b"a", &[b'x'; 40]).unwrap();
        let err = validator.on_header(b"b", &[b'x'; 40]).unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_missing_pseudo_headers_is_stream_error() {
        let mut stream = test_stream(3);
        stream.on_header(b":method", b"GET").unwrap();
        stream.on_header(b":scheme", b"http").unwrap();
        let err = stream.validate_request().unwrap_err();
        assert!(!err.is_connection_error());
        assert_eq!(err.stream_id, 3);
    }

    #[test]
    fn test_connect_requires_authority_only() {
        let mut stream = test_stream(1);
        stream.on_header(b":method", b"CONNECT").unwrap();
        stream.on_header(b":authority", b"example.com:443").unwrap();
        stream.validate_request().unwrap();

        let mut stream = test_stream(1);
        stream.on_header(b":method", b"CONNECT").unwrap();
        stream.on_header(b":authority", b"example.com:443").unwrap();
        stream.on_header(b":path", b"/").unwrap();
        assert!(stream.validate_request().is_err());
    }

    #[test]
    fn test_trailers_reject_pseudo_headers() {
        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.begin_trailers();
        assert!(stream.on_header(b":path", b"/").is_err());

        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.begin_trailers();
        stream.on_header(b"x-checksum", b"abc").unwrap();
        stream.on_end_stream_received().unwrap();
        assert_eq!(stream.pipe().trailers().unwrap().get("x-checksum"), Some("abc"));
    }

    #[test]
    fn test_content_length_exceeded() {
        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.on_header(b"content-length", b"10").unwrap();
        stream.validate_request().unwrap();

        stream.on_data(Bytes::from(vec![0u8; 6]), 6, false).unwrap();
        let err = stream.on_data(Bytes::from(vec![0u8; 5]), 5, true).unwrap_err();
        assert!(!err.is_connection_error());
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_content_length_short() {
        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.on_header(b"content-length", b"10").unwrap();
        stream.validate_request().unwrap();
        let err = stream.on_data(Bytes::from(vec![0u8; 4]), 4, true).unwrap_err();
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_flags_and_state() {
        let mut stream = test_stream(1);
        assert_eq!(stream.state(), StreamState::Idle);
        get_request(&mut stream);
        stream.validate_request().unwrap();
        stream.on_end_stream_received().unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        stream.on_rst_received();
        assert!(stream.rst_received() && stream.is_aborted());
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.can_reuse());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut stream = test_stream(1);
        get_request(&mut stream);
        stream.on_rst_received();
        stream.reset(5, 65_535, 65_535);
        assert_eq!(stream.id(), 5);
        assert!(stream.flags().is_empty());
        assert_eq!(stream.head(), &RequestHead::default());
        assert!(!stream.pipe().is_aborted());
        assert!(!stream.producer().is_aborted());
    }
}
