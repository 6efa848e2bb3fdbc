//! HTTP/2 frame types and payload views
//!
//! This module defines the frame types specified in RFC 9113 Section 6, the
//! generic `Frame` produced by the codec, and typed views over each frame
//! type's payload.
//!
//! Typed views are parsed from a `Frame` whose length the connection has
//! already checked against the frame's fixed width. The only structural
//! failure a view reports is inconsistent padding, returned as `None`.

use super::settings::Settings;
use bytes::{Buf, Bytes};
use std::fmt;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA frame (0x0)
    Data = 0x0,
    /// HEADERS frame (0x1)
    Headers = 0x1,
    /// PRIORITY frame (0x2)
    Priority = 0x2,
    /// RST_STREAM frame (0x3)
    RstStream = 0x3,
    /// SETTINGS frame (0x4)
    Settings = 0x4,
    /// PUSH_PROMISE frame (0x5), never valid from a client
    PushPromise = 0x5,
    /// PING frame (0x6)
    Ping = 0x6,
    /// GOAWAY frame (0x7)
    Goaway = 0x7,
    /// WINDOW_UPDATE frame (0x8)
    WindowUpdate = 0x8,
    /// CONTINUATION frame (0x9)
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create frame type from u8
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;

    /// ACK flag (0x1), used for SETTINGS and PING
    pub const ACK: u8 = 0x1;

    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;

    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;

    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    /// Create empty flags
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Create from u8
    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Get raw u8 value
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set a flag
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set a flag when `cond` holds, builder style
    pub fn with(mut self, flag: u8, cond: bool) -> Self {
        if cond {
            self.0 |= flag;
        }
        self
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// Generic HTTP/2 frame as read off the wire
///
/// The type byte is kept raw: frames of unknown type must be read and
/// discarded rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw frame type byte
    pub kind: u8,
    /// Frame flags
    pub flags: FrameFlags,
    /// Stream ID, reserved bit already cleared
    pub stream_id: u32,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame of a known type
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            kind: frame_type.as_u8(),
            flags,
            stream_id,
            payload,
        }
    }

    /// Decoded frame type, `None` for extension types
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    /// Get payload size
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Frame type name for logging
    pub fn type_name(&self) -> &'static str {
        self.frame_type().map(|t| t.name()).unwrap_or("UNKNOWN")
    }
}

/// Strip padding from a PADDED payload, returning the pad length and the
/// remaining bytes with the trailing padding removed
fn strip_padding(flags: FrameFlags, mut payload: Bytes) -> Option<(Option<u8>, Bytes)> {
    if !flags.is_padded() {
        return Some((None, payload));
    }
    if payload.is_empty() {
        return None;
    }
    let pad_len = payload.get_u8();
    // Padding as long as the whole payload (length byte included) is malformed.
    if pad_len as usize > payload.len() {
        return None;
    }
    payload.truncate(payload.len() - pad_len as usize);
    Some((Some(pad_len), payload))
}

/// DATA frame (RFC 9113 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Data payload with padding removed
    pub data: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    /// Create a new DATA frame
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Get total payload size including padding, the amount charged to
    /// flow control
    pub fn frame_size(&self) -> usize {
        let mut size = self.data.len();
        if let Some(pad_len) = self.padding {
            size += 1 + pad_len as usize;
        }
        size
    }

    /// Parse from a generic frame
    pub fn parse(frame: &Frame) -> Option<Self> {
        let (padding, data) = strip_padding(frame.flags, frame.payload.clone())?;
        Some(DataFrame {
            stream_id: frame.stream_id,
            data,
            end_stream: frame.flags.is_end_stream(),
            padding,
        })
    }
}

/// Priority specification (RFC 9113 Section 5.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Stream dependency
    pub stream_dependency: u32,
    /// Exclusive flag
    pub exclusive: bool,
    /// Weight (encoded value, actual weight is value + 1)
    pub weight: u8,
}

impl PrioritySpec {
    /// Create a new priority specification
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }

    fn parse(buf: &mut Bytes) -> Self {
        let raw = buf.get_u32();
        PrioritySpec {
            stream_dependency: raw & 0x7FFF_FFFF,
            exclusive: raw & 0x8000_0000 != 0,
            weight: buf.get_u8(),
        }
    }
}

/// HEADERS frame (RFC 9113 Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    /// END_STREAM flag
    pub end_stream: bool,
    /// END_HEADERS flag
    pub end_headers: bool,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl HeadersFrame {
    /// Create a new HEADERS frame
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
            padding: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set padding
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Parse from a generic frame
    pub fn parse(frame: &Frame) -> Option<Self> {
        let (padding, mut rest) = strip_padding(frame.flags, frame.payload.clone())?;
        let priority = if frame.flags.is_priority() {
            if rest.len() < 5 {
                return None;
            }
            Some(PrioritySpec::parse(&mut rest))
        } else {
            None
        };
        Some(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: rest,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
            padding,
        })
    }
}

/// PRIORITY frame (RFC 9113 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Priority specification
    pub priority: PrioritySpec,
}

impl PriorityFrame {
    /// Parse from a generic frame of exactly 5 bytes
    pub fn parse(frame: &Frame) -> Self {
        let mut payload = frame.payload.clone();
        PriorityFrame {
            stream_id: frame.stream_id,
            priority: PrioritySpec::parse(&mut payload),
        }
    }
}

/// RST_STREAM frame (RFC 9113 Section 6.4)
///
/// The error code stays raw; unknown codes must not be treated as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Error code
    pub error_code: u32,
}

impl RstStreamFrame {
    /// Parse from a generic frame of exactly 4 bytes
    pub fn parse(frame: &Frame) -> Self {
        RstStreamFrame {
            stream_id: frame.stream_id,
            error_code: (&frame.payload[..]).get_u32(),
        }
    }
}

/// SETTINGS frame (RFC 9113 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    /// ACK flag
    pub ack: bool,
    /// Settings parameters
    pub settings: Settings,
}

impl SettingsFrame {
    /// Create a new SETTINGS frame
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Create a SETTINGS ACK frame
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::new(),
        }
    }
}

/// PING frame (RFC 9113 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    /// ACK flag
    pub ack: bool,
    /// Opaque data (8 bytes)
    pub data: [u8; 8],
}

impl PingFrame {
    /// Create a new PING frame
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Create a PING ACK frame
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    /// Parse from a generic frame of exactly 8 bytes
    pub fn parse(frame: &Frame) -> Self {
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload[..8]);
        PingFrame {
            ack: frame.flags.is_ack(),
            data,
        }
    }
}

/// GOAWAY frame (RFC 9113 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Last stream ID
    pub last_stream_id: u32,
    /// Raw error code
    pub error_code: u32,
    /// Debug data
    pub debug_data: Bytes,
}

impl GoawayFrame {
    /// Create a new GOAWAY frame
    pub fn new(last_stream_id: u32, error_code: u32, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    /// Parse from a generic frame of at least 8 bytes
    pub fn parse(frame: &Frame) -> Self {
        let mut payload = frame.payload.clone();
        let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
        let error_code = payload.get_u32();
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data: payload,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 9113 Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// Stream ID (0 for connection-level)
    pub stream_id: u32,
    /// Window size increment
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    /// Create a new WINDOW_UPDATE frame
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    /// Parse from a generic frame of exactly 4 bytes
    pub fn parse(frame: &Frame) -> Self {
        WindowUpdateFrame {
            stream_id: frame.stream_id,
            size_increment: (&frame.payload[..]).get_u32() & 0x7FFF_FFFF,
        }
    }
}

/// CONTINUATION frame (RFC 9113 Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    /// Stream ID
    pub stream_id: u32,
    /// Header block fragment
    pub header_block: Bytes,
    /// END_HEADERS flag
    pub end_headers: bool,
}

impl ContinuationFrame {
    /// Parse from a generic frame
    pub fn parse(frame: &Frame) -> Self {
        ContinuationFrame {
            stream_id: frame.stream_id,
            header_block: frame.payload.clone(),
            end_headers: frame.flags.is_end_headers(),
        }
    }
}
