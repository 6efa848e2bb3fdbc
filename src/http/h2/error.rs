//! HTTP/2 error types
//!
//! This module defines the engine's error type and the protocol error value
//! that frame dispatch propagates. Error codes follow RFC 9113 Section 7.
//!
//! A `ProtocolError` carries its scope: a stream error is answered with
//! RST_STREAM and the connection keeps going, a connection error is answered
//! with GOAWAY and the connection is torn down.

use std::fmt;

/// HTTP/2 engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the transport session
    #[error("Session error: {0}")]
    Session(#[from] crate::http::Error),

    /// Protocol violation, scoped to a stream or the whole connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The stream was aborted before the operation could complete
    #[error("Stream {0} aborted")]
    StreamAborted(u32),

    /// The application handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Timeout waiting for operation
    #[error("Timeout")]
    Timeout,

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// True when the peer simply went away
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Session(crate::http::Error::ConnectionClosed) => true,
            Error::Io(e) | Error::Session(crate::http::Error::Io(e)) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 9113 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Which part of the connection a protocol error poisons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Answered with RST_STREAM; siblings are unaffected
    Stream,
    /// Answered with GOAWAY followed by teardown
    Connection,
}

/// A protocol violation raised during frame processing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{scope:?} error {code} on stream {stream_id}: {reason}")]
pub struct ProtocolError {
    pub scope: ErrorScope,
    pub code: ErrorCode,
    /// Offending stream, 0 for the connection itself
    pub stream_id: u32,
    pub reason: String,
}

impl ProtocolError {
    /// Create a stream-scoped error
    pub fn stream(stream_id: u32, code: ErrorCode, reason: impl Into<String>) -> Self {
        ProtocolError {
            scope: ErrorScope::Stream,
            code,
            stream_id,
            reason: reason.into(),
        }
    }

    /// Create a connection-scoped error
    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        ProtocolError {
            scope: ErrorScope::Connection,
            code,
            stream_id: 0,
            reason: reason.into(),
        }
    }

    /// Check whether this error tears down the connection
    pub fn is_connection_error(&self) -> bool {
        self.scope == ErrorScope::Connection
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
