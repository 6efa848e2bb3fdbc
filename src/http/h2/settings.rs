//! HTTP/2 settings management
//!
//! This module implements SETTINGS payloads (RFC 9113 Section 6.5) and the
//! effective per-peer settings the connection keeps for both endpoints.

use super::error::{ErrorCode, ProtocolError};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Protocol default for SETTINGS_HEADER_TABLE_SIZE
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Protocol default for SETTINGS_INITIAL_WINDOW_SIZE
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Protocol default for SETTINGS_MAX_FRAME_SIZE
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Largest legal SETTINGS_MAX_FRAME_SIZE
pub const MAX_ALLOWED_FRAME_SIZE: u32 = 16_777_215;

/// Largest legal flow-control window
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Size of one encoded setting
pub const SETTING_SIZE: usize = 6;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,

    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    EnableConnectProtocol = 0x8,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// Contents of one SETTINGS frame
///
/// Only parameters present in the frame are `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Parse and validate a SETTINGS payload
    ///
    /// The payload length must already be a multiple of six. Unknown
    /// parameters are ignored. Out of range values are connection errors:
    /// FLOW_CONTROL_ERROR for the initial window size, PROTOCOL_ERROR for
    /// everything else.
    pub fn parse(payload: &[u8]) -> std::result::Result<Settings, ProtocolError> {
        let mut settings = Settings::new();
        for mut chunk in payload.chunks_exact(SETTING_SIZE) {
            let id = chunk.get_u16();
            let value = chunk.get_u32();

            let Some(param) = SettingsParameter::from_u16(id) else {
                continue;
            };

            match param {
                SettingsParameter::HeaderTableSize => settings.header_table_size = Some(value),
                SettingsParameter::EnablePush => {
                    settings.enable_push = Some(parse_flag(param, value)?);
                }
                SettingsParameter::MaxConcurrentStreams => {
                    settings.max_concurrent_streams = Some(value)
                }
                SettingsParameter::InitialWindowSize => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(ProtocolError::connection(
                            ErrorCode::FlowControlError,
                            format!("{} value {} exceeds 2^31-1", param, value),
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                SettingsParameter::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(ProtocolError::connection(
                            ErrorCode::ProtocolError,
                            format!("{} value {} outside 16384..=16777215", param, value),
                        ));
                    }
                    settings.max_frame_size = Some(value);
                }
                SettingsParameter::MaxHeaderListSize => {
                    settings.max_header_list_size = Some(value)
                }
                SettingsParameter::EnableConnectProtocol => {
                    settings.enable_connect_protocol = Some(parse_flag(param, value)?);
                }
            }
        }
        Ok(settings)
    }

    /// Encode as a SETTINGS payload, in parameter id order
    pub fn encode(&self, buf: &mut BytesMut) {
        let pairs = [
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, self.enable_push.map(u32::from)),
            (SettingsParameter::MaxConcurrentStreams, self.max_concurrent_streams),
            (SettingsParameter::InitialWindowSize, self.initial_window_size),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
            (SettingsParameter::MaxHeaderListSize, self.max_header_list_size),
            (
                SettingsParameter::EnableConnectProtocol,
                self.enable_connect_protocol.map(u32::from),
            ),
        ];
        for (param, value) in pairs {
            if let Some(value) = value {
                buf.put_u16(param.as_u16());
                buf.put_u32(value);
            }
        }
    }

    /// Encoded payload length
    pub fn encoded_len(&self) -> usize {
        let present = [
            self.header_table_size.is_some(),
            self.enable_push.is_some(),
            self.max_concurrent_streams.is_some(),
            self.initial_window_size.is_some(),
            self.max_frame_size.is_some(),
            self.max_header_list_size.is_some(),
            self.enable_connect_protocol.is_some(),
        ];
        present.iter().filter(|p| **p).count() * SETTING_SIZE
    }
}

fn parse_flag(param: SettingsParameter, value: u32) -> std::result::Result<bool, ProtocolError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::connection(
            ErrorCode::ProtocolError,
            format!("{} value {} is not 0 or 1", param, value),
        )),
    }
}

/// Builder for SETTINGS payloads
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings without validation, so tests can send bad values
    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Effective settings of one endpoint
///
/// Starts at the protocol defaults and is updated as SETTINGS frames are
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub enable_connect_protocol: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        PeerSettings {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
            enable_connect_protocol: false,
        }
    }
}

impl PeerSettings {
    /// Apply the parameters present in a SETTINGS frame
    pub fn apply(&mut self, settings: &Settings) {
        if let Some(v) = settings.header_table_size {
            self.header_table_size = v;
        }
        if let Some(v) = settings.enable_push {
            self.enable_push = v;
        }
        if let Some(v) = settings.max_concurrent_streams {
            self.max_concurrent_streams = v;
        }
        if let Some(v) = settings.initial_window_size {
            self.initial_window_size = v;
        }
        if let Some(v) = settings.max_frame_size {
            self.max_frame_size = v;
        }
        if let Some(v) = settings.max_header_list_size {
            self.max_header_list_size = v;
        }
        if let Some(v) = settings.enable_connect_protocol {
            self.enable_connect_protocol = v;
        }
    }

    /// The SETTINGS a server announces: every value that differs from the
    /// protocol default, plus MAX_CONCURRENT_STREAMS unconditionally
    pub fn non_default_settings(&self) -> Settings {
        let defaults = PeerSettings::default();
        let differs = |a: u32, b: u32| (a != b).then_some(a);
        Settings {
            header_table_size: differs(self.header_table_size, defaults.header_table_size),
            enable_push: None,
            max_concurrent_streams: Some(self.max_concurrent_streams),
            initial_window_size: differs(self.initial_window_size, defaults.initial_window_size),
            max_frame_size: differs(self.max_frame_size, defaults.max_frame_size),
            max_header_list_size: differs(self.max_header_list_size, defaults.max_header_list_size),
            enable_connect_protocol: self.enable_connect_protocol.then_some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(u16, u32)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (id, value) in pairs {
            buf.put_u16(*id);
            buf.put_u32(*value);
        }
        buf.to_vec()
    }

    #[test]
    fn test_settings_parameter_conversion() {
        assert_eq!(SettingsParameter::HeaderTableSize.as_u16(), 0x1);
        assert_eq!(
            SettingsParameter::from_u16(0x8),
            Some(SettingsParameter::EnableConnectProtocol)
        );
        assert_eq!(SettingsParameter::from_u16(0x7), None);
    }

    #[test]
    fn test_parse_ignores_unknown() {
        let settings = Settings::parse(&payload(&[(0x3, 10), (0xfe, 7)])).unwrap();
        assert_eq!(settings.max_concurrent_streams, Some(10));
        assert_eq!(settings.header_table_size, None);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let err = Settings::parse(&payload(&[(0x4, 0x8000_0000)])).unwrap_err();
        assert_eq!(err.code, ErrorCode::FlowControlError);
        assert!(err.is_connection_error());

        let err = Settings::parse(&payload(&[(0x5, 1024)])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);

        let err = Settings::parse(&payload(&[(0x2, 2)])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn test_encode_parse() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .max_concurrent_streams(100)
            .build();
        let mut buf = BytesMut::new();
        settings.encode(&mut buf);
        assert_eq!(buf.len(), settings.encoded_len());
        assert_eq!(Settings::parse(&buf).unwrap(), settings);
    }

    #[test]
    fn test_peer_settings_apply() {
        let mut peer = PeerSettings::default();
        peer.apply(&SettingsBuilder::new().initial_window_size(1000).build());
        assert_eq!(peer.initial_window_size, 1000);
        assert_eq!(peer.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_non_default_settings() {
        let peer = PeerSettings {
            max_concurrent_streams: 100,
            initial_window_size: 98_304,
            max_header_list_size: 32_768,
            ..PeerSettings::default()
        };
        let announced = peer.non_default_settings();
        assert_eq!(announced.max_concurrent_streams, Some(100));
        assert_eq!(announced.initial_window_size, Some(98_304));
        assert_eq!(announced.max_header_list_size, Some(32_768));
        assert_eq!(announced.header_table_size, None);
        assert_eq!(announced.max_frame_size, None);
        assert_eq!(announced.enable_connect_protocol, None);
    }
}
