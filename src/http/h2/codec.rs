//! HTTP/2 frame encoding and decoding
//!
//! This module provides the low-level frame codec: the 9-byte frame header,
//! incremental frame extraction from a receive buffer, and per-type
//! encoders. Encoders append to a caller-owned `BytesMut` so the writer can
//! batch several frames into one transport write.
//!
//! The codec does not judge whether a frame makes sense. Payload widths,
//! stream id rules and flag combinations are checked by the connection,
//! which knows the context the frame arrived in.

use super::error::{ErrorCode, ProtocolError};
use super::frames::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload a 24-bit length can describe
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: u8,
    pub flags: FrameFlags,
    pub stream_id: u32,
}

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(kind: u8, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = kind;
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is never set)
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());

        header
    }

    /// Decode a frame header, ignoring the reserved stream id bit
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;

        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Try to extract one complete frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when fewer than 9 header bytes or fewer than
    /// `9 + length` bytes are buffered; nothing is consumed in that case.
    /// On success exactly `9 + length` bytes are removed from `buf`.
    ///
    /// A declared length above `max_frame_size` is a FRAME_SIZE_ERROR
    /// connection error, raised as soon as the header is visible.
    pub fn try_read_frame(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = Self::decode_header(&raw);

        if header.length > max_frame_size as usize {
            return Err(ProtocolError::connection(
                ErrorCode::FrameSizeError,
                format!(
                    "frame length {} exceeds max frame size {}",
                    header.length, max_frame_size
                ),
            ));
        }

        if buf.len() < FRAME_HEADER_SIZE + header.length {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length).freeze();

        Ok(Some(Frame {
            kind: header.kind,
            flags: header.flags,
            stream_id: header.stream_id,
            payload,
        }))
    }

    /// Write a generic frame
    pub fn write_frame(frame: &Frame, buf: &mut BytesMut) {
        buf.put_slice(&Self::encode_header(
            frame.kind,
            frame.flags,
            frame.stream_id,
            frame.payload.len(),
        ));
        buf.put_slice(&frame.payload);
    }

    /// Encode a DATA frame
    pub fn encode_data(frame: &DataFrame, buf: &mut BytesMut) {
        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, frame.end_stream)
            .with(FrameFlags::PADDED, frame.padding.is_some());

        buf.put_slice(&Self::encode_header(
            FrameType::Data.as_u8(),
            flags,
            frame.stream_id,
            frame.frame_size(),
        ));

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
            buf.put_slice(&frame.data);
            buf.put_bytes(0, pad_len as usize);
        } else {
            buf.put_slice(&frame.data);
        }
    }

    /// Encode a HEADERS frame
    pub fn encode_headers(frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut payload_len = frame.header_block.len();
        if frame.priority.is_some() {
            payload_len += 5;
        }
        if let Some(pad_len) = frame.padding {
            payload_len += 1 + pad_len as usize;
        }

        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, frame.end_stream)
            .with(FrameFlags::END_HEADERS, frame.end_headers)
            .with(FrameFlags::PRIORITY, frame.priority.is_some())
            .with(FrameFlags::PADDED, frame.padding.is_some());

        buf.put_slice(&Self::encode_header(
            FrameType::Headers.as_u8(),
            flags,
            frame.stream_id,
            payload_len,
        ));

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        if let Some(priority) = &frame.priority {
            put_priority(priority, buf);
        }
        buf.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation(frame: &ContinuationFrame, buf: &mut BytesMut) {
        let flags = FrameFlags::empty().with(FrameFlags::END_HEADERS, frame.end_headers);
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation.as_u8(),
            flags,
            frame.stream_id,
            frame.header_block.len(),
        ));
        buf.put_slice(&frame.header_block);
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority(frame: &PriorityFrame, buf: &mut BytesMut) {
        buf.put_slice(&Self::encode_header(
            FrameType::Priority.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            5,
        ));
        put_priority(&frame.priority, buf);
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream(frame: &RstStreamFrame, buf: &mut BytesMut) {
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code);
    }

    /// Encode a SETTINGS frame (stream 0)
    pub fn encode_settings(frame: &SettingsFrame, buf: &mut BytesMut) {
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        let len = if frame.ack { 0 } else { frame.settings.encoded_len() };

        buf.put_slice(&Self::encode_header(FrameType::Settings.as_u8(), flags, 0, len));
        if !frame.ack {
            frame.settings.encode(buf);
        }
    }

    /// Encode a PING frame (stream 0)
    pub fn encode_ping(frame: &PingFrame, buf: &mut BytesMut) {
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        buf.put_slice(&Self::encode_header(FrameType::Ping.as_u8(), flags, 0, 8));
        buf.put_slice(&frame.data);
    }

    /// Encode a GOAWAY frame (stream 0)
    pub fn encode_goaway(frame: &GoawayFrame, buf: &mut BytesMut) {
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway.as_u8(),
            FrameFlags::empty(),
            0,
            8 + frame.debug_data.len(),
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code);
        buf.put_slice(&frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update(frame: &WindowUpdateFrame, buf: &mut BytesMut) {
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate.as_u8(),
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    /// Encode any single frame into a fresh buffer
    pub fn to_bytes(encode: impl FnOnce(&mut BytesMut)) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        encode(&mut buf);
        buf.freeze()
    }
}

fn put_priority(priority: &PrioritySpec, buf: &mut BytesMut) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers.as_u8(), flags, 42, 1234);
        let decoded = FrameCodec::decode_header(&header);

        assert_eq!(decoded.kind, FrameType::Headers.as_u8());
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.length, 1234);
    }

    #[test]
    fn test_reserved_bit_ignored_on_read_and_cleared_on_write() {
        let header = FrameCodec::encode_header(0, FrameFlags::empty(), 0xFFFF_FFFF, 0);
        assert_eq!(header[5] & 0x80, 0);

        let raw = [0, 0, 0, 0, 0, 0x80, 0, 0, 1];
        assert_eq!(FrameCodec::decode_header(&raw).stream_id, 1);
    }

    #[test]
    fn test_try_read_frame_needs_more() {
        let mut buf = BytesMut::from(&[0u8, 0, 5, 0, 0, 0][..]);
        assert_eq!(FrameCodec::try_read_frame(&mut buf, 16384).unwrap(), None);
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&[0, 0, 1, b'a', b'b']);
        assert_eq!(FrameCodec::try_read_frame(&mut buf, 16384).unwrap(), None);
        assert_eq!(buf.len(), 11);

        buf.extend_from_slice(b"cde");
        let frame = FrameCodec::try_read_frame(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_read_frame_too_large() {
        let header = FrameCodec::encode_header(0, FrameFlags::empty(), 1, 16385);
        let mut buf = BytesMut::from(&header[..]);
        let err = FrameCodec::try_read_frame(&mut buf, 16384).unwrap_err();
        assert_eq!(err.code, ErrorCode::FrameSizeError);
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let mut wire = BytesMut::new();
        FrameCodec::encode_settings(&SettingsFrame::new(SettingsBuilder::new().max_concurrent_streams(3).build()), &mut wire);
        FrameCodec::encode_data(&DataFrame::new(1, Bytes::from_static(b"hello"), true).with_padding(3), &mut wire);
        FrameCodec::encode_ping(&PingFrame::new([9; 8]), &mut wire);
        FrameCodec::encode_window_update(&WindowUpdateFrame::new(0, 77), &mut wire);
        let wire = wire.freeze();

        let read_all = |chunk: usize| {
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Some(frame) = FrameCodec::try_read_frame(&mut buf, 16384).unwrap() {
                    frames.push(frame);
                }
            }
            assert!(buf.is_empty());
            frames
        };

        let whole = read_all(wire.len());
        assert_eq!(whole.len(), 4);
        for chunk in [1, 2, 5, 9, 10, 17] {
            assert_eq!(read_all(chunk), whole, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_encode_data_frame_with_padding() {
        let frame = DataFrame::new(1, Bytes::from("Hi"), false).with_padding(10);
        let encoded = FrameCodec::to_bytes(|buf| FrameCodec::encode_data(&frame, buf));

        // 1 (pad length) + 2 (data) + 10 (padding)
        assert_eq!(encoded[0..3], [0, 0, 13]);
        assert_eq!(encoded[4] & FrameFlags::PADDED, FrameFlags::PADDED);
        assert_eq!(encoded[9], 10);
        assert_eq!(&encoded[10..12], b"Hi");
        assert_eq!(&encoded[12..22], &[0u8; 10]);
    }

    #[test]
    fn test_encode_settings_ack() {
        let encoded = FrameCodec::to_bytes(|buf| FrameCodec::encode_settings(&SettingsFrame::ack(), buf));
        assert_eq!(encoded[0..3], [0, 0, 0]);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_encode_goaway() {
        let frame = GoawayFrame::new(7, ErrorCode::ProtocolError.as_u32(), Bytes::from_static(b"x"));
        let mut buf = BytesMut::new();
        FrameCodec::encode_goaway(&frame, &mut buf);
        let decoded = FrameCodec::try_read_frame(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(decoded.frame_type(), Some(FrameType::Goaway));
        assert_eq!(GoawayFrame::parse(&decoded), frame);
    }

    #[test]
    fn test_write_frame_reads_back() {
        let frames = vec![
            Frame::new(FrameType::Ping, FrameFlags::from_u8(FrameFlags::ACK), 0, Bytes::from_static(&[7; 8])),
            Frame {
                kind: 0x42,
                flags: FrameFlags::from_u8(0xFF),
                stream_id: 9,
                payload: Bytes::from_static(b"extension"),
            },
            Frame::new(FrameType::Data, FrameFlags::empty(), 3, Bytes::new()),
        ];

        let mut buf = BytesMut::new();
        for frame in &frames {
            FrameCodec::write_frame(frame, &mut buf);
        }
        for frame in &frames {
            assert_eq!(FrameCodec::try_read_frame(&mut buf, 16384).unwrap().as_ref(), Some(frame));
        }
        assert!(buf.is_empty());
        assert_eq!(frames[1].frame_type(), None);
    }

    #[test]
    fn test_encode_headers_with_priority_and_padding() {
        let frame = HeadersFrame::new(5, Bytes::from_static(&[0x82, 0x84]), true, true)
            .with_priority(PrioritySpec::new(3, true, 200))
            .with_padding(4);
        let mut buf = BytesMut::new();
        FrameCodec::encode_headers(&frame, &mut buf);

        let decoded = FrameCodec::try_read_frame(&mut buf, 16384).unwrap().unwrap();
        // pad length + priority + block + padding
        assert_eq!(decoded.payload.len(), 1 + 5 + 2 + 4);
        assert!(decoded.flags.is_priority());
        assert_eq!(HeadersFrame::parse(&decoded), Some(frame));
    }

    #[test]
    fn test_encode_priority() {
        let frame = PriorityFrame {
            stream_id: 7,
            priority: PrioritySpec::new(1, false, 16),
        };
        let mut buf = BytesMut::new();
        FrameCodec::encode_priority(&frame, &mut buf);
        assert_eq!(buf[0..3], [0, 0, 5]);

        let decoded = FrameCodec::try_read_frame(&mut buf, 16384).unwrap().unwrap();
        assert_eq!(decoded.frame_type(), Some(FrameType::Priority));
        assert_eq!(PriorityFrame::parse(&decoded), frame);
    }

    #[test]
    fn test_encode_window_update() {
        let encoded = FrameCodec::to_bytes(|buf| {
            FrameCodec::encode_window_update(&WindowUpdateFrame::new(42, 1000), buf)
        });
        assert_eq!(encoded[0..3], [0, 0, 4]);
        assert_eq!(encoded[3], FrameType::WindowUpdate.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 42]);
        assert_eq!(u32::from_be_bytes([encoded[9], encoded[10], encoded[11], encoded[12]]), 1000);
    }
}
