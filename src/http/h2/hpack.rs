//! Boundary to the HPACK codec
//!
//! Compression itself is done by the `hpack` crate. This module decides when
//! it runs: fragments of one header block (HEADERS plus any CONTINUATION
//! frames) are accumulated and decoded once complete, and encoded blocks are
//! split across HEADERS and CONTINUATION frames by the peer's frame size.
//!
//! Decoding failures are always connection errors. The dynamic table is
//! shared by every stream, so a partially applied block would corrupt all
//! later decodes.

use super::codec::FrameCodec;
use super::error::{ErrorCode, ProtocolError};
use super::frames::{ContinuationFrame, HeadersFrame};
use super::settings::DEFAULT_HEADER_TABLE_SIZE;
use bytes::{Bytes, BytesMut};

/// Decoded header field as raw bytes
pub type HeaderField = (Vec<u8>, Vec<u8>);

/// Accumulates header block fragments and decodes complete blocks
pub struct HeaderBlockDecoder {
    decoder: ::hpack::Decoder<'static>,
    fragments: BytesMut,
    max_block_size: usize,
}

impl HeaderBlockDecoder {
    /// Create a decoder whose dynamic table is limited to the size we
    /// advertise, and which refuses compressed blocks above `max_block_size`
    pub fn new(header_table_size: u32, max_block_size: usize) -> Self {
        let mut decoder = ::hpack::Decoder::new();
        decoder.set_max_table_size(header_table_size as usize);
        HeaderBlockDecoder {
            decoder,
            fragments: BytesMut::new(),
            max_block_size,
        }
    }

    /// Append one fragment of the block in progress
    pub fn push_fragment(&mut self, fragment: &[u8]) -> Result<(), ProtocolError> {
        if self.fragments.len() + fragment.len() > self.max_block_size {
            self.fragments.clear();
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "header block exceeds the maximum header list size",
            ));
        }
        self.fragments.extend_from_slice(fragment);
        Ok(())
    }

    /// Decode the accumulated block, leaving the decoder ready for the next
    pub fn finish(&mut self) -> Result<Vec<HeaderField>, ProtocolError> {
        let block = self.fragments.split();
        self.decoder.decode(&block).map_err(|e| {
            ProtocolError::connection(
                ErrorCode::CompressionError,
                format!("HPACK decode error: {:?}", e),
            )
        })
    }
}

/// Encodes response header blocks
///
/// The `hpack` encoder always indexes into a 4096-byte dynamic table. When
/// the peer advertises a smaller table the encoder would overrun it, so in
/// that case fields are written as literals that never touch the table.
///
/// Literal mode is permanent for the connection: a peer that shrank its
/// table has evicted entries the `hpack` encoder still refers to, and
/// growing the table again does not bring them back.
pub struct HeaderBlockEncoder {
    encoder: ::hpack::Encoder<'static>,
    literal_only: bool,
}

impl HeaderBlockEncoder {
    pub fn new() -> Self {
        HeaderBlockEncoder {
            encoder: ::hpack::Encoder::new(),
            literal_only: false,
        }
    }

    /// Record the peer's SETTINGS_HEADER_TABLE_SIZE
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size < DEFAULT_HEADER_TABLE_SIZE {
            self.literal_only = true;
        }
    }

    /// Whether blocks are written without the dynamic table
    pub fn is_literal_only(&self) -> bool {
        self.literal_only
    }

    /// Encode one header block
    pub fn encode<'a, I>(&mut self, fields: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        if !self.literal_only {
            return self.encoder.encode(fields);
        }

        let mut out = Vec::new();
        for (name, value) in fields {
            // Literal header field without indexing, new name (RFC 7541 6.2.2)
            out.push(0x00);
            encode_string(name, &mut out);
            encode_string(value, &mut out);
        }
        out
    }
}

impl Default for HeaderBlockEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw (non-Huffman) string literal with a 7-bit prefix length
fn encode_string(s: &[u8], out: &mut Vec<u8>) {
    let mut len = s.len();
    if len < 0x7f {
        out.push(len as u8);
    } else {
        out.push(0x7f);
        len -= 0x7f;
        while len >= 0x80 {
            out.push((len as u8 & 0x7f) | 0x80);
            len >>= 7;
        }
        out.push(len as u8);
    }
    out.extend_from_slice(s);
}

/// Write an encoded header block as one HEADERS frame followed by as many
/// CONTINUATION frames as the peer's frame size requires
///
/// The frames are appended to `buf` back to back, so as long as the caller
/// holds the writer lock no other frame can land inside the sequence.
pub fn write_header_block(
    stream_id: u32,
    block: Bytes,
    end_stream: bool,
    max_frame_size: usize,
    buf: &mut BytesMut,
) {
    let max_frame_size = max_frame_size.max(1);
    let mut rest = block;
    let first = rest.split_to(rest.len().min(max_frame_size));

    FrameCodec::encode_headers(
        &HeadersFrame::new(stream_id, first, end_stream, rest.is_empty()),
        buf,
    );

    while !rest.is_empty() {
        let fragment = rest.split_to(rest.len().min(max_frame_size));
        FrameCodec::encode_continuation(
            &ContinuationFrame {
                stream_id,
                header_block: fragment,
                end_headers: rest.is_empty(),
            },
            buf,
        );
    }
}
