//! Serialized frame writer
//!
//! Every outbound frame for a connection goes through one `FrameWriter`.
//! Frames are encoded into a buffer and pushed to the transport while the
//! writer lock is held, so a HEADERS + CONTINUATION sequence can never be
//! split by another frame.
//!
//! The writer also owns the connection-level send window and the queue of
//! producers parked until that window reopens.

use super::codec::FrameCodec;
use super::error::{ErrorCode, Result};
use super::flow_control::OutputFlowControl;
use super::frames::{DataFrame, GoawayFrame, PingFrame, RstStreamFrame, SettingsFrame, WindowUpdateFrame};
use super::hpack::{write_header_block, HeaderBlockEncoder};
use super::pipe::OutputProducer;
use super::settings::{Settings, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::{Headers, HttpSession, SessionOps};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Outbound half of a transport
pub trait OutputSink: Send {
    /// Write the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> crate::http::Result<()>;

    /// Shut the transport down
    fn shutdown(&mut self) {}
}

impl<S: SessionOps> OutputSink for HttpSession<S> {
    fn write_all(&mut self, buf: &[u8]) -> crate::http::Result<()> {
        HttpSession::write_all(self, buf)
    }

    fn shutdown(&mut self) {
        let _ = self.close();
    }
}

/// Writer state, only reachable through the writer lock
pub(crate) struct WriterState {
    sink: Box<dyn OutputSink>,
    encoder: HeaderBlockEncoder,
    buffer: BytesMut,
    max_frame_size: usize,
    /// Connection-level send window
    pub window: OutputFlowControl,
    /// Producers waiting for the connection window
    waiting: VecDeque<Arc<OutputProducer>>,
    completed: bool,
}

impl WriterState {
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Write a response header block, HEADERS plus CONTINUATIONs
    ///
    /// `status` is written as `:status` ahead of the regular fields; trailers
    /// pass `None`.
    pub fn write_headers(
        &mut self,
        stream_id: u32,
        status: Option<u16>,
        headers: &Headers,
        end_stream: bool,
    ) -> Result<()> {
        if self.completed {
            return Ok(());
        }

        let status = status.map(|s| s.to_string());
        let names: Vec<String> = headers.iter().map(|(n, _)| n.to_ascii_lowercase()).collect();
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(names.len() + 1);
        if let Some(status) = &status {
            fields.push((b":status", status.as_bytes()));
        }
        for (name, (_, value)) in names.iter().zip(headers.iter()) {
            fields.push((name.as_bytes(), value.as_bytes()));
        }

        let block = self.encoder.encode(fields);
        write_header_block(
            stream_id,
            Bytes::from(block),
            end_stream,
            self.max_frame_size,
            &mut self.buffer,
        );
        trace!(stream_id, end_stream, "writing HEADERS");
        self.flush()
    }

    /// Write body bytes as DATA frames no larger than the peer allows
    ///
    /// Flow control is the caller's business; this only frames.
    pub fn write_data(&mut self, stream_id: u32, mut data: Bytes, end_stream: bool) -> Result<()> {
        if self.completed {
            return Ok(());
        }

        loop {
            let chunk = data.split_to(data.len().min(self.max_frame_size));
            let last = data.is_empty();
            FrameCodec::encode_data(
                &DataFrame::new(stream_id, chunk, end_stream && last),
                &mut self.buffer,
            );
            if last {
                break;
            }
        }
        self.flush()
    }

    /// Park a producer until the connection window reopens
    pub fn park(&mut self, producer: Arc<OutputProducer>) {
        self.waiting.push_back(producer);
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buf = self.buffer.split();
        if let Err(e) = self.sink.write_all(&buf) {
            self.completed = true;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Single serialized writer for one connection
pub struct FrameWriter {
    state: Mutex<WriterState>,
}

impl FrameWriter {
    /// Create a writer over the outbound half of a transport
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        FrameWriter {
            state: Mutex::new(WriterState {
                sink,
                encoder: HeaderBlockEncoder::new(),
                buffer: BytesMut::with_capacity(DEFAULT_MAX_FRAME_SIZE as usize),
                max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
                window: OutputFlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
                waiting: VecDeque::new(),
                completed: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock()
    }

    /// Send our SETTINGS
    pub fn write_settings(&self, settings: &Settings) -> Result<()> {
        self.write_with(|buf| FrameCodec::encode_settings(&SettingsFrame::new(settings.clone()), buf))
    }

    /// Acknowledge the peer's SETTINGS
    pub fn write_settings_ack(&self) -> Result<()> {
        self.write_with(|buf| FrameCodec::encode_settings(&SettingsFrame::ack(), buf))
    }

    pub fn write_ping(&self, data: [u8; 8], ack: bool) -> Result<()> {
        let frame = if ack { PingFrame::ack(data) } else { PingFrame::new(data) };
        self.write_with(|buf| FrameCodec::encode_ping(&frame, buf))
    }

    pub fn write_goaway(&self, last_stream_id: u32, code: ErrorCode) -> Result<()> {
        trace!(last_stream_id, code = %code, "writing GOAWAY");
        self.write_with(|buf| {
            FrameCodec::encode_goaway(
                &GoawayFrame::new(last_stream_id, code.as_u32(), Bytes::new()),
                buf,
            )
        })
    }

    pub fn write_rst_stream(&self, stream_id: u32, code: ErrorCode) -> Result<()> {
        trace!(stream_id, code = %code, "writing RST_STREAM");
        self.write_with(|buf| {
            FrameCodec::encode_rst_stream(
                &RstStreamFrame {
                    stream_id,
                    error_code: code.as_u32(),
                },
                buf,
            )
        })
    }

    pub fn write_window_update(&self, stream_id: u32, increment: u32) -> Result<()> {
        self.write_with(|buf| {
            FrameCodec::encode_window_update(&WindowUpdateFrame::new(stream_id, increment), buf)
        })
    }

    /// Write bytes that are not HTTP/2 frames, such as the HTTP/1.x refusal
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        self.write_with(|buf| buf.extend_from_slice(bytes))
    }

    /// Apply a connection WINDOW_UPDATE and wake producers parked on the
    /// connection window
    ///
    /// Returns false if the window would overflow.
    pub fn update_connection_window(&self, increment: u32) -> bool {
        let mut state = self.state.lock();
        if !state.window.try_update_window(increment) {
            return false;
        }

        while state.window.is_available() {
            let Some(producer) = state.waiting.pop_front() else {
                break;
            };
            let mut output = producer.lock();
            output.scheduled = false;
            producer.schedule(&mut output);
        }
        true
    }

    /// Connection-level send credit
    pub fn connection_window(&self) -> i64 {
        self.state.lock().window.available()
    }

    /// Set the largest frame payload we send
    pub fn update_max_frame_size(&self, size: u32) {
        self.state.lock().max_frame_size = size as usize;
    }

    /// Record the peer's HPACK table size
    pub fn update_header_table_size(&self, size: u32) {
        self.state.lock().encoder.set_peer_table_size(size);
    }

    /// Stop writing; later writes are dropped silently
    ///
    /// Parked producers are aborted so their writers wake up.
    pub fn complete(&self) {
        let waiting: Vec<_> = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.window.abort();
            state.sink.shutdown();
            state.waiting.drain(..).collect()
        };
        for producer in waiting {
            producer.abort();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn write_with(&self, encode: impl FnOnce(&mut BytesMut)) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Ok(());
        }
        encode(&mut state.buffer);
        state.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::h2::frames::{Frame, FrameType};
    use crate::http::h2::hpack::HeaderBlockDecoder;

    /// Sink that records everything written to it
    #[derive(Clone, Default)]
    pub(crate) struct Capture {
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    impl Capture {
        pub fn frames(&self) -> Vec<Frame> {
            let mut buf = BytesMut::from(&self.bytes.lock()[..]);
            let mut frames = Vec::new();
            while let Some(frame) = FrameCodec::try_read_frame(&mut buf, 1 << 24).unwrap() {
                frames.push(frame);
            }
            frames
        }

        pub fn window_updates(&self) -> Vec<(u32, u32)> {
            self.frames()
                .iter()
                .filter(|f| f.frame_type() == Some(FrameType::WindowUpdate))
                .map(|f| {
                    let update = WindowUpdateFrame::parse(f);
                    (update.stream_id, update.size_increment)
                })
                .collect()
        }

        pub fn raw(&self) -> Vec<u8> {
            self.bytes.lock().clone()
        }
    }

    impl OutputSink for Capture {
        fn write_all(&mut self, buf: &[u8]) -> crate::http::Result<()> {
            self.bytes.lock().extend_from_slice(buf);
            Ok(())
        }
    }

    pub(crate) fn capture_writer() -> (Arc<FrameWriter>, Capture) {
        let capture = Capture::default();
        (Arc::new(FrameWriter::new(Box::new(capture.clone()))), capture)
    }

    struct BrokenSink;

    impl OutputSink for BrokenSink {
        fn write_all(&mut self, _buf: &[u8]) -> crate::http::Result<()> {
            Err(crate::http::Error::ConnectionClosed)
        }
    }

    #[test]
    fn test_headers_lowercased_with_status() {
        let (writer, capture) = capture_writer();
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        writer.lock().write_headers(1, Some(200), &headers, true).unwrap();

        let frames = capture.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].flags.is_end_stream());
        assert!(frames[0].flags.is_end_headers());

        let mut decoder = HeaderBlockDecoder::new(4096, 1 << 16);
        decoder.push_fragment(&frames[0].payload).unwrap();
        let fields = decoder.finish().unwrap();
        assert_eq!(fields[0], (b":status".to_vec(), b"200".to_vec()));
        assert_eq!(fields[1], (b"content-type".to_vec(), b"text/plain".to_vec()));
    }

    #[test]
    fn test_data_split_by_max_frame_size() {
        let (writer, capture) = capture_writer();
        writer
            .lock()
            .write_data(1, Bytes::from(vec![0u8; 40_000]), true)
            .unwrap();

        let frames = capture.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), 16_384);
        assert_eq!(frames[2].payload.len(), 40_000 - 2 * 16_384);
        assert!(!frames[0].flags.is_end_stream());
        assert!(frames[2].flags.is_end_stream());
    }

    #[test]
    fn test_empty_data_with_end_stream() {
        let (writer, capture) = capture_writer();
        writer.lock().write_data(5, Bytes::new(), true).unwrap();
        let frames = capture.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, 5);
        assert!(frames[0].payload.is_empty());
        assert!(frames[0].flags.is_end_stream());
    }

    #[test]
    fn test_connection_window_overflow() {
        let (writer, _capture) = capture_writer();
        assert!(writer.update_connection_window(0x7FFF_FFFF - 65_535));
        assert!(!writer.update_connection_window(1));
    }

    #[test]
    fn test_writes_after_complete_are_dropped() {
        let (writer, capture) = capture_writer();
        writer.write_goaway(1, ErrorCode::NoError).unwrap();
        writer.complete();
        writer.write_ping([0; 8], false).unwrap();
        assert_eq!(capture.frames().len(), 1);
        assert!(writer.is_completed());
    }

    #[test]
    fn test_sink_failure_completes_writer() {
        let writer = FrameWriter::new(Box::new(BrokenSink));
        assert!(writer.write_settings_ack().is_err());
        assert!(writer.is_completed());
        assert!(writer.write_settings_ack().is_ok());
    }
}
