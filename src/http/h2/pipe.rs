//! Per-stream byte pipes
//!
//! `BodyPipe` carries request DATA from the connection reader to the
//! application and hands receive credit back to the peer as the application
//! reads. `OutputProducer` buffers response bytes written by the application
//! until the output scheduler moves them onto the wire.
//!
//! Lock order is writer state, then producer state. The application side
//! only ever takes the producer lock.

use super::error::{Error, ErrorCode, ProtocolError, Result};
use super::flow_control::{InputFlowControl, OutputFlowControl};
use super::scheduler::WorkItem;
use super::writer::FrameWriter;
use crate::http::Headers;
use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Connection-level receive window, shared by every body pipe
pub struct ConnectionInput {
    flow: Mutex<InputFlowControl>,
    writer: Arc<FrameWriter>,
}

impl ConnectionInput {
    pub fn new(initial_window_size: u32, writer: Arc<FrameWriter>) -> Self {
        ConnectionInput {
            flow: Mutex::new(InputFlowControl::new(initial_window_size)),
            writer,
        }
    }

    /// Charge DATA received on any stream
    pub fn try_advance(&self, bytes: usize) -> std::result::Result<(), ProtocolError> {
        if self.flow.lock().try_advance(bytes) {
            Ok(())
        } else {
            Err(ProtocolError::connection(
                ErrorCode::FlowControlError,
                "connection receive window exceeded",
            ))
        }
    }

    /// Return consumed credit, announcing it once enough has accumulated
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let update = self.flow.lock().try_update_window(bytes as u32).unwrap_or(0);
        if update > 0 {
            if let Err(e) = self.writer.write_window_update(0, update) {
                debug!(error = %e, "failed to send connection WINDOW_UPDATE");
            }
        }
    }

    /// Stop announcing credit, used once the connection is going away
    pub fn stop_window_updates(&self) {
        self.flow.lock().stop_window_updates();
    }

    /// Current connection receive credit
    pub fn available(&self) -> i64 {
        self.flow.lock().available()
    }

    pub(crate) fn writer(&self) -> &Arc<FrameWriter> {
        &self.writer
    }
}

struct BodyState {
    stream_id: u32,
    chunks: VecDeque<Bytes>,
    flow: InputFlowControl,
    trailers: Option<Headers>,
    complete: bool,
    aborted: bool,
}

/// Request body buffer between the connection reader and the application
pub struct BodyPipe {
    state: Mutex<BodyState>,
    readable: Condvar,
    connection: Arc<ConnectionInput>,
}

impl BodyPipe {
    pub fn new(stream_id: u32, initial_window_size: u32, connection: Arc<ConnectionInput>) -> Self {
        BodyPipe {
            state: Mutex::new(BodyState {
                stream_id,
                chunks: VecDeque::new(),
                flow: InputFlowControl::new(initial_window_size),
                trailers: None,
                complete: false,
                aborted: false,
            }),
            readable: Condvar::new(),
            connection,
        }
    }

    /// Blank the pipe for a reused stream
    pub fn reset(&self, stream_id: u32, initial_window_size: u32) {
        let mut state = self.state.lock();
        state.stream_id = stream_id;
        state.chunks.clear();
        state.flow = InputFlowControl::new(initial_window_size);
        state.trailers = None;
        state.complete = false;
        state.aborted = false;
    }

    /// Accept one DATA frame
    ///
    /// `flow_len` is the whole frame payload including padding, which is
    /// what both windows are charged. Padding is handed back immediately.
    pub fn receive(&self, data: Bytes, flow_len: usize) -> std::result::Result<(), ProtocolError> {
        self.connection.try_advance(flow_len)?;

        let mut state = self.state.lock();
        if !state.flow.try_advance(flow_len) {
            let stream_id = state.stream_id;
            drop(state);
            self.connection.release(flow_len);
            return Err(ProtocolError::stream(
                stream_id,
                ErrorCode::FlowControlError,
                "stream receive window exceeded",
            ));
        }

        if state.aborted {
            // Nobody will read it.
            drop(state);
            self.connection.release(flow_len);
            return Ok(());
        }

        let padding = flow_len - data.len();
        if !data.is_empty() {
            state.chunks.push_back(data);
            self.readable.notify_all();
        }

        let stream_update = if padding > 0 {
            state.flow.try_update_window(padding as u32).unwrap_or(0)
        } else {
            0
        };
        let stream_id = state.stream_id;
        drop(state);

        self.send_stream_update(stream_id, stream_update);
        self.connection.release(padding);
        Ok(())
    }

    /// Attach request trailers; they become visible once the body ends
    pub fn set_trailers(&self, trailers: Headers) {
        self.state.lock().trailers = Some(trailers);
    }

    /// Mark the end of the request body
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.complete = true;
        state.flow.stop_window_updates();
        self.readable.notify_all();
    }

    /// Check whether END_STREAM has been seen
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Abort the body, dropping buffered data and returning its credit to
    /// the connection window
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        state.chunks.clear();
        let unread = state.flow.abort();
        self.readable.notify_all();
        drop(state);

        self.connection.release(unread as usize);
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Bytes received but not yet read by the application
    pub fn buffered(&self) -> usize {
        self.state.lock().chunks.iter().map(Bytes::len).sum()
    }

    /// Blocking read of body bytes, `Ok(0)` at the end of the body
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "stream was aborted",
                ));
            }

            if let Some(front) = state.chunks.front_mut() {
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.advance(n);
                if front.is_empty() {
                    state.chunks.pop_front();
                }

                let stream_update = state.flow.try_update_window(n as u32).unwrap_or(0);
                let stream_id = state.stream_id;
                drop(state);

                self.send_stream_update(stream_id, stream_update);
                self.connection.release(n);
                return Ok(n);
            }

            if state.complete {
                return Ok(0);
            }

            self.readable.wait(&mut state);
        }
    }

    /// Trailers received after the body, if any
    pub fn trailers(&self) -> Option<Headers> {
        let state = self.state.lock();
        if state.complete {
            state.trailers.clone()
        } else {
            None
        }
    }

    fn send_stream_update(&self, stream_id: u32, increment: u32) {
        if increment == 0 {
            return;
        }
        if let Err(e) = self.connection.writer().write_window_update(stream_id, increment) {
            debug!(stream_id, error = %e, "failed to send stream WINDOW_UPDATE");
        }
    }
}

/// Application-facing reader over a request body
pub struct RequestBody {
    pipe: Arc<BodyPipe>,
}

impl RequestBody {
    pub fn new(pipe: Arc<BodyPipe>) -> Self {
        RequestBody { pipe }
    }

    /// Read the remaining body into a vector
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        io::Read::read_to_end(self, &mut out)?;
        Ok(out)
    }

    /// Request trailers, available after the body has been read to the end
    pub fn trailers(&self) -> Option<Headers> {
        self.pipe.trailers()
    }

    pub fn is_complete(&self) -> bool {
        self.pipe.is_complete()
    }

    pub(crate) fn pipe(&self) -> &Arc<BodyPipe> {
        &self.pipe
    }
}

impl io::Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipe.read(buf)
    }
}

/// Response side of one stream, shared between the application, the
/// scheduler and the connection reader
pub(crate) struct ProducerState {
    pub stream_id: u32,
    /// Stream-level send window
    pub window: OutputFlowControl,
    /// Body bytes not yet framed
    pub pending: BytesMut,
    /// Response status and headers waiting to be written
    pub headers: Option<(u16, Headers)>,
    pub trailers: Option<Headers>,
    /// The application has finished the response
    pub end_requested: bool,
    pub headers_sent: bool,
    /// END_STREAM has been written
    pub completed: bool,
    pub aborted: bool,
    /// Queued on the scheduler or parked on the connection window
    pub scheduled: bool,
    /// Parked until the stream window opens
    pub waiting_stream_window: bool,
    client_count_released: bool,
}

impl ProducerState {
    /// Whether the scheduler has anything to do for this stream
    pub fn has_work(&self) -> bool {
        !self.completed
            && !self.aborted
            && (self.headers.is_some() || !self.pending.is_empty() || self.end_requested)
    }
}

/// Response output buffer for one stream
pub struct OutputProducer {
    state: Mutex<ProducerState>,
    drained: Condvar,
    scheduler: Sender<WorkItem>,
    client_active: Arc<AtomicUsize>,
}

impl OutputProducer {
    pub fn new(
        stream_id: u32,
        initial_window_size: u32,
        scheduler: Sender<WorkItem>,
        client_active: Arc<AtomicUsize>,
    ) -> Self {
        OutputProducer {
            state: Mutex::new(ProducerState {
                stream_id,
                window: OutputFlowControl::new(initial_window_size),
                pending: BytesMut::new(),
                headers: None,
                trailers: None,
                end_requested: false,
                headers_sent: false,
                completed: false,
                aborted: false,
                scheduled: false,
                waiting_stream_window: false,
                client_count_released: false,
            }),
            drained: Condvar::new(),
            scheduler,
            client_active,
        }
    }

    /// Blank the producer for a reused stream
    pub fn reset(&self, stream_id: u32, initial_window_size: u32) {
        let mut state = self.state.lock();
        state.stream_id = stream_id;
        state.window.reset(initial_window_size);
        state.pending.clear();
        state.headers = None;
        state.trailers = None;
        state.end_requested = false;
        state.headers_sent = false;
        state.completed = false;
        state.aborted = false;
        state.scheduled = false;
        state.waiting_stream_window = false;
        state.client_count_released = false;
    }

    pub fn stream_id(&self) -> u32 {
        self.state.lock().stream_id
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, ProducerState> {
        self.state.lock()
    }

    /// Queue response headers
    pub fn write_headers(self: &Arc<Self>, status: u16, headers: Headers) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        if state.headers_sent || state.headers.is_some() {
            return Err(Error::Handler("response headers already sent".to_string()));
        }
        state.headers = Some((status, headers));
        self.schedule(&mut state);
        Ok(())
    }

    /// Buffer body bytes and block until the scheduler has taken them
    pub fn write(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        if data.is_empty() {
            return Ok(());
        }
        state.pending.extend_from_slice(data);
        self.schedule(&mut state);

        while !state.pending.is_empty() && !state.aborted {
            self.drained.wait(&mut state);
        }
        if state.aborted {
            return Err(Error::StreamAborted(state.stream_id));
        }
        Ok(())
    }

    /// Finish the response, with optional trailers
    pub fn finish(self: &Arc<Self>, trailers: Option<Headers>) -> Result<()> {
        let mut state = self.state.lock();
        self.check_writable(&state)?;
        state.trailers = trailers.filter(|t| !t.is_empty());
        state.end_requested = true;
        self.schedule(&mut state);
        Ok(())
    }

    /// Wait until END_STREAM is on the wire or the stream is aborted
    ///
    /// Returns true if the response completed normally.
    pub fn wait_complete(&self) -> bool {
        let mut state = self.state.lock();
        while !state.completed && !state.aborted {
            self.drained.wait(&mut state);
        }
        state.completed && !state.aborted
    }

    /// Apply a stream WINDOW_UPDATE, false on overflow
    pub fn on_window_update(self: &Arc<Self>, increment: u32) -> bool {
        let mut state = self.state.lock();
        if !state.window.try_update_window(increment) {
            return false;
        }
        self.unpark_stream(&mut state);
        true
    }

    /// Check a SETTINGS_INITIAL_WINDOW_SIZE delta against this stream
    pub fn can_apply_delta(&self, delta: i64) -> bool {
        self.state.lock().window.can_apply_delta(delta)
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta, checked beforehand
    pub fn apply_delta(self: &Arc<Self>, delta: i64) {
        let mut state = self.state.lock();
        state.window.apply_delta(delta);
        if delta > 0 {
            self.unpark_stream(&mut state);
        }
    }

    /// Abort output; pending bytes are dropped and blocked writers released
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        state.pending.clear();
        state.window.abort();
        self.release_client_count(&mut state);
        self.drained.notify_all();
        trace!(stream_id = state.stream_id, "stream output aborted");
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Completed and not queued with the scheduler
    ///
    /// A scheduler turn that just finished may still hold a clone, but it
    /// never touches a completed producer again.
    pub fn is_released(&self) -> bool {
        let state = self.state.lock();
        state.completed && !state.aborted && !state.scheduled
    }

    pub fn headers_sent(&self) -> bool {
        let state = self.state.lock();
        state.headers_sent || state.headers.is_some()
    }

    /// Stream-level send credit
    pub fn window_available(&self) -> i64 {
        self.state.lock().window.available()
    }

    /// Record that END_STREAM was written, called by the scheduler with the
    /// state already locked
    pub(crate) fn mark_completed(&self, state: &mut ProducerState) {
        state.completed = true;
        state.pending.clear();
        self.release_client_count(state);
        self.drained.notify_all();
    }

    pub(crate) fn notify(&self) {
        self.drained.notify_all();
    }

    /// Hand the producer to the scheduler if it has work and is not
    /// already queued
    pub(crate) fn schedule(self: &Arc<Self>, state: &mut ProducerState) {
        if state.scheduled || !state.has_work() {
            return;
        }
        state.scheduled = true;
        if self
            .scheduler
            .send(WorkItem::Produce(Arc::clone(self)))
            .is_err()
        {
            // Scheduler is gone, so the connection is too.
            state.scheduled = false;
            state.aborted = true;
            self.release_client_count(state);
            self.drained.notify_all();
        }
    }

    fn unpark_stream(self: &Arc<Self>, state: &mut ProducerState) {
        if state.waiting_stream_window && state.window.is_available() {
            state.waiting_stream_window = false;
            self.schedule(state);
        }
    }

    fn check_writable(&self, state: &ProducerState) -> Result<()> {
        if state.aborted {
            return Err(Error::StreamAborted(state.stream_id));
        }
        if state.end_requested {
            return Err(Error::Handler("response already finished".to_string()));
        }
        Ok(())
    }

    fn release_client_count(&self, state: &mut ProducerState) {
        if !state.client_count_released {
            state.client_count_released = true;
            self.client_active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::writer::tests::{capture_writer, Capture};
    use crossbeam_channel::unbounded;
    use std::io::Read;

    fn pipe_with(window: u32) -> (Arc<BodyPipe>, Capture) {
        let (writer, capture) = capture_writer();
        let connection = Arc::new(ConnectionInput::new(window, writer));
        (Arc::new(BodyPipe::new(1, window, connection)), capture)
    }

    #[test]
    fn test_body_read_in_order() {
        let (pipe, _capture) = pipe_with(65_535);
        pipe.receive(Bytes::from_static(b"hello "), 6).unwrap();
        pipe.receive(Bytes::from_static(b"world"), 5).unwrap();
        pipe.complete();

        let mut body = RequestBody::new(pipe);
        assert_eq!(body.read_all().unwrap(), b"hello world");
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stream_window_overflow_is_stream_error() {
        let (pipe, _capture) = pipe_with(10);
        pipe.receive(Bytes::from_static(b"12345678"), 8).unwrap();
        let err = pipe.receive(Bytes::from_static(b"abc"), 3).unwrap_err();
        assert!(!err.is_connection_error());
        assert_eq!(err.code, ErrorCode::FlowControlError);
    }

    #[test]
    fn test_connection_window_overflow_is_connection_error() {
        let (writer, _capture) = capture_writer();
        let connection = Arc::new(ConnectionInput::new(10, writer));
        let a = BodyPipe::new(1, 65_535, Arc::clone(&connection));
        let b = BodyPipe::new(3, 65_535, Arc::clone(&connection));
        a.receive(Bytes::from(vec![0u8; 8]), 8).unwrap();
        let err = b.receive(Bytes::from(vec![0u8; 3]), 3).unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(err.code, ErrorCode::FlowControlError);
    }

    #[test]
    fn test_reading_sends_window_updates() {
        let (pipe, capture) = pipe_with(100);
        pipe.receive(Bytes::from(vec![7u8; 60]), 60).unwrap();
        let mut buf = [0u8; 60];
        assert_eq!(pipe.read(&mut buf).unwrap(), 60);

        let updates = capture.window_updates();
        assert!(updates.contains(&(1, 60)));
        assert!(updates.contains(&(0, 60)));
    }

    #[test]
    fn test_padding_released_immediately() {
        let (pipe, capture) = pipe_with(100);
        // 10 data bytes in a frame carrying 50 bytes of padding
        pipe.receive(Bytes::from(vec![1u8; 10]), 60).unwrap();
        assert_eq!(pipe.buffered(), 10);
        let updates = capture.window_updates();
        assert!(updates.contains(&(1, 50)));
        assert!(updates.contains(&(0, 50)));
    }

    #[test]
    fn test_abort_returns_credit_to_connection() {
        let (writer, _capture) = capture_writer();
        let connection = Arc::new(ConnectionInput::new(100, writer));
        let pipe = BodyPipe::new(1, 100, Arc::clone(&connection));
        pipe.receive(Bytes::from(vec![0u8; 40]), 40).unwrap();
        assert_eq!(connection.available(), 60);

        pipe.abort();
        assert_eq!(connection.available(), 100);
        let mut buf = [0u8; 8];
        assert_eq!(
            pipe.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionAborted
        );

        // late data for the aborted stream goes straight back
        pipe.receive(Bytes::from(vec![0u8; 20]), 20).unwrap();
        assert_eq!(connection.available(), 100);
    }

    #[test]
    fn test_trailers_visible_after_end() {
        let (pipe, _capture) = pipe_with(100);
        let mut trailers = Headers::new();
        trailers.insert("grpc-status", "0");
        pipe.set_trailers(trailers);
        assert!(pipe.trailers().is_none());
        pipe.complete();
        assert_eq!(pipe.trailers().unwrap().get("grpc-status"), Some("0"));
    }

    #[test]
    fn test_producer_schedules_once() {
        let (tx, rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(1));
        let producer = Arc::new(OutputProducer::new(1, 100, tx, Arc::clone(&active)));

        producer.write_headers(200, Headers::new()).unwrap();
        producer.finish(None).unwrap();
        assert_eq!(rx.len(), 1);
        assert!(producer.headers_sent());
        assert!(producer.finish(None).is_err());
    }

    #[test]
    fn test_producer_abort_releases_count_once() {
        let (tx, _rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(2));
        let producer = Arc::new(OutputProducer::new(1, 100, tx, Arc::clone(&active)));
        producer.abort();
        producer.abort();
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(!producer.wait_complete());
        assert!(matches!(producer.write(b"x"), Err(Error::StreamAborted(1))));
    }

    #[test]
    fn test_producer_window_update_overflow() {
        let (tx, _rx) = unbounded();
        let active = Arc::new(AtomicUsize::new(1));
        let producer = Arc::new(OutputProducer::new(1, 0x7FFF_FFFF, tx, active));
        assert!(!producer.on_window_update(1));
        assert!(producer.can_apply_delta(0));
        assert!(!producer.can_apply_delta(1));
    }
}
