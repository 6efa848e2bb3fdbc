//! HTTP/2 server connection
//!
//! One `Http2Connection` owns one transport. Its reader loop runs on the
//! connection's own thread: it reads the preface, parses frames, dispatches
//! them to streams and tracks every stream from the first HEADERS until the
//! stream object is dropped or returned to the pool. Responses are produced
//! by worker threads and written by the output scheduler, so the reader
//! never blocks on the application.
//!
//! Between reads the loop wakes every tick to process completed streams,
//! drive keep-alive and the graceful close.

use super::calm::CalmDownCounter;
use super::codec::FrameCodec;
use super::config::Http2Config;
use super::error::{Error, ErrorCode, ProtocolError, Result};
use super::frames::{
    ContinuationFrame, DataFrame, Frame, FrameType, GoawayFrame, HeadersFrame, PingFrame,
    PriorityFrame, RstStreamFrame, WindowUpdateFrame,
};
use super::hpack::HeaderBlockDecoder;
use super::keepalive::{KeepAlive, KeepAliveState, KEEP_ALIVE_PING_PAYLOAD};
use super::pipe::{BodyPipe, ConnectionInput, OutputProducer, RequestBody};
use super::pool::StreamPool;
use super::preface::{self, PrefaceStatus, CONNECTION_PREFACE};
use super::scheduler::OutputScheduler;
use super::service::{H2Request, H2Response, Handler, StreamJob, WorkerPool};
use super::settings::{PeerSettings, Settings, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};
use super::stream::{HeaderValidator, Stream, StreamId};
use super::writer::FrameWriter;
use crate::http::{HttpSession, SessionOps};
use bytes::{Buf, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Notification from a worker back to the connection reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    /// The application is done with the stream and its output is flushed
    /// or aborted
    Completed { stream_id: StreamId, aborted: bool },
}

#[derive(Debug, Default)]
struct ConnectionShared {
    shutdown: AtomicBool,
    closed: AtomicBool,
    /// Published by the reader after every loop iteration
    tracked: AtomicUsize,
    pooled: AtomicUsize,
    reused: AtomicU64,
}

/// Control handle for a running connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    shared: Arc<ConnectionShared>,
    client_active: Arc<AtomicUsize>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the connection to close gracefully
    ///
    /// Open streams are allowed to finish; the connection sends its final
    /// GOAWAY once they have.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Client streams whose response has not been completed yet
    pub fn active_streams(&self) -> usize {
        self.client_active.load(Ordering::SeqCst)
    }

    /// Streams in the stream table, including completed ones still draining
    pub fn tracked_streams(&self) -> usize {
        self.shared.tracked.load(Ordering::SeqCst)
    }

    /// Stream objects parked in the pool
    pub fn pooled_streams(&self) -> usize {
        self.shared.pooled.load(Ordering::SeqCst)
    }

    /// Streams started from a pooled stream object
    pub fn reused_streams(&self) -> u64 {
        self.shared.reused.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseInitiator {
    Server,
    Client,
}

/// Where a header block in progress will land
enum BlockTarget {
    /// Request headers of a new stream, not yet in the stream table
    Request(Stream),
    /// Trailers of a stream already in the table
    Trailers,
}

struct HeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    target: BlockTarget,
}

/// Server side of one HTTP/2 connection
pub struct Http2Connection<S: SessionOps> {
    id: u64,
    config: Arc<Http2Config>,
    session: HttpSession<S>,
    handler: Arc<dyn Handler>,
    workers: Arc<WorkerPool>,
    writer: Arc<FrameWriter>,
    scheduler: OutputScheduler,
    input: Arc<ConnectionInput>,
    server_settings: PeerSettings,
    client_settings: PeerSettings,
    read_buf: BytesMut,
    decoder: HeaderBlockDecoder,
    streams: HashMap<StreamId, Stream>,
    highest_opened: StreamId,
    header_block: Option<HeaderBlock>,
    /// Streams whose response is not complete; shared with every producer
    client_active: Arc<AtomicUsize>,
    /// Streams the application has not handed back yet
    server_active: usize,
    /// Streams the application is done with, waiting to be removed
    completed: VecDeque<StreamId>,
    events_tx: Sender<StreamEvent>,
    events_rx: Receiver<StreamEvent>,
    pool: StreamPool,
    calm: CalmDownCounter,
    keep_alive: Option<KeepAlive>,
    shared: Arc<ConnectionShared>,
    close_initiator: Option<CloseInitiator>,
    close_started: bool,
    close_deadline: Option<Instant>,
    goaway_sent: bool,
}

impl<S: SessionOps> Http2Connection<S> {
    /// Set up a connection over an accepted transport
    ///
    /// Nothing is read or written until [`run`](Self::run).
    pub fn new(
        session: HttpSession<S>,
        config: Arc<Http2Config>,
        handler: Arc<dyn Handler>,
        workers: Arc<WorkerPool>,
    ) -> Result<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let sink = session.try_clone()?;
        let writer = Arc::new(FrameWriter::new(Box::new(sink)));
        let scheduler = OutputScheduler::spawn(Arc::clone(&writer), id)?;
        let input = Arc::new(ConnectionInput::new(
            config.initial_connection_window_size,
            Arc::clone(&writer),
        ));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let now = Instant::now();

        Ok(Http2Connection {
            id,
            server_settings: config.server_settings(),
            client_settings: PeerSettings::default(),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            decoder: HeaderBlockDecoder::new(
                config.header_table_size,
                config.max_header_list_size as usize,
            ),
            streams: HashMap::new(),
            highest_opened: 0,
            header_block: None,
            client_active: Arc::new(AtomicUsize::new(0)),
            server_active: 0,
            completed: VecDeque::new(),
            events_tx,
            events_rx,
            pool: StreamPool::new(config.stream_pool_size, config.stream_pool_ttl()),
            calm: CalmDownCounter::new(
                config.calm_down_max_stream_starts,
                config.calm_down_window(),
                now,
            ),
            keep_alive: config
                .keep_alive_ping_interval()
                .map(|interval| KeepAlive::new(interval, config.keep_alive_ping_timeout(), now)),
            shared: Arc::new(ConnectionShared::default()),
            close_initiator: None,
            close_started: false,
            close_deadline: None,
            goaway_sent: false,
            config,
            session,
            handler,
            workers,
            writer,
            scheduler,
            input,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            shared: Arc::clone(&self.shared),
            client_active: Arc::clone(&self.client_active),
        }
    }

    /// Serve the connection until it closes
    ///
    /// A peer that simply disconnects is not an error. Protocol errors are
    /// returned after the GOAWAY went out and the connection was torn down.
    pub fn run(mut self) -> Result<()> {
        debug!(connection_id = self.id, "connection started");
        let outcome = self.process();

        let goaway = match &outcome {
            Ok(()) => None,
            Err(Error::Protocol(e)) => {
                debug!(
                    connection_id = self.id,
                    code = %e.code,
                    reason = %e.reason,
                    "connection error"
                );
                Some(e.code)
            }
            Err(e) if e.is_connection_closed() => {
                debug!(connection_id = self.id, "peer closed the connection");
                None
            }
            Err(e) => {
                warn!(connection_id = self.id, error = %e, "connection failed");
                Some(ErrorCode::InternalError)
            }
        };
        self.teardown(goaway);

        match outcome {
            Err(e) if e.is_connection_closed() => Ok(()),
            other => other,
        }
    }

    fn process(&mut self) -> Result<()> {
        self.check_transport_security()?;
        if !self.read_preface()? {
            return Ok(());
        }

        self.writer
            .write_settings(&self.server_settings.non_default_settings())?;
        let surplus = self
            .config
            .initial_connection_window_size
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if surplus > 0 {
            self.writer.write_window_update(0, surplus)?;
        }

        loop {
            let frame_received = self.read_frames()?;
            self.drain_events();

            let now = Instant::now();
            self.update_completed_streams(now)?;
            self.on_tick(frame_received, now)?;
            let done = self.update_connection_state(now)?;
            self.publish_stats();
            if done {
                return Ok(());
            }
        }
    }

    fn publish_stats(&self) {
        self.shared.tracked.store(self.streams.len(), Ordering::SeqCst);
        self.shared.pooled.store(self.pool.len(), Ordering::SeqCst);
    }

    fn check_transport_security(&self) -> Result<()> {
        if let Some(version) = self.session.get_ref().tls_version() {
            if version < self.config.min_tls_version {
                return Err(ProtocolError::connection(
                    ErrorCode::InadequateSecurity,
                    format!("{} is below the minimum TLS version", version.name()),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Wait for the client preface; false when the connection must close
    /// without HTTP/2 framing
    fn read_preface(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.config.preface_timeout();
        loop {
            match preface::detect(&self.read_buf) {
                PrefaceStatus::Http2 => {
                    self.read_buf.advance(CONNECTION_PREFACE.len());
                    trace!(connection_id = self.id, "client preface received");
                    return Ok(true);
                }
                PrefaceStatus::Http1 => {
                    debug!(connection_id = self.id, "HTTP/1.x request on HTTP/2 connection");
                    self.writer.write_raw(&preface::http1_refusal())?;
                    return Ok(false);
                }
                PrefaceStatus::Invalid => {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "invalid connection preface",
                    )
                    .into());
                }
                PrefaceStatus::Incomplete => {}
            }

            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::connection(
                    ErrorCode::ProtocolError,
                    "timed out waiting for the connection preface",
                )
                .into());
            }
            let wait = (deadline - now).min(self.config.tick_interval());
            if self.session.wait_readable(wait)? {
                self.fill_buffer()?;
            }
        }
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = self.session.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read and process whatever arrives within one tick
    ///
    /// Returns whether any frame was received.
    fn read_frames(&mut self) -> Result<bool> {
        if !self.session.wait_readable(self.config.tick_interval())? {
            return Ok(false);
        }
        self.fill_buffer()?;

        let mut received = false;
        while let Some(frame) =
            FrameCodec::try_read_frame(&mut self.read_buf, self.server_settings.max_frame_size)?
        {
            received = true;
            trace!(
                connection_id = self.id,
                frame = frame.type_name(),
                stream_id = frame.stream_id,
                len = frame.payload_len(),
                flags = frame.flags.as_u8(),
                "received frame"
            );
            match self.process_frame(frame) {
                Ok(()) => {}
                Err(Error::Protocol(e)) if !e.is_connection_error() => self.reset_stream(e)?,
                Err(e) => return Err(e),
            }
        }
        Ok(received)
    }

    fn process_frame(&mut self, frame: Frame) -> Result<()> {
        let kind = frame.frame_type();
        if self.header_block.is_some() && kind != Some(FrameType::Continuation) {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "expected CONTINUATION frame",
            ));
        }

        match kind {
            Some(FrameType::Data) => self.on_data(frame),
            Some(FrameType::Headers) => self.on_headers(frame),
            Some(FrameType::Priority) => self.on_priority(frame),
            Some(FrameType::RstStream) => self.on_rst_stream(frame),
            Some(FrameType::Settings) => self.on_settings(frame),
            Some(FrameType::PushPromise) => Err(connection_error(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE sent by client",
            )),
            Some(FrameType::Ping) => self.on_ping(frame),
            Some(FrameType::Goaway) => self.on_goaway(frame),
            Some(FrameType::WindowUpdate) => self.on_window_update(frame),
            Some(FrameType::Continuation) => self.on_continuation(frame),
            // Unknown frame types are ignored.
            None => Ok(()),
        }
    }

    fn check_not_idle(&self, frame: &Frame) -> Result<()> {
        if frame.stream_id > self.highest_opened {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                format!("{} frame on idle stream {}", frame.type_name(), frame.stream_id),
            ));
        }
        Ok(())
    }

    fn on_data(&mut self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        if stream_id == 0 {
            return Err(connection_error(ErrorCode::ProtocolError, "DATA frame on stream 0"));
        }
        let flow_len = frame.payload_len();
        let Some(data) = DataFrame::parse(&frame) else {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "DATA padding exceeds payload",
            ));
        };
        self.check_not_idle(&frame)?;

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(connection_error(
                ErrorCode::StreamClosed,
                format!("DATA frame on closed stream {}", stream_id),
            ));
        };
        if stream.rst_received() || stream.end_stream_received() {
            return Err(connection_error(
                ErrorCode::StreamClosed,
                format!("DATA frame after stream {} was closed", stream_id),
            ));
        }
        stream.on_data(data.data, flow_len, data.end_stream)?;
        Ok(())
    }

    fn on_headers(&mut self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        if stream_id == 0 || stream_id % 2 == 0 {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                format!("HEADERS frame on invalid stream {}", stream_id),
            ));
        }
        let Some(headers) = HeadersFrame::parse(&frame) else {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "HEADERS padding exceeds payload",
            ));
        };
        if headers
            .priority
            .map_or(false, |p| p.stream_dependency == stream_id)
        {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                format!("stream {} depends on itself", stream_id),
            ));
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.rst_received() || stream.end_stream_received() {
                return Err(connection_error(
                    ErrorCode::StreamClosed,
                    format!("HEADERS frame after stream {} was closed", stream_id),
                ));
            }
            if !headers.end_stream {
                return Err(connection_error(
                    ErrorCode::ProtocolError,
                    "trailers without END_STREAM",
                ));
            }
            stream.begin_trailers();
            self.header_block = Some(HeaderBlock {
                stream_id,
                end_stream: true,
                target: BlockTarget::Trailers,
            });
        } else {
            if stream_id <= self.highest_opened {
                return Err(connection_error(
                    ErrorCode::StreamClosed,
                    format!("HEADERS frame on closed stream {}", stream_id),
                ));
            }
            self.highest_opened = stream_id;
            let stream = self.acquire_stream(stream_id, Instant::now());
            self.header_block = Some(HeaderBlock {
                stream_id,
                end_stream: headers.end_stream,
                target: BlockTarget::Request(stream),
            });
        }

        self.decode_fragment(&headers.header_block, headers.end_headers)
    }

    fn on_continuation(&mut self, frame: Frame) -> Result<()> {
        let Some(block) = &self.header_block else {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "CONTINUATION without a header block in progress",
            ));
        };
        if frame.stream_id != block.stream_id {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                format!(
                    "CONTINUATION on stream {} while stream {} is sending headers",
                    frame.stream_id, block.stream_id
                ),
            ));
        }
        let continuation = ContinuationFrame::parse(&frame);
        self.decode_fragment(&continuation.header_block, continuation.end_headers)
    }

    fn decode_fragment(&mut self, fragment: &[u8], end_headers: bool) -> Result<()> {
        self.decoder.push_fragment(fragment)?;
        if end_headers {
            self.finish_header_block()?;
        }
        Ok(())
    }

    fn finish_header_block(&mut self) -> Result<()> {
        let Some(block) = self.header_block.take() else {
            return Ok(());
        };
        let fields = self.decoder.finish()?;

        match block.target {
            BlockTarget::Request(mut stream) => {
                for (name, value) in &fields {
                    stream.on_header(name, value)?;
                }
                self.start_stream(stream, block.end_stream)
            }
            BlockTarget::Trailers => {
                let Some(stream) = self.streams.get_mut(&block.stream_id) else {
                    return Err(connection_error(
                        ErrorCode::StreamClosed,
                        format!("trailers for removed stream {}", block.stream_id),
                    ));
                };
                for (name, value) in &fields {
                    stream.on_header(name, value)?;
                }
                stream.on_end_stream_received()?;
                Ok(())
            }
        }
    }

    /// A blank stream, from the pool when one is available
    fn acquire_stream(&mut self, stream_id: StreamId, now: Instant) -> Stream {
        let receive_window = self.config.initial_stream_window_size;
        let send_window = self.client_settings.initial_window_size;

        if let Some(mut stream) = self.pool.pop(now) {
            self.shared.reused.fetch_add(1, Ordering::SeqCst);
            stream.reset(stream_id, receive_window, send_window);
            return stream;
        }

        Stream::new(
            stream_id,
            Arc::new(BodyPipe::new(stream_id, receive_window, Arc::clone(&self.input))),
            Arc::new(OutputProducer::new(
                stream_id,
                send_window,
                self.scheduler.sender(),
                Arc::clone(&self.client_active),
            )),
            HeaderValidator::new(
                self.config.max_header_list_size as usize,
                self.config.enable_connect_protocol,
            ),
        )
    }

    fn start_stream(&mut self, mut stream: Stream, end_stream: bool) -> Result<()> {
        let stream_id = stream.id();
        if self.close_initiator.is_none() && !self.calm.record_start(Instant::now()) {
            return Err(connection_error(
                ErrorCode::EnhanceYourCalm,
                "too many stream starts",
            ));
        }

        self.client_active.fetch_add(1, Ordering::SeqCst);
        self.server_active += 1;

        let admitted = self
            .admit_stream(&mut stream, end_stream)
            .and_then(|()| self.dispatch(&mut stream));
        self.streams.insert(stream_id, stream);

        if let Err(e) = admitted {
            self.make_space_in_drain_queue();
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.on_output_completed(true);
            }
            self.completed.push_back(stream_id);
            return Err(e);
        }
        Ok(())
    }

    fn admit_stream(&self, stream: &mut Stream, end_stream: bool) -> Result<()> {
        stream.validate_request()?;
        if end_stream {
            stream.on_end_stream_received()?;
        }

        let max = self.server_settings.max_concurrent_streams as usize;
        if self.client_active.load(Ordering::SeqCst) > max {
            return Err(ProtocolError::stream(
                stream.id(),
                ErrorCode::RefusedStream,
                "maximum concurrent streams exceeded",
            )
            .into());
        }
        if self.streams.len() + 1 > max.saturating_mul(2) {
            return Err(ProtocolError::stream(
                stream.id(),
                ErrorCode::EnhanceYourCalm,
                "too many streams awaiting client acknowledgement",
            )
            .into());
        }
        Ok(())
    }

    fn dispatch(&self, stream: &mut Stream) -> Result<()> {
        let stream_id = stream.id();
        let job = StreamJob {
            handler: Arc::clone(&self.handler),
            request: H2Request::new(
                stream_id,
                stream.take_head(),
                RequestBody::new(Arc::clone(stream.pipe())),
            ),
            response: H2Response::new(stream_id, Arc::clone(stream.producer())),
            writer: Arc::clone(&self.writer),
            events: self.events_tx.clone(),
            connection_id: self.id,
        };

        if !self.workers.execute(move || job.run()) {
            return Err(ProtocolError::stream(
                stream_id,
                ErrorCode::RefusedStream,
                "worker pool is shut down",
            )
            .into());
        }
        trace!(connection_id = self.id, stream_id, "request dispatched");
        Ok(())
    }

    /// Answer a stream error with RST_STREAM
    fn reset_stream(&mut self, error: ProtocolError) -> Result<()> {
        debug!(
            connection_id = self.id,
            stream_id = error.stream_id,
            code = %error.code,
            reason = %error.reason,
            "stream error"
        );
        if let Some(stream) = self.streams.get_mut(&error.stream_id) {
            stream.abort();
        }
        self.writer.write_rst_stream(error.stream_id, error.code)
    }

    fn on_priority(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(connection_error(ErrorCode::ProtocolError, "PRIORITY frame on stream 0"));
        }
        if frame.payload_len() != 5 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "PRIORITY frame must be 5 bytes",
            ));
        }
        let priority = PriorityFrame::parse(&frame);
        if priority.priority.stream_dependency == frame.stream_id {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                format!("stream {} depends on itself", frame.stream_id),
            ));
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "RST_STREAM frame on stream 0",
            ));
        }
        if frame.payload_len() != 4 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "RST_STREAM frame must be 4 bytes",
            ));
        }
        self.check_not_idle(&frame)?;

        let rst = RstStreamFrame::parse(&frame);
        if let Some(stream) = self.streams.get_mut(&rst.stream_id) {
            if stream.rst_received() {
                return Err(connection_error(
                    ErrorCode::StreamClosed,
                    format!("second RST_STREAM on stream {}", rst.stream_id),
                ));
            }
            debug!(
                connection_id = self.id,
                stream_id = rst.stream_id,
                code = rst.error_code,
                "stream reset by client"
            );
            stream.on_rst_received();
        }
        Ok(())
    }

    fn on_settings(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(connection_error(
                ErrorCode::ProtocolError,
                "SETTINGS frame on a stream",
            ));
        }
        if frame.flags.is_ack() {
            if frame.payload_len() != 0 {
                return Err(connection_error(
                    ErrorCode::FrameSizeError,
                    "SETTINGS ACK with a payload",
                ));
            }
            return Ok(());
        }
        if frame.payload_len() % 6 != 0 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "SETTINGS payload is not a multiple of 6",
            ));
        }

        let settings = Settings::parse(&frame.payload)?;
        self.apply_client_settings(&settings)
    }

    fn apply_client_settings(&mut self, settings: &Settings) -> Result<()> {
        let previous = self.client_settings;
        self.client_settings.apply(settings);
        // The ACK goes out before the window delta is checked. An overflow
        // below closes the connection, so the peer sees the ACK followed by
        // GOAWAY(FLOW_CONTROL_ERROR) and no stream window changes.
        self.writer.write_settings_ack()?;

        if self.client_settings.max_frame_size != previous.max_frame_size {
            self.writer.update_max_frame_size(
                self.client_settings
                    .max_frame_size
                    .min(self.server_settings.max_frame_size),
            );
        }
        if let Some(size) = settings.header_table_size {
            self.writer.update_header_table_size(size);
        }

        let delta = i64::from(self.client_settings.initial_window_size)
            - i64::from(previous.initial_window_size);
        if delta != 0 {
            let pending = match &self.header_block {
                Some(HeaderBlock {
                    target: BlockTarget::Request(stream),
                    ..
                }) => Some(stream),
                _ => None,
            };
            let mut producers = self
                .streams
                .values()
                .chain(pending)
                .map(|stream| stream.producer());
            if !producers.all(|producer| producer.can_apply_delta(delta)) {
                return Err(connection_error(
                    ErrorCode::FlowControlError,
                    "SETTINGS_INITIAL_WINDOW_SIZE overflows a stream window",
                ));
            }
            for stream in self.streams.values() {
                stream.producer().apply_delta(delta);
            }
            if let Some(HeaderBlock {
                target: BlockTarget::Request(stream),
                ..
            }) = &self.header_block
            {
                stream.producer().apply_delta(delta);
            }
        }
        trace!(connection_id = self.id, settings = ?self.client_settings, "client settings applied");
        Ok(())
    }

    fn on_ping(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(connection_error(ErrorCode::ProtocolError, "PING frame on a stream"));
        }
        if frame.payload_len() != 8 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "PING frame must be 8 bytes",
            ));
        }
        let ping = PingFrame::parse(&frame);
        if !ping.ack {
            self.writer.write_ping(ping.data, true)?;
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id != 0 {
            return Err(connection_error(ErrorCode::ProtocolError, "GOAWAY frame on a stream"));
        }
        if frame.payload_len() < 8 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "GOAWAY frame shorter than 8 bytes",
            ));
        }
        let goaway = GoawayFrame::parse(&frame);
        debug!(
            connection_id = self.id,
            last_stream_id = goaway.last_stream_id,
            code = goaway.error_code,
            "client sent GOAWAY"
        );
        if self.close_initiator.is_none() {
            self.close_initiator = Some(CloseInitiator::Client);
        }
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame) -> Result<()> {
        if frame.payload_len() != 4 {
            return Err(connection_error(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE frame must be 4 bytes",
            ));
        }
        self.check_not_idle(&frame)?;

        let update = WindowUpdateFrame::parse(&frame);
        if update.size_increment == 0 {
            if update.stream_id == 0 {
                return Err(connection_error(
                    ErrorCode::ProtocolError,
                    "connection WINDOW_UPDATE with zero increment",
                ));
            }
            return Err(ProtocolError::stream(
                update.stream_id,
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE with zero increment",
            )
            .into());
        }

        if update.stream_id == 0 {
            if !self.writer.update_connection_window(update.size_increment) {
                return Err(connection_error(
                    ErrorCode::FlowControlError,
                    "connection send window overflow",
                ));
            }
            return Ok(());
        }

        // Updates for streams that are gone are ignored.
        if let Some(stream) = self.streams.get(&update.stream_id) {
            if stream.rst_received() {
                return Err(connection_error(
                    ErrorCode::StreamClosed,
                    format!("WINDOW_UPDATE after stream {} was reset", update.stream_id),
                ));
            }
            if !stream.producer().on_window_update(update.size_increment) {
                return Err(ProtocolError::stream(
                    update.stream_id,
                    ErrorCode::FlowControlError,
                    "stream send window overflow",
                )
                .into());
            }
        }
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_stream_event(event);
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Completed { stream_id, aborted } => {
                trace!(connection_id = self.id, stream_id, aborted, "stream completed");
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_output_completed(aborted);
                    self.completed.push_back(stream_id);
                }
            }
        }
    }

    /// Retire completed streams
    ///
    /// A completed stream stays in the table until the client has closed
    /// its side too, or its drain timer expires, so late frames for it are
    /// still recognized.
    fn update_completed_streams(&mut self, now: Instant) -> Result<()> {
        let mut first_requeued = None;

        while let Some(stream_id) = self.completed.pop_front() {
            if first_requeued == Some(stream_id) {
                self.completed.push_front(stream_id);
                break;
            }
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };

            let expiration = match stream.drain_expiration() {
                Some(at) => at,
                None => {
                    self.server_active = self.server_active.saturating_sub(1);
                    let at = now + self.config.stream_drain_timeout();
                    stream.set_drain_expiration(at);
                    at
                }
            };

            if stream.end_stream_received() || stream.rst_received() || expiration <= now {
                if self
                    .header_block
                    .as_ref()
                    .map_or(false, |block| block.stream_id == stream_id)
                {
                    return Err(connection_error(
                        ErrorCode::StreamClosed,
                        format!("stream {} expired while receiving headers", stream_id),
                    ));
                }
                self.remove_stream(stream_id, now);
            } else {
                first_requeued.get_or_insert(stream_id);
                self.completed.push_back(stream_id);
            }
        }
        Ok(())
    }

    /// Evict the oldest completed streams while the table is full
    fn make_space_in_drain_queue(&mut self) {
        let max = (self.server_settings.max_concurrent_streams as usize).saturating_mul(2);
        let now = Instant::now();
        while self.streams.len() >= max {
            let Some(stream_id) = self.completed.pop_front() else {
                break;
            };
            if let Some(stream) = self.streams.get(&stream_id) {
                if stream.drain_expiration().is_none() {
                    self.server_active = self.server_active.saturating_sub(1);
                }
            }
            self.remove_stream(stream_id, now);
        }
    }

    fn remove_stream(&mut self, stream_id: StreamId, now: Instant) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            let pooled = self.pool.push(stream, now);
            trace!(connection_id = self.id, stream_id, pooled, "stream removed");
        }
    }

    fn on_tick(&mut self, frame_received: bool, now: Instant) -> Result<()> {
        if let Some(keep_alive) = &mut self.keep_alive {
            match keep_alive.process(frame_received, now) {
                KeepAliveState::SendPing => {
                    trace!(connection_id = self.id, "sending keep-alive PING");
                    self.writer.write_ping(KEEP_ALIVE_PING_PAYLOAD, false)?;
                }
                KeepAliveState::Timeout => {
                    return Err(connection_error(
                        ErrorCode::InternalError,
                        "keep-alive ping timed out",
                    ));
                }
                KeepAliveState::Idle | KeepAliveState::PingSent => {}
            }
        }

        let expired = self.pool.remove_expired(now);
        if expired > 0 {
            trace!(connection_id = self.id, expired, "pooled streams expired");
        }
        Ok(())
    }

    /// Drive the graceful close; true once the connection should stop
    fn update_connection_state(&mut self, now: Instant) -> Result<bool> {
        if self.close_initiator.is_none() && self.shared.shutdown.load(Ordering::SeqCst) {
            self.close_initiator = Some(CloseInitiator::Server);
        }
        let Some(initiator) = self.close_initiator else {
            return Ok(false);
        };

        let active = self.client_active.load(Ordering::SeqCst);
        if !self.close_started {
            self.close_started = true;
            self.close_deadline = Some(now + self.config.shutdown_timeout());
            info!(
                connection_id = self.id,
                initiator = ?initiator,
                active,
                "graceful close started"
            );
            // Tell the client to stop opening streams while ours drain.
            if initiator == CloseInitiator::Server && active > 0 {
                self.writer.write_goaway(MAX_WINDOW_SIZE, ErrorCode::NoError)?;
            }
        }

        if active == 0 {
            self.send_final_goaway(ErrorCode::NoError)?;
            return Ok(true);
        }
        if self.close_deadline.map_or(false, |deadline| now >= deadline) {
            warn!(
                connection_id = self.id,
                active, "graceful close timed out, aborting streams"
            );
            self.send_final_goaway(ErrorCode::NoError)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn send_final_goaway(&mut self, code: ErrorCode) -> Result<()> {
        if self.goaway_sent {
            return Ok(());
        }
        self.goaway_sent = true;
        self.writer.write_goaway(self.highest_opened, code)
    }

    fn teardown(&mut self, goaway: Option<ErrorCode>) {
        if let Some(code) = goaway {
            if let Err(e) = self.send_final_goaway(code) {
                trace!(connection_id = self.id, error = %e, "could not send GOAWAY");
            }
        }
        self.input.stop_window_updates();

        if let Some(HeaderBlock {
            target: BlockTarget::Request(mut stream),
            ..
        }) = self.header_block.take()
        {
            stream.abort();
        }
        for stream in self.streams.values_mut() {
            stream.abort();
        }

        // Aborted handlers unblock and hand their streams back.
        let deadline = Instant::now() + self.config.shutdown_timeout();
        loop {
            let running = self
                .streams
                .values()
                .filter(|stream| !stream.output_completed())
                .count();
            if running == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    connection_id = self.id,
                    running, "handlers still running at connection close"
                );
                break;
            }
            if let Ok(event) = self.events_rx.recv_timeout(deadline - now) {
                self.on_stream_event(event);
            }
        }

        self.completed.clear();
        self.streams.clear();
        self.pool.clear();
        self.server_active = 0;

        self.writer.complete();
        if let Err(e) = self.session.close() {
            trace!(connection_id = self.id, error = %e, "error closing session");
        }
        self.scheduler.stop();
        self.shared.closed.store(true, Ordering::SeqCst);
        debug!(connection_id = self.id, "connection closed");
    }
}

fn connection_error(code: ErrorCode, reason: impl Into<String>) -> Error {
    ProtocolError::connection(code, reason).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::codec::FRAME_HEADER_SIZE;
    use crate::http::h2::frames::HeadersFrame;
    use crate::http::h2::hpack::HeaderBlockEncoder;
    use crate::http::h2::config::Http2ConfigBuilder;
    use crate::http::session::from_tcp_stream;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn serve(config: Http2Config) -> (TcpStream, thread::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let workers = Arc::new(WorkerPool::new(2).unwrap());
            let handler: Arc<dyn Handler> =
                Arc::new(|_: &mut H2Request, resp: &mut H2Response| -> Result<()> {
                    resp.write(b"ok")
                });
            let connection =
                Http2Connection::new(from_tcp_stream(socket), Arc::new(config), handler, workers)?;
            connection.run()
        });
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, handle)
    }

    fn read_frame(client: &mut TcpStream) -> Option<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        client.read_exact(&mut header).ok()?;
        let decoded = FrameCodec::decode_header(&header);
        let mut payload = vec![0u8; decoded.length];
        client.read_exact(&mut payload).ok()?;
        let mut buf = BytesMut::from(&header[..]);
        buf.extend_from_slice(&payload);
        FrameCodec::try_read_frame(&mut buf, 1 << 24).unwrap()
    }

    fn test_config() -> Http2Config {
        Http2ConfigBuilder::new()
            .tick_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_settings_sent_after_preface() {
        let (mut client, handle) = serve(test_config());
        client.write_all(CONNECTION_PREFACE).unwrap();

        let settings = read_frame(&mut client).unwrap();
        assert_eq!(settings.frame_type(), Some(FrameType::Settings));
        assert!(!settings.flags.is_ack());
        let parsed = Settings::parse(&settings.payload).unwrap();
        assert_eq!(parsed.max_concurrent_streams, Some(100));

        // The connection window is raised past the protocol default.
        let update = read_frame(&mut client).unwrap();
        assert_eq!(update.frame_type(), Some(FrameType::WindowUpdate));
        assert_eq!(update.stream_id, 0);

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_invalid_preface_goaway() {
        let (mut client, handle) = serve(test_config());
        client.write_all(b"PRI * HTTP/2.0\r\n\r\nXX\r\n\r\n").unwrap();

        let goaway = read_frame(&mut client).unwrap();
        assert_eq!(goaway.frame_type(), Some(FrameType::Goaway));
        let parsed = GoawayFrame::parse(&goaway);
        assert_eq!(parsed.last_stream_id, 0);
        assert_eq!(parsed.error_code, ErrorCode::ProtocolError.as_u32());

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_ping_is_acknowledged() {
        let (mut client, handle) = serve(test_config());
        client.write_all(CONNECTION_PREFACE).unwrap();
        let mut out = BytesMut::new();
        FrameCodec::encode_ping(&PingFrame::new(*b"12345678"), &mut out);
        client.write_all(&out).unwrap();

        let ack = loop {
            let frame = read_frame(&mut client).unwrap();
            if frame.frame_type() == Some(FrameType::Ping) {
                break frame;
            }
        };
        assert!(ack.flags.is_ack());
        assert_eq!(&ack.payload[..], b"12345678");

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_headers_interleaved_with_other_frame() {
        let (mut client, handle) = serve(test_config());
        client.write_all(CONNECTION_PREFACE).unwrap();

        let mut encoder = HeaderBlockEncoder::new();
        let block = encoder.encode(vec![
            (&b":method"[..], &b"GET"[..]),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], &b"/"[..]),
        ]);
        let mut out = BytesMut::new();
        FrameCodec::encode_headers(
            &HeadersFrame::new(1, bytes::Bytes::from(block), true, false),
            &mut out,
        );
        FrameCodec::encode_ping(&PingFrame::new([0; 8]), &mut out);
        client.write_all(&out).unwrap();

        let goaway = loop {
            let frame = read_frame(&mut client).unwrap();
            if frame.frame_type() == Some(FrameType::Goaway) {
                break frame;
            }
        };
        let parsed = GoawayFrame::parse(&goaway);
        assert_eq!(parsed.error_code, ErrorCode::ProtocolError.as_u32());
        assert_eq!(parsed.last_stream_id, 1);
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_graceful_shutdown_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let handler: Arc<dyn Handler> =
                Arc::new(|_: &mut H2Request, _: &mut H2Response| -> Result<()> { Ok(()) });
            let connection = Http2Connection::new(
                from_tcp_stream(socket),
                Arc::new(test_config()),
                handler,
                Arc::new(WorkerPool::new(1).unwrap()),
            )?;
            handle_tx.send(connection.handle()).unwrap();
            connection.run()
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(CONNECTION_PREFACE).unwrap();
        let handle = handle_rx.recv().unwrap();
        loop {
            let frame = read_frame(&mut client).unwrap();
            if frame.frame_type() == Some(FrameType::Settings) {
                break;
            }
        }
        handle.shutdown();

        let goaway = loop {
            let frame = read_frame(&mut client).unwrap();
            if frame.frame_type() == Some(FrameType::Goaway) {
                break frame;
            }
        };
        let parsed = GoawayFrame::parse(&goaway);
        assert_eq!(parsed.last_stream_id, 0);
        assert_eq!(parsed.error_code, ErrorCode::NoError.as_u32());

        server.join().unwrap().unwrap();
        assert!(handle.is_closed());
        assert_eq!(handle.active_streams(), 0);
    }
}
