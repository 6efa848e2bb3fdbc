//! Application dispatch
//!
//! Each complete request is handed to a `Handler` on a worker thread so a
//! slow handler never stalls the connection reader. The handler reads the
//! request body through `H2Request` and writes the response through
//! `H2Response`; when it returns, the worker finishes the response, waits
//! for the output scheduler to flush it and reports the stream back to the
//! connection.

use super::connection::StreamEvent;
use super::error::{Error, ErrorCode, Result};
use super::pipe::{OutputProducer, RequestBody};
use super::stream::{RequestHead, StreamId};
use super::writer::FrameWriter;
use crate::http::Headers;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Request handler
pub trait Handler: Send + Sync + 'static {
    /// Handle one request
    ///
    /// Returning an error before anything was written produces a 500
    /// response; after the response headers went out the stream is reset
    /// with INTERNAL_ERROR instead.
    fn call(&self, request: &mut H2Request, response: &mut H2Response) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut H2Request, &mut H2Response) -> Result<()> + Send + Sync + 'static,
{
    fn call(&self, request: &mut H2Request, response: &mut H2Response) -> Result<()> {
        self(request, response)
    }
}

/// A decoded HTTP/2 request
pub struct H2Request {
    stream_id: StreamId,
    method: String,
    scheme: Option<String>,
    authority: Option<String>,
    path: Option<String>,
    protocol: Option<String>,
    headers: Headers,
    body: RequestBody,
}

impl H2Request {
    pub(crate) fn new(stream_id: StreamId, head: RequestHead, body: RequestBody) -> Self {
        H2Request {
            stream_id,
            method: head.method.unwrap_or_default(),
            scheme: head.scheme,
            authority: head.authority,
            path: head.path,
            protocol: head.protocol,
            headers: head.headers,
            body,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Extended CONNECT protocol, if any
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the first value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Request body reader
    pub fn body(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Read the whole request body
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        Ok(self.body.read_all()?)
    }

    /// Request trailers, once the body has been read to the end
    pub fn trailers(&self) -> Option<Headers> {
        self.body.trailers()
    }
}

/// Response writer for one stream
pub struct H2Response {
    stream_id: StreamId,
    status: u16,
    headers: Headers,
    producer: Arc<OutputProducer>,
    headers_written: bool,
    finished: bool,
}

impl H2Response {
    pub(crate) fn new(stream_id: StreamId, producer: Arc<OutputProducer>) -> Self {
        H2Response {
            stream_id,
            status: 200,
            headers: Headers::new(),
            producer,
            headers_written: false,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Set the status code; ignored once headers were written
    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Add a response header
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write body bytes, sending the headers first if needed
    ///
    /// Blocks until the bytes have been handed to the connection, which
    /// depends on the client's flow-control windows.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send_headers()?;
        self.producer.write(data)
    }

    /// Complete the response
    pub fn finish(&mut self) -> Result<()> {
        self.finish_inner(None)
    }

    /// Complete the response with trailers
    pub fn finish_with_trailers(&mut self, trailers: Headers) -> Result<()> {
        self.finish_inner(Some(trailers))
    }

    fn finish_inner(&mut self, trailers: Option<Headers>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.send_headers()?;
        self.finished = true;
        self.producer.finish(trailers)
    }

    fn send_headers(&mut self) -> Result<()> {
        if self.headers_written {
            return Ok(());
        }
        if self.finished {
            return Err(Error::Handler("response already finished".to_string()));
        }
        self.headers_written = true;
        self.producer
            .write_headers(self.status, std::mem::take(&mut self.headers))
    }

    pub(crate) fn producer(&self) -> &Arc<OutputProducer> {
        &self.producer
    }
}

impl io::Write for H2Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        H2Response::write(self, buf).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One request on its way through a worker
pub(crate) struct StreamJob {
    pub handler: Arc<dyn Handler>,
    pub request: H2Request,
    pub response: H2Response,
    pub writer: Arc<FrameWriter>,
    pub events: Sender<StreamEvent>,
    pub connection_id: u64,
}

impl StreamJob {
    pub fn run(self) {
        let StreamJob {
            handler,
            mut request,
            mut response,
            writer,
            events,
            connection_id,
        } = self;
        let stream_id = request.stream_id();
        trace!(connection_id, stream_id, method = request.method(), "dispatching request");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.call(&mut request, &mut response)
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("request handler panicked".to_string()),
        };

        let producer = Arc::clone(response.producer());
        let pipe = Arc::clone(request.body().pipe());

        match failure {
            None => {
                if let Err(e) = response.finish() {
                    trace!(connection_id, stream_id, error = %e, "could not finish response");
                }
            }
            Some(reason) if producer.is_aborted() => {
                trace!(connection_id, stream_id, reason, "handler failed on an aborted stream");
            }
            Some(reason) if !response.headers_sent() => {
                debug!(connection_id, stream_id, reason, "request handler failed");
                response.headers_mut().clear();
                response.set_status(500);
                let _ = response.finish();
            }
            Some(reason) => {
                debug!(connection_id, stream_id, reason, "request handler failed mid-response");
                if let Err(e) = writer.write_rst_stream(stream_id, ErrorCode::InternalError) {
                    debug!(connection_id, stream_id, error = %e, "failed to reset stream");
                }
                producer.abort();
                pipe.abort();
            }
        }

        let mut aborted = !producer.wait_complete();
        if !aborted && !pipe.is_complete() && !pipe.is_aborted() {
            // The response is done but the client is still sending a body
            // nobody will read.
            if let Err(e) = writer.write_rst_stream(stream_id, ErrorCode::NoError) {
                debug!(connection_id, stream_id, error = %e, "failed to reset stream");
            }
            pipe.abort();
            aborted = true;
        }

        drop(pipe);
        drop(producer);
        drop(request);
        drop(response);
        if events.send(StreamEvent::Completed { stream_id, aborted }).is_err() {
            trace!(connection_id, stream_id, "connection gone before stream completed");
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    receiver: Receiver<Job>,
    /// Threads that never retire
    core: usize,
    idle_timeout: Duration,
    /// Threads alive, core included
    live: AtomicUsize,
    /// Threads waiting for a job
    idle: AtomicUsize,
    next_id: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    /// Give up this thread if it is above the core count
    fn try_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::SeqCst);
        while live > self.core {
            match self
                .live
                .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
        false
    }
}

/// Pool of handler threads shared by every connection
///
/// `core` threads stay alive for the life of the pool. A handler may block
/// for as long as its client takes to send the request body, so a job that
/// arrives while no thread is idle starts a new one; those extra threads
/// exit after `idle_timeout` without work.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Spawn `threads` core threads with the default idle timeout
    pub fn new(threads: usize) -> io::Result<Self> {
        Self::with_idle_timeout(threads, DEFAULT_WORKER_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(threads: usize, idle_timeout: Duration) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let pool = WorkerPool {
            sender: Some(sender),
            shared: Arc::new(PoolShared {
                receiver,
                core: threads.max(1),
                idle_timeout,
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        };
        for _ in 0..pool.shared.core {
            spawn_worker(&pool.shared)?;
        }
        Ok(pool)
    }

    /// Queue a job; false once the pool has shut down
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };
        if sender.send(Box::new(job)).is_err() {
            return false;
        }
        // Workers drop their idle mark before checking the queue on the way
        // out, so a job is never left behind without a thread to take it.
        if self.shared.receiver.len() > self.shared.idle.load(Ordering::SeqCst) {
            if let Err(e) = spawn_worker(&self.shared) {
                warn!(error = %e, "failed to start extra worker thread");
            }
        }
        true
    }

    /// Worker threads currently alive
    pub fn size(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Worker threads waiting for a job
    pub fn idle(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&mut self) {
        self.sender.take();
        let workers: Vec<_> = self.shared.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Default for [`WorkerPool::new`]
pub const DEFAULT_WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn spawn_worker(shared: &Arc<PoolShared>) -> io::Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    shared.live.fetch_add(1, Ordering::SeqCst);
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("h2-worker-{}", id))
        .spawn(move || worker_loop(&worker));

    match spawned {
        Ok(handle) => {
            let mut workers = shared.workers.lock();
            workers.retain(|w| !w.is_finished());
            workers.push(handle);
            Ok(())
        }
        Err(e) => {
            shared.live.fetch_sub(1, Ordering::SeqCst);
            Err(e)
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let next = shared.receiver.recv_timeout(shared.idle_timeout);
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match next {
            Ok(job) => job(),
            Err(RecvTimeoutError::Timeout) => {
                if shared.receiver.is_empty() && shared.try_retire() {
                    trace!("idle worker thread exiting");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}
