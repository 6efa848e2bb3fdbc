//! HTTP/2 server
//!
//! Accepts TCP connections and runs one [`Http2Connection`] per connection
//! on its own thread. All connections share a single worker pool for
//! request handlers.
//!
//! ```no_run
//! use h2serve::http::h2::{H2Request, H2Response, H2ServerBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let server = H2ServerBuilder::new()
//!     .handler(|_req: &mut H2Request, resp: &mut H2Response| -> Result<()> {
//!         resp.header("content-type", "text/plain");
//!         resp.write(b"hello")
//!     })
//!     .bind("127.0.0.1:8080")?;
//! server.serve()
//! # }
//! ```

use super::config::Http2Config;
use super::connection::{ConnectionHandle, Http2Connection};
use super::error::{Error, Result};
use super::service::{Handler, WorkerPool};
use crate::http::session::from_tcp_stream;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Default)]
struct ServerState {
    shutdown: AtomicBool,
    connections: Mutex<Vec<ConnectionHandle>>,
}

impl ServerState {
    fn register(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.is_closed());
        connections.push(handle);
    }

    fn shutdown_connections(&self) {
        for connection in self.connections.lock().iter() {
            connection.shutdown();
        }
    }
}

/// Control handle for a running server
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stop accepting and close every connection gracefully
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.shutdown_connections();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handles of the connections that have not closed yet
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// Connections that have not closed yet
    pub fn connection_count(&self) -> usize {
        self.state
            .connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

/// HTTP/2 server bound to a listening socket
pub struct H2Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<Http2Config>,
    handler: Arc<dyn Handler>,
    workers: Arc<WorkerPool>,
    state: Arc<ServerState>,
}

impl H2Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Http2Config {
        &self.config
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
            local_addr: self.local_addr,
        }
    }

    /// Accept connections until [`ServerHandle::shutdown`] is called
    ///
    /// Returns once every connection thread has finished.
    pub fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr, "HTTP/2 server listening");
        let mut threads: Vec<JoinHandle<()>> = Vec::new();
        let tick = self.config.tick_interval();

        while !self.state.shutdown.load(Ordering::SeqCst) {
            threads.retain(|t| !t.is_finished());
            if !wait_acceptable(&self.listener, tick)? {
                continue;
            }

            match self.listener.accept() {
                Ok((socket, peer)) => match self.spawn_connection(socket, peer) {
                    Ok(thread) => threads.push(thread),
                    Err(e) => warn!(peer = %peer, error = %e, "failed to start connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }

        info!(
            addr = %self.local_addr,
            connections = threads.len(),
            "HTTP/2 server shutting down"
        );
        self.state.shutdown_connections();
        for thread in threads {
            if thread.join().is_err() {
                warn!("connection thread panicked");
            }
        }
        Ok(())
    }

    /// Serve one already-accepted connection on the calling thread
    pub fn serve_connection(&self, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true)?;
        let connection = self.connection(socket)?;
        connection.run()
    }

    fn connection(&self, socket: TcpStream) -> Result<Http2Connection<crate::http::FdSessionOps>> {
        let connection = Http2Connection::new(
            from_tcp_stream(socket),
            Arc::clone(&self.config),
            Arc::clone(&self.handler),
            Arc::clone(&self.workers),
        )?;
        let handle = connection.handle();
        // A shutdown that raced with accept still reaches this connection.
        if self.state.shutdown.load(Ordering::SeqCst) {
            handle.shutdown();
        }
        self.state.register(handle);
        Ok(connection)
    }

    fn spawn_connection(&self, socket: TcpStream, peer: SocketAddr) -> Result<JoinHandle<()>> {
        socket.set_nodelay(true)?;
        let connection = self.connection(socket)?;
        let id = connection.id();
        debug!(connection_id = id, peer = %peer, "accepted connection");

        let thread = thread::Builder::new()
            .name(format!("h2-conn-{}", id))
            .spawn(move || {
                if let Err(e) = connection.run() {
                    debug!(connection_id = id, peer = %peer, error = %e, "connection ended with error");
                }
            })?;
        Ok(thread)
    }
}

/// Builder for [`H2Server`]
#[derive(Default)]
pub struct H2ServerBuilder {
    config: Option<Http2Config>,
    handler: Option<Arc<dyn Handler>>,
}

impl H2ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of the defaults
    pub fn config(mut self, config: Http2Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the request handler
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration, start the worker pool and bind
    pub fn bind(self, addr: impl ToSocketAddrs) -> Result<H2Server> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let handler = self
            .handler
            .ok_or_else(|| Error::InvalidConfig("no request handler set".to_string()))?;

        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidConfig("address did not resolve".to_string()))?;
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let workers = WorkerPool::with_idle_timeout(config.worker_threads, config.worker_idle_timeout())?;
        debug!(addr = %local_addr, workers = workers.size(), "server bound");

        Ok(H2Server {
            listener,
            local_addr,
            config: Arc::new(config),
            handler,
            workers: Arc::new(workers),
            state: Arc::new(ServerState::default()),
        })
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Wait up to `timeout` for a pending connection
fn wait_acceptable(listener: &TcpListener, timeout: Duration) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN};

    let mut pfd = pollfd {
        fd: listener.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }
    Ok(result > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::config::Http2ConfigBuilder;
    use crate::http::h2::service::{H2Request, H2Response};
    use std::time::Instant;

    fn hello(_: &mut H2Request, resp: &mut H2Response) -> Result<()> {
        resp.write(b"hello")
    }

    #[test]
    fn test_builder_requires_handler() {
        let err = H2ServerBuilder::new().bind("127.0.0.1:0").err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = Http2Config::default();
        config.max_frame_size = 100;
        let err = H2ServerBuilder::new()
            .config(config)
            .handler(hello)
            .bind("127.0.0.1:0")
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = H2ServerBuilder::new()
            .handler(hello)
            .bind("127.0.0.1:0")
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.handle().local_addr(), server.local_addr());
    }

    #[test]
    fn test_shutdown_stops_accept_loop() {
        let config = Http2ConfigBuilder::new()
            .tick_interval(Duration::from_millis(10))
            .worker_threads(1)
            .build()
            .unwrap();
        let server = H2ServerBuilder::new()
            .config(config)
            .handler(hello)
            .bind("127.0.0.1:0")
            .unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.serve());

        let start = Instant::now();
        handle.shutdown();
        thread.join().unwrap().unwrap();
        assert!(handle.is_shutdown());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
