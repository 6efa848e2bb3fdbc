//! HTTP transport plumbing for h2serve
//!
//! This module holds the pieces the HTTP/2 engine needs from its
//! surroundings: the session abstraction over the byte stream and the
//! header collection shared by requests, responses and trailers.
//!
//! # Architecture
//!
//! The engine never touches a socket directly. It talks to a transport
//! through the session operations abstraction:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close, clone)
//! - `HttpSession` adds a poll timeout in front of reads and writes
//! - `FdSessionOps` implements the trait for a plain `TcpStream`
//!
//! TLS termination lives outside this crate; a TLS-backed `SessionOps`
//! reports its negotiated protocol version through `tls_version()`.
//!
//! # Examples
//!
//! ```no_run
//! use h2serve::http::session::{FdSessionOps, PollEvents, SessionOps};
//! use std::net::TcpStream;
//! use std::time::Duration;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let session = FdSessionOps::new(stream);
//! let readable = session.poll(PollEvents::Read, Some(Duration::from_millis(100))).unwrap();
//! println!("readable: {}", readable);
//! ```

pub mod h2;
pub mod headers;
pub mod session;

pub use headers::Headers;
pub use session::{FdSessionOps, HttpSession, PollEvents, SessionOps, TlsVersion};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// CRLF line ending
pub const CRLF: &str = "\r\n";
