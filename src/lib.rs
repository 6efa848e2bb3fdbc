//! h2serve - HTTP/2 server connection engine
//!
//! This crate implements the server side of HTTP/2 (RFC 9113) on blocking
//! sockets: frame codec, HPACK, flow control, stream lifecycle, output
//! scheduling and connection management, with a thread-per-connection
//! server on top.

pub mod http;
