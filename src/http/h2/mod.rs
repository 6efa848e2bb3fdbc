//! HTTP/2 server engine
//!
//! The engine implements the server side of RFC 9113 over a blocking
//! transport. Each connection is served by three kinds of threads:
//!
//! - the **reader**, which owns the connection state, parses frames and
//!   tracks streams ([`connection`])
//! - the **output scheduler**, which moves response bytes from per-stream
//!   producers onto the wire within the flow-control windows
//!   ([`scheduler`], [`writer`])
//! - **workers** from a shared pool, which run the application handler for
//!   each request ([`service`])
//!
//! # Modules
//!
//! - [`codec`] and [`frames`]: frame wire format
//! - [`hpack`]: header block compression via the `hpack` crate
//! - [`flow_control`] and [`pipe`]: windows, request body and response
//!   output buffers
//! - [`stream`] and [`pool`]: per-stream state and reuse
//! - [`calm`], [`keepalive`] and [`preface`]: connection policies
//! - [`config`]: server configuration
//!
//! # Example
//!
//! ```no_run
//! use h2serve::http::h2::{H2Request, H2Response, H2ServerBuilder, Http2ConfigBuilder, Result};
//! use std::io::Read;
//! use std::time::Duration;
//!
//! # fn main() -> Result<()> {
//! let config = Http2ConfigBuilder::new()
//!     .max_concurrent_streams(250)
//!     .keep_alive(Duration::from_secs(30), Duration::from_secs(10))
//!     .build()?;
//!
//! let server = H2ServerBuilder::new()
//!     .config(config)
//!     .handler(|req: &mut H2Request, resp: &mut H2Response| -> Result<()> {
//!         let mut body = Vec::new();
//!         req.body().read_to_end(&mut body)?;
//!         resp.header("content-type", "application/octet-stream");
//!         resp.write(&body)
//!     })
//!     .bind("0.0.0.0:8443")?;
//! server.serve()
//! # }
//! ```

pub mod calm;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod hpack;
pub mod keepalive;
pub mod pipe;
pub mod pool;
pub mod preface;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod settings;
pub mod stream;
pub mod writer;

pub use codec::FrameCodec;
pub use config::{Http2Config, Http2ConfigBuilder};
pub use connection::{ConnectionHandle, Http2Connection};
pub use error::{Error, ErrorCode, ProtocolError, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use pipe::RequestBody;
pub use preface::CONNECTION_PREFACE;
pub use server::{H2Server, H2ServerBuilder, ServerHandle};
pub use service::{H2Request, H2Response, Handler, WorkerPool};
pub use settings::{PeerSettings, Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// Stream ID reserved for connection-level frames
pub const CONNECTION_STREAM_ID: u32 = 0;
