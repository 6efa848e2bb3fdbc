//! HTTP/2 connection configuration.
//!
//! Every option maps either to a SETTINGS parameter we advertise or to an
//! internal limit the connection enforces. Configuration can be loaded from
//! TOML or assembled with [`Http2ConfigBuilder`].
//!
//! ```toml
//! max_concurrent_streams = 250
//! initial_stream_window_size = 1048576
//! keep_alive_ping_interval_ms = 30000
//! ```

use super::error::{Error, Result};
use super::settings::{
    PeerSettings, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE,
    MAX_WINDOW_SIZE,
};
use crate::http::session::TlsVersion;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// HTTP/2 configuration loaded from TOML or built in code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http2Config {
    /// HPACK dynamic table size we allow the peer to use
    #[serde(default = "default_header_table_size")]
    pub header_table_size: u32,

    /// Client streams processed concurrently before REFUSED_STREAM
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    /// Connection-level receive window
    #[serde(default = "default_initial_connection_window_size")]
    pub initial_connection_window_size: u32,

    /// Stream-level receive window
    #[serde(default = "default_initial_stream_window_size")]
    pub initial_stream_window_size: u32,

    /// Largest frame payload we accept
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// Largest uncompressed header list we accept
    #[serde(default = "default_max_header_list_size")]
    pub max_header_list_size: u32,

    /// Idle time before a keep-alive PING is sent; absent disables keep-alive
    #[serde(default)]
    pub keep_alive_ping_interval_ms: Option<u64>,

    /// Time to wait for a PING ACK before the connection is aborted
    #[serde(default = "default_keep_alive_ping_timeout_ms")]
    pub keep_alive_ping_timeout_ms: u64,

    /// Completed streams kept for reuse
    #[serde(default = "default_stream_pool_size")]
    pub stream_pool_size: usize,

    /// How long a pooled stream may sit unused
    #[serde(default = "default_stream_pool_ttl_ms")]
    pub stream_pool_ttl_ms: u64,

    /// How long a completed stream waits for the peer's END_STREAM or RST_STREAM
    #[serde(default = "default_stream_drain_timeout_ms")]
    pub stream_drain_timeout_ms: u64,

    /// Time allowed for the client preface to arrive
    #[serde(default = "default_preface_timeout_ms")]
    pub preface_timeout_ms: u64,

    /// Hard deadline for graceful shutdown and teardown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Granularity of timer checks in the reader loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Stream starts allowed per calm-down window before ENHANCE_YOUR_CALM
    #[serde(default = "default_calm_down_max_stream_starts")]
    pub calm_down_max_stream_starts: u32,

    /// Length of the calm-down window
    #[serde(default = "default_calm_down_window_ms")]
    pub calm_down_window_ms: u64,

    /// Accept extended CONNECT (`:protocol`, RFC 8441)
    #[serde(default)]
    pub enable_connect_protocol: bool,

    /// Lowest TLS version accepted on TLS sessions
    #[serde(default = "default_min_tls_version")]
    pub min_tls_version: TlsVersion,

    /// Handler threads kept alive while idle; more are started on demand
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// How long an on-demand handler thread waits for work before exiting
    #[serde(default = "default_worker_idle_timeout_ms")]
    pub worker_idle_timeout_ms: u64,
}

fn default_header_table_size() -> u32 {
    4096
}

fn default_max_concurrent_streams() -> u32 {
    100
}

fn default_initial_connection_window_size() -> u32 {
    128 * 1024
}

fn default_initial_stream_window_size() -> u32 {
    96 * 1024
}

fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_header_list_size() -> u32 {
    32 * 1024
}

fn default_keep_alive_ping_timeout_ms() -> u64 {
    20_000
}

fn default_stream_pool_size() -> usize {
    40
}

fn default_stream_pool_ttl_ms() -> u64 {
    5_000
}

fn default_stream_drain_timeout_ms() -> u64 {
    5_000
}

fn default_preface_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_calm_down_max_stream_starts() -> u32 {
    2_000
}

fn default_calm_down_window_ms() -> u64 {
    5_000
}

fn default_min_tls_version() -> TlsVersion {
    TlsVersion::Tls12
}

fn default_worker_threads() -> usize {
    16
}

fn default_worker_idle_timeout_ms() -> u64 {
    30_000
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            header_table_size: default_header_table_size(),
            max_concurrent_streams: default_max_concurrent_streams(),
            initial_connection_window_size: default_initial_connection_window_size(),
            initial_stream_window_size: default_initial_stream_window_size(),
            max_frame_size: default_max_frame_size(),
            max_header_list_size: default_max_header_list_size(),
            keep_alive_ping_interval_ms: None,
            keep_alive_ping_timeout_ms: default_keep_alive_ping_timeout_ms(),
            stream_pool_size: default_stream_pool_size(),
            stream_pool_ttl_ms: default_stream_pool_ttl_ms(),
            stream_drain_timeout_ms: default_stream_drain_timeout_ms(),
            preface_timeout_ms: default_preface_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            calm_down_max_stream_starts: default_calm_down_max_stream_starts(),
            calm_down_window_ms: default_calm_down_window_ms(),
            enable_connect_protocol: false,
            min_tls_version: default_min_tls_version(),
            worker_threads: default_worker_threads(),
            worker_idle_timeout_ms: default_worker_idle_timeout_ms(),
        }
    }
}

impl Http2Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Http2Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.initial_stream_window_size > MAX_WINDOW_SIZE {
            return Err(Error::InvalidConfig(format!(
                "initial_stream_window_size ({}) must not exceed 2^31-1",
                self.initial_stream_window_size
            )));
        }

        if self.initial_connection_window_size > MAX_WINDOW_SIZE
            || self.initial_connection_window_size < DEFAULT_INITIAL_WINDOW_SIZE
        {
            return Err(Error::InvalidConfig(format!(
                "initial_connection_window_size ({}) must be between 65535 and 2^31-1",
                self.initial_connection_window_size
            )));
        }

        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::InvalidConfig(format!(
                "max_frame_size ({}) must be between 16384 and 16777215",
                self.max_frame_size
            )));
        }

        if self.max_concurrent_streams == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_streams must be at least 1".to_string(),
            ));
        }

        if self.keep_alive_ping_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "keep_alive_ping_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.tick_interval_ms == 0 || self.worker_threads == 0 {
            return Err(Error::InvalidConfig(
                "tick_interval_ms and worker_threads must be greater than 0".to_string(),
            ));
        }

        if self.worker_idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "worker_idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The settings this server advertises
    pub fn server_settings(&self) -> PeerSettings {
        PeerSettings {
            header_table_size: self.header_table_size,
            enable_push: false,
            max_concurrent_streams: self.max_concurrent_streams,
            initial_window_size: self.initial_stream_window_size,
            max_frame_size: self.max_frame_size,
            max_header_list_size: self.max_header_list_size,
            enable_connect_protocol: self.enable_connect_protocol,
        }
    }

    pub fn keep_alive_ping_interval(&self) -> Option<Duration> {
        self.keep_alive_ping_interval_ms.map(Duration::from_millis)
    }

    pub fn keep_alive_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ping_timeout_ms)
    }

    pub fn stream_pool_ttl(&self) -> Duration {
        Duration::from_millis(self.stream_pool_ttl_ms)
    }

    pub fn stream_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_drain_timeout_ms)
    }

    pub fn preface_timeout(&self) -> Duration {
        Duration::from_millis(self.preface_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn calm_down_window(&self) -> Duration {
        Duration::from_millis(self.calm_down_window_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }
}

/// Fluent builder for [`Http2Config`]
#[derive(Debug, Clone, Default)]
pub struct Http2ConfigBuilder {
    config: Http2Config,
}

impl Http2ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    pub fn initial_connection_window_size(mut self, size: u32) -> Self {
        self.config.initial_connection_window_size = size;
        self
    }

    pub fn initial_stream_window_size(mut self, size: u32) -> Self {
        self.config.initial_stream_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    /// Enable keep-alive PINGs after `interval` of inactivity
    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.keep_alive_ping_interval_ms = Some(interval.as_millis() as u64);
        self.config.keep_alive_ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stream_pool_size(mut self, size: usize) -> Self {
        self.config.stream_pool_size = size;
        self
    }

    pub fn stream_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn preface_timeout(mut self, timeout: Duration) -> Self {
        self.config.preface_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn tick_interval(mut self, tick: Duration) -> Self {
        self.config.tick_interval_ms = tick.as_millis() as u64;
        self
    }

    /// Set the abuse ceiling: stream starts allowed per `window`
    pub fn calm_down(mut self, max_stream_starts: u32, window: Duration) -> Self {
        self.config.calm_down_max_stream_starts = max_stream_starts;
        self.config.calm_down_window_ms = window.as_millis() as u64;
        self
    }

    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.config.enable_connect_protocol = enable;
        self
    }

    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.config.min_tls_version = version;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<Http2Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Http2Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_streams, 100);
        assert_eq!(config.initial_connection_window_size, 131_072);
        assert_eq!(config.initial_stream_window_size, 98_304);
        assert_eq!(config.keep_alive_ping_interval(), None);
        assert_eq!(config.min_tls_version, TlsVersion::Tls12);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Http2Config::from_toml_str("").unwrap(), Http2Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_concurrent_streams = 7\nkeep_alive_ping_interval_ms = 1500\nmin_tls_version = \"1.3\""
        )
        .unwrap();

        let config = Http2Config::load(file.path()).unwrap();
        assert_eq!(config.max_concurrent_streams, 7);
        assert_eq!(config.keep_alive_ping_interval(), Some(Duration::from_millis(1500)));
        assert_eq!(config.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.stream_pool_size, 40);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            Http2Config::from_toml_str("max_streams = 5"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(Http2ConfigBuilder::new().max_frame_size(1024).build().is_err());
        assert!(Http2ConfigBuilder::new().max_concurrent_streams(0).build().is_err());
        assert!(Http2ConfigBuilder::new()
            .initial_stream_window_size(0x8000_0000)
            .build()
            .is_err());
        assert!(Http2ConfigBuilder::new()
            .initial_connection_window_size(1000)
            .build()
            .is_err());
        assert!(Http2ConfigBuilder::new()
            .keep_alive(Duration::from_secs(1), Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_worker_idle_timeout() {
        let config = Http2Config::from_toml_str("worker_threads = 2\nworker_idle_timeout_ms = 250").unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.worker_idle_timeout(), Duration::from_millis(250));
        assert_eq!(Http2Config::default().worker_idle_timeout(), Duration::from_secs(30));
        assert!(Http2ConfigBuilder::new()
            .worker_idle_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_server_settings() {
        let config = Http2ConfigBuilder::new()
            .max_concurrent_streams(10)
            .enable_connect_protocol(true)
            .build()
            .unwrap();
        let settings = config.server_settings();
        assert_eq!(settings.max_concurrent_streams, 10);
        assert_eq!(settings.initial_window_size, 98_304);
        assert!(settings.enable_connect_protocol);
    }
}
