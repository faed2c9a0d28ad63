//! Endpoint configuration
//!
//! Endpoints are configured from a flat string-keyed option map (the keys
//! mirror the usual socket option names). Unrecognized keys are ignored and
//! absent keys fall back to documented defaults, so callers can pass options
//! straight through from an external configuration source.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default receive timeout: no blocking call ever waits longer than this
pub const DEFAULT_SO_TIMEOUT_MS: u64 = 1_000;

/// Default TCP client connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default listen backlog for TCP server endpoints
pub const DEFAULT_SERVER_BACKLOG: i32 = 50;

/// Default receive-queue packet-count limit
pub const DEFAULT_QUEUE_LIMIT_PACKETS: usize = 1_024;

/// Default receive-queue byte-total limit (8 MiB)
pub const DEFAULT_QUEUE_LIMIT_OCTETS: usize = 8_388_608;

/// Default shared I/O buffer length: one maximal UDP datagram
pub const DEFAULT_BUFFER_LEN: usize = 65_535;

/// Transport kind as requested by the caller.
///
/// Plain `Tcp` leaves the role open; the endpoint resolves it at construction
/// to client for input endpoints and server for output endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportSpec {
    Udp,
    Tcp,
    TcpClient,
    TcpServer,
}

/// Data direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Receives packets from the network
    Input,
    /// Sends packets to the network
    Output,
}

impl Direction {
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output)
    }
}

/// Socket and queue options consumed at endpoint construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOptions {
    /// SO_RCVBUF: kernel receive buffer size
    pub recv_buffer_size: Option<usize>,

    /// SO_SNDBUF: kernel send buffer size
    pub send_buffer_size: Option<usize>,

    /// SO_REUSEADDR
    pub reuse_addr: bool,

    /// SO_TIMEOUT: bound on every blocking receive/accept
    pub timeout: Duration,

    /// SO_KEEPALIVE (TCP)
    pub keep_alive: Option<bool>,

    /// TCP_NODELAY
    pub no_delay: Option<bool>,

    /// SO_BROADCAST (UDP)
    pub broadcast: Option<bool>,

    /// SO_LINGER, in seconds
    pub linger: Option<Duration>,

    /// IP_TOS type-of-service byte
    pub tos: Option<u32>,

    /// IP_MULTICAST_LOOP
    pub multicast_loop: Option<bool>,

    /// IP_MULTICAST_TTL
    pub multicast_ttl: Option<u32>,

    /// TCP client connect timeout
    pub connect_timeout: Duration,

    /// Local port to bind for output/client sockets
    pub local_port: Option<u16>,

    /// Listen backlog for TCP server endpoints
    pub server_backlog: i32,

    /// Probe the socket right after opening so the OS materializes its
    /// receive buffer before the first real packet arrives
    pub eager_recv_buffer: bool,

    /// Receive-queue packet-count limit
    pub queue_limit_packets: usize,

    /// Receive-queue byte-total limit
    pub queue_limit_octets: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: None,
            send_buffer_size: None,
            reuse_addr: true,
            timeout: Duration::from_millis(DEFAULT_SO_TIMEOUT_MS),
            keep_alive: None,
            no_delay: None,
            broadcast: None,
            linger: None,
            tos: None,
            multicast_loop: None,
            multicast_ttl: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            local_port: None,
            server_backlog: DEFAULT_SERVER_BACKLOG,
            eager_recv_buffer: false,
            queue_limit_packets: DEFAULT_QUEUE_LIMIT_PACKETS,
            queue_limit_octets: DEFAULT_QUEUE_LIMIT_OCTETS,
        }
    }
}

impl EndpointOptions {
    /// Build options from a flat string-keyed map.
    ///
    /// Unrecognized keys are ignored. A malformed value keeps the default for
    /// that key and logs a warning rather than failing construction.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut opts = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "SO_RCVBUF" => opts.recv_buffer_size = parse(key, value),
                "SO_SNDBUF" => opts.send_buffer_size = parse(key, value),
                "SO_REUSEADDR" => {
                    if let Some(v) = parse(key, value) {
                        opts.reuse_addr = v;
                    }
                }
                "SO_TIMEOUT" => {
                    if let Some(ms) = parse::<u64>(key, value) {
                        opts.timeout = Duration::from_millis(ms);
                    }
                }
                "SO_KEEPALIVE" => opts.keep_alive = parse(key, value),
                "TCP_NODELAY" => opts.no_delay = parse(key, value),
                "SO_BROADCAST" => opts.broadcast = parse(key, value),
                "SO_LINGER" => {
                    opts.linger = parse::<u64>(key, value).map(Duration::from_secs);
                }
                "IP_TOS" => opts.tos = parse(key, value),
                "IP_MULTICAST_LOOP" => opts.multicast_loop = parse(key, value),
                "IP_MULTICAST_TTL" => opts.multicast_ttl = parse(key, value),
                "CONNECT_TIMEOUT" => {
                    if let Some(ms) = parse::<u64>(key, value) {
                        opts.connect_timeout = Duration::from_millis(ms);
                    }
                }
                "LOCAL_PORT" => opts.local_port = parse(key, value),
                "SERVER_BACKLOG" => {
                    if let Some(v) = parse(key, value) {
                        opts.server_backlog = v;
                    }
                }
                "RCVBUF_EAGER" => {
                    if let Some(v) = parse(key, value) {
                        opts.eager_recv_buffer = v;
                    }
                }
                "QUEUE_LIMIT_PACKETS" => {
                    if let Some(v) = parse(key, value) {
                        opts.queue_limit_packets = v;
                    }
                }
                "QUEUE_LIMIT_OCTETS" => {
                    if let Some(v) = parse(key, value) {
                        opts.queue_limit_octets = v;
                    }
                }
                _ => {}
            }
        }
        opts
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring malformed value {:?} for option {}", value, key);
            None
        }
    }
}

/// Construction parameters for an [`Endpoint`](crate::Endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Requested transport kind
    pub transport: TransportSpec,

    /// Data direction
    pub direction: Direction,

    /// Remote host (output) or bind host (input); empty/absent = wildcard
    pub host: Option<String>,

    /// UDP or TCP port
    pub port: u16,

    /// Interface for multicast joins, as an interface IPv4 address;
    /// empty/absent = OS default
    pub device: Option<String>,

    /// Socket and queue options
    #[serde(default)]
    pub options: EndpointOptions,

    /// Shared I/O buffer length
    #[serde(default = "default_buffer_len")]
    pub buffer_len: usize,
}

fn default_buffer_len() -> usize {
    DEFAULT_BUFFER_LEN
}

impl EndpointSettings {
    pub fn new(transport: TransportSpec, direction: Direction, port: u16) -> Self {
        Self {
            transport,
            direction,
            host: None,
            port,
            device: None,
            options: EndpointOptions::default(),
            buffer_len: DEFAULT_BUFFER_LEN,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn options(mut self, options: EndpointOptions) -> Self {
        self.options = options;
        self
    }

    pub fn buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = len;
        self
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)
            .map_err(|e| crate::TransportError::Config(e.to_string()))?;
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::TransportError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
