//! Network transport core for radio streaming middleware.
//!
//! Moves opaque binary packets over UDP (unicast/multicast) or TCP (client or
//! server role) with bounded buffering, automatic reconnect, multi-client
//! fan-out and graceful drain-on-shutdown.
//!
//! The central type is [`Endpoint`]: one configured transport instance that
//! owns its socket(s), runs an I/O loop on its own thread, and decouples
//! socket reads from application handling through a bounded receive queue
//! drained by a dedicated worker. Payload bytes are opaque at this layer;
//! UDP framing is fixed (one datagram, one packet) and TCP framing must be
//! supplied by a protocol-aware layer above.

pub mod config;
pub mod error;
pub mod network;

pub use config::{Direction, EndpointOptions, EndpointSettings, TransportSpec};
pub use error::TransportError;
pub use network::connection::{Connection, ReadOutcome};
pub use network::dispatch::{ErrorListener, PacketDispatch, PacketListener};
pub use network::endpoint::{Endpoint, Received, TcpFraming, TransportKind};
pub use network::queue::{DrainWorker, PacketTranslator, ReceiveQueue};

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, TransportError>;
