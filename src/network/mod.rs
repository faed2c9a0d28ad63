//! Network transport subsystem
//!
//! Contains modules for:
//! - socket construction and option application
//! - the endpoint I/O loop (UDP, TCP client, TCP server)
//! - TCP connections and the bounded read primitive
//! - the bounded receive queue and its drain worker
//! - listener dispatch for received/sent/error events

pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod queue;
pub mod socket;

pub use connection::{Connection, ReadOutcome};
pub use dispatch::{ErrorListener, PacketDispatch, PacketListener};
pub use endpoint::{Endpoint, Received, TcpFraming, TransportKind};
pub use queue::{DrainWorker, PacketTranslator, QueueOverflow, ReceiveQueue};
