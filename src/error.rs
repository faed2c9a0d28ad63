//! Error types for the transport core

use thiserror::Error;

/// Errors raised by endpoints, sockets and the receive queue.
///
/// Most of these are reported through the error/warning dispatch channel of a
/// running endpoint rather than returned to a caller; they propagate only
/// where no retry path exists (construction, explicit reconnect, unexpected
/// loop failure).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid settings or option values
    #[error("configuration error: {0}")]
    Config(String),

    /// Host or device string did not resolve to a usable address
    #[error("address error: {0}")]
    Address(String),

    /// TCP receive was called without a framing function installed
    #[error("tcp framing not supported: no framing function supplied")]
    UnsupportedFraming,

    /// reconnect() called while another reconnect is still pending
    #[error("reconnect already pending")]
    ReconnectPending,

    /// Close+reopen during reconnect failed
    #[error("reconnect failed: {0}")]
    ReconnectFailed(String),

    /// Operation aborted by a stop request
    #[error("operation cancelled by stop request")]
    Cancelled,

    /// Receive queue exceeded both its packet and octet limits and was purged
    #[error("receive queue overflow: dropped {packets} packets ({octets} octets)")]
    QueueOverflow { packets: usize, octets: usize },

    /// Peer closed the connection
    #[error("connection to {0} closed by peer")]
    ConnectionClosed(String),

    /// Operation not valid for the endpoint's transport kind or direction
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Packet translator failed while handling a dequeued buffer
    #[error("packet translator error: {0}")]
    Translator(String),
}

impl TransportError {
    /// Whether the running endpoint may keep retrying after reporting this
    /// error, or has to tear the loop down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::QueueOverflow { .. }
                | TransportError::ConnectionClosed(_)
                | TransportError::Translator(_)
        )
    }
}
