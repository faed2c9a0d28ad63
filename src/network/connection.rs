//! One open TCP connection owned by an endpoint
//!
//! A connection is created on connect or accept and destroyed on read/write
//! error or explicit close. Removal from the endpoint's active set is
//! per-connection: one failing connection never affects its siblings.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Result of the bounded read primitive
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes read: the full requested length for a required read, possibly a
    /// partial count (including zero after a timeout) for an optional one
    Read(usize),
    /// Peer closed the stream
    Eof,
    /// Read abandoned because the abort flag was raised
    Aborted,
    /// Socket failed; the connection is no longer usable
    Failed(std::io::Error),
}

/// One accepted or connected TCP stream with its peer address.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    /// Wrap a connected stream, taking the peer address from the socket.
    pub fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write the whole buffer to the peer.
    pub fn send(&mut self, buffer: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buffer)
    }

    /// Read up to `buffer.len()` bytes, accumulating partial reads while
    /// `required` is set.
    ///
    /// A required read loops until the buffer is full, checking `abort` on
    /// every iteration so an external stop or reconnect request can abandon
    /// it within one socket-timeout period. An optional read returns after
    /// the first read (or timeout) with whatever partial count it has.
    /// End-of-stream is reported as [`ReadOutcome::Eof`] and any other socket
    /// error as [`ReadOutcome::Failed`]; in both cases the caller is expected
    /// to close and drop the connection.
    pub fn read_bounded(
        &mut self,
        buffer: &mut [u8],
        required: bool,
        abort: &AtomicBool,
    ) -> ReadOutcome {
        let mut filled = 0;
        while filled < buffer.len() {
            if abort.load(Ordering::Relaxed) {
                return ReadOutcome::Aborted;
            }
            match self.stream.read(&mut buffer[filled..]) {
                Ok(0) => {
                    if filled == 0 || required {
                        return ReadOutcome::Eof;
                    }
                    return ReadOutcome::Read(filled);
                }
                Ok(n) => {
                    filled += n;
                    if !required {
                        return ReadOutcome::Read(filled);
                    }
                }
                Err(e) if is_timeout(&e) => {
                    if !required {
                        return ReadOutcome::Read(filled);
                    }
                    // keep waiting, the abort flag is re-checked above
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return ReadOutcome::Failed(e),
            }
        }
        ReadOutcome::Read(filled)
    }

    /// Shut the read half down so already-buffered kernel data keeps
    /// draining while no new data is accepted.
    pub fn shutdown_read(&self) -> std::io::Result<()> {
        self.stream.shutdown(Shutdown::Read)
    }

    /// Close both directions.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("closing connection to {}: {}", self.peer, e);
        }
    }
}

/// Receive timeouts surface as `WouldBlock` on Unix and `TimedOut` on
/// Windows.
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
