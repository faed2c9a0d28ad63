//! Endpoint: one configured transport instance
//!
//! An endpoint owns exactly one underlying socket mechanism matching its
//! fixed transport kind: a UDP socket, a TCP listener with its accepted
//! connections, or a single TCP client connection. Sockets open synchronously
//! at construction; `start` spawns the I/O loop on its own thread and, for
//! input endpoints, a drain worker consuming the bounded receive queue.
//!
//! Cancellation is cooperative throughout: every blocking socket call carries
//! the configured timeout, and a stop or reconnect request is observed within
//! one timeout period at worst.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Direction, EndpointSettings, TransportSpec};
use crate::error::TransportError;
use crate::network::connection::{is_timeout, Connection};
use crate::network::dispatch::PacketDispatch;
use crate::network::queue::{DrainWorker, PacketTranslator, ReceiveQueue};
use crate::network::socket;
use crate::Result;

/// Backoff applied after recoverable loop errors and while a TCP server
/// output endpoint waits for its first client
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Polling cadence for reconnect(), stop() and cancellable sleeps
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on waiting for the receive queue to drain during stop/shutdown
const DRAIN_WAIT: Duration = Duration::from_secs(10);

/// Throttling of the TCP server accept check: immediately on the first call,
/// then backing off to one second between checks
const ACCEPT_MIN_INTERVAL: Duration = Duration::from_millis(100);
const ACCEPT_MAX_INTERVAL: Duration = Duration::from_secs(1);

/// Shutdown stages, monotonically non-decreasing
const STAGE_RUNNING: u8 = 0;
const STAGE_DRAINING: u8 = 1;
const STAGE_CLOSED: u8 = 2;

/// Reconnect handshake states
const RC_IDLE: u8 = 0;
const RC_REQUESTED: u8 = 1;
const RC_IN_PROGRESS: u8 = 2;
const RC_DONE_OK: u8 = 3;
const RC_DONE_ERR: u8 = 4;

/// Resolved transport kind of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    TcpClient,
    TcpServer,
}

impl TransportKind {
    /// Resolve the requested transport: plain TCP becomes a client for input
    /// endpoints and a server for output endpoints.
    pub fn resolve(spec: TransportSpec, direction: Direction) -> Self {
        match spec {
            TransportSpec::Udp => TransportKind::Udp,
            TransportSpec::TcpClient => TransportKind::TcpClient,
            TransportSpec::TcpServer => TransportKind::TcpServer,
            TransportSpec::Tcp => {
                if direction.is_output() {
                    TransportKind::TcpServer
                } else {
                    TransportKind::TcpClient
                }
            }
        }
    }

    fn is_tcp(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

/// Outcome of a single receive call
#[derive(Debug)]
pub enum Received {
    /// One packet, right-sized copy of the datagram or frame
    Packet(Bytes),
    /// The packet went straight onto the receive queue (auto-push)
    Enqueued,
    /// Nothing arrived within the receive timeout
    TimedOut,
}

/// Pluggable TCP framing supplied by a protocol-aware layer above.
///
/// Called with the first available connection and the endpoint's stop flag
/// (for use with the bounded read primitive); returns one packet, or `None`
/// when nothing complete arrived within the timeout.
pub type TcpFraming =
    Box<dyn FnMut(&mut Connection, &AtomicBool) -> Result<Option<Bytes>> + Send>;

/// The active socket mechanism. Exactly one variant exists per endpoint,
/// matching its kind; a TCP client's connection lives in the shared
/// connection set.
enum Transport {
    Udp {
        socket: UdpSocket,
        destination: Option<SocketAddr>,
    },
    TcpServer(TcpListener),
    TcpClient,
}

struct ReconnectCell {
    state: AtomicU8,
    outcome: Mutex<Option<TransportError>>,
}

struct AcceptThrottle {
    next_check: Option<Instant>,
    interval: Duration,
}

struct EndpointShared {
    settings: EndpointSettings,
    kind: TransportKind,
    transport: Mutex<Option<Transport>>,
    connections: Mutex<Vec<Connection>>,
    io_buffer: Mutex<Vec<u8>>,
    queue: Arc<ReceiveQueue>,
    dispatch: Arc<PacketDispatch>,
    framing: Mutex<Option<TcpFraming>>,
    stage: AtomicU8,
    stop: AtomicBool,
    reconnect: ReconnectCell,
    accept: Mutex<AcceptThrottle>,
}

/// One configured transport instance with its I/O loop, buffer, queue limits
/// and reconnect/shutdown state.
pub struct Endpoint {
    shared: Arc<EndpointShared>,
    io_thread: Option<JoinHandle<()>>,
    drain: Option<DrainWorker>,
}

impl Endpoint {
    /// Construct the endpoint and open its socket(s) synchronously.
    /// An open failure propagates to the caller.
    pub fn new(settings: EndpointSettings) -> Result<Self> {
        let kind = TransportKind::resolve(settings.transport, settings.direction);
        let queue = Arc::new(ReceiveQueue::new(
            settings.options.queue_limit_packets,
            settings.options.queue_limit_octets,
        ));
        let buffer_len = settings.buffer_len;
        let shared = Arc::new(EndpointShared {
            settings,
            kind,
            transport: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            io_buffer: Mutex::new(vec![0u8; buffer_len]),
            queue,
            dispatch: Arc::new(PacketDispatch::new()),
            framing: Mutex::new(None),
            stage: AtomicU8::new(STAGE_RUNNING),
            stop: AtomicBool::new(false),
            reconnect: ReconnectCell {
                state: AtomicU8::new(RC_IDLE),
                outcome: Mutex::new(None),
            },
            accept: Mutex::new(AcceptThrottle {
                next_check: None,
                interval: Duration::ZERO,
            }),
        });
        shared.open_transport()?;
        info!(
            "endpoint open: {:?} {:?} port {}",
            kind, shared.settings.direction, shared.settings.port
        );
        Ok(Self {
            shared,
            io_thread: None,
            drain: None,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    pub fn direction(&self) -> Direction {
        self.shared.settings.direction
    }

    /// The dispatch boundary for this endpoint's events.
    pub fn dispatch(&self) -> &Arc<PacketDispatch> {
        &self.shared.dispatch
    }

    /// The bounded receive queue feeding the drain worker.
    pub fn queue(&self) -> &Arc<ReceiveQueue> {
        &self.shared.queue
    }

    /// Local address of the bound socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.shared.transport.lock() {
            Some(Transport::Udp { socket, .. }) => socket.local_addr().ok(),
            Some(Transport::TcpServer(listener)) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// Number of currently active TCP connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Peer addresses of the currently active TCP connections.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared.connections.lock().iter().map(Connection::peer).collect()
    }

    /// Install the TCP framing function. Until one is supplied, TCP receive
    /// reports [`TransportError::UnsupportedFraming`].
    pub fn set_framing(&self, framing: TcpFraming) {
        *self.shared.framing.lock() = Some(framing);
    }

    /// Spawn the I/O loop thread and, for input endpoints, the drain worker.
    ///
    /// Input endpoints require a packet translator; output endpoints ignore
    /// it.
    pub fn start(&mut self, translator: Option<PacketTranslator>) -> Result<()> {
        if self.io_thread.is_some() {
            return Ok(());
        }
        if self.shared.settings.direction.is_output() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("endpoint-out".to_string())
                .spawn(move || shared.output_loop())
                .map_err(TransportError::Io)?;
            self.io_thread = Some(handle);
        } else {
            let translator = translator.ok_or_else(|| {
                TransportError::Config("input endpoint requires a packet translator".into())
            })?;
            self.drain = Some(DrainWorker::spawn(
                self.shared.queue.clone(),
                self.shared.dispatch.clone(),
                translator,
            )?);
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("endpoint-in".to_string())
                .spawn(move || shared.input_loop())
                .map_err(TransportError::Io)?;
            self.io_thread = Some(handle);
        }
        Ok(())
    }

    /// Whether the I/O loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.io_thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Send one packet (output endpoints).
    ///
    /// UDP sends a single datagram to the configured destination. TCP fans
    /// the buffer out to every active connection; a connection whose write
    /// fails is closed and dropped without aborting delivery to the others.
    pub fn send(&self, buffer: &[u8]) -> Result<()> {
        self.shared.send(buffer)
    }

    /// Receive one packet (input endpoints).
    ///
    /// With `auto_push` the packet goes straight onto the receive queue and
    /// [`Received::Enqueued`] is returned instead of the buffer.
    pub fn receive(&self, auto_push: bool) -> Result<Received> {
        self.shared.receive(auto_push)
    }

    /// Service a pending reconnect and, for TCP servers, accept one waiting
    /// client at a throttled cadence. Returns false when the current I/O
    /// iteration should be skipped.
    pub fn check_sockets(&self) -> bool {
        self.shared.check_sockets()
    }

    /// Close and reopen the socket(s), synchronously from the caller's
    /// perspective: the request is handed to the I/O loop and polled every
    /// 100 ms until it completes. A second call while one is pending fails
    /// immediately with [`TransportError::ReconnectPending`].
    pub fn reconnect(&self) -> Result<()> {
        self.shared.request_reconnect()
    }

    /// Stage 1 of shutdown: stop new reads without closing the socket so
    /// already-buffered data keeps draining. TCP connections get their read
    /// half shut down; a UDP input loop simply stops reading.
    pub fn shutdown_sockets(&self) {
        if advance_stage(&self.shared.stage, STAGE_DRAINING) {
            info!("endpoint draining");
            if self.shared.kind.is_tcp() {
                for conn in self.shared.connections.lock().iter() {
                    if let Err(e) = conn.shutdown_read() {
                        debug!("read-half shutdown for {}: {}", conn.peer(), e);
                    }
                }
            }
        }
    }

    /// Stage 1 plus a bounded wait (10 s, polling every 100 ms) for an input
    /// endpoint's receive queue to drain.
    pub fn stop(&self) {
        self.shutdown_sockets();
        if self.drain.is_some() {
            let deadline = Instant::now() + DRAIN_WAIT;
            while !self.shared.queue.is_empty() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Terminal shutdown: close the socket(s), let the drain worker finish
    /// the queue (bounded by 10 s), force-clear any remainder, stop the
    /// worker and dispose the dispatch boundary.
    pub fn shutdown(&mut self) {
        self.stop();
        advance_stage(&self.shared.stage, STAGE_CLOSED);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.close_transport();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        if let Some(mut worker) = self.drain.take() {
            worker.stop_when_clear();
            let deadline = Instant::now() + DRAIN_WAIT;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            self.shared.queue.clear();
            worker.join();
        }
        self.shared.dispatch.dispose();
        info!("endpoint closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.shared.stage.load(Ordering::SeqCst) < STAGE_CLOSED {
            self.shutdown();
        }
    }
}

impl EndpointShared {
    fn open_transport(&self) -> Result<()> {
        let transport = match self.kind {
            TransportKind::Udp => {
                let (socket, destination) = socket::open_udp(&self.settings)?;
                Transport::Udp { socket, destination }
            }
            TransportKind::TcpServer => {
                Transport::TcpServer(socket::open_tcp_listener(&self.settings)?)
            }
            TransportKind::TcpClient => {
                let stream = socket::open_tcp_client(&self.settings)?;
                let conn = Connection::from_stream(stream)?;
                self.connections.lock().push(conn);
                Transport::TcpClient
            }
        };
        *self.transport.lock() = Some(transport);
        Ok(())
    }

    fn close_transport(&self) {
        let mut connections = self.connections.lock();
        for conn in connections.iter() {
            conn.close();
        }
        connections.clear();
        drop(connections);
        self.transport.lock().take();
    }

    /// Loop-iteration bookkeeping: reconnect servicing and throttled accept.
    fn check_sockets(&self) -> bool {
        if self
            .reconnect
            .state
            .compare_exchange(RC_REQUESTED, RC_IN_PROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("reconnect in progress");
            self.close_transport();
            match self.open_transport() {
                Ok(()) => {
                    self.reconnect.state.store(RC_DONE_OK, Ordering::SeqCst);
                    info!("reconnect complete");
                }
                Err(e) => {
                    warn!("reconnect failed: {}", e);
                    *self.reconnect.outcome.lock() = Some(e);
                    self.reconnect.state.store(RC_DONE_ERR, Ordering::SeqCst);
                }
            }
            return false;
        }

        if self.kind == TransportKind::TcpServer {
            let due = {
                let throttle = self.accept.lock();
                throttle.next_check.map_or(true, |t| Instant::now() >= t)
            };
            if due {
                let accepted = self.accept_one();
                let mut throttle = self.accept.lock();
                if accepted {
                    throttle.interval = Duration::ZERO;
                    throttle.next_check = Some(Instant::now());
                } else {
                    throttle.interval = (throttle.interval * 2)
                        .max(ACCEPT_MIN_INTERVAL)
                        .min(ACCEPT_MAX_INTERVAL);
                    throttle.next_check = Some(Instant::now() + throttle.interval);
                }
            }
            return !self.connections.lock().is_empty();
        }
        true
    }

    /// Accept at most one waiting client.
    fn accept_one(&self) -> bool {
        let transport = self.transport.lock();
        let Some(Transport::TcpServer(listener)) = &*transport else {
            return false;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = socket::configure_accepted(&stream, &self.settings.options) {
                    warn!("configuring client {}: {}", peer, e);
                }
                drop(transport);
                info!("client connected: {}", peer);
                self.connections.lock().push(Connection::new(stream, peer));
                true
            }
            Err(e) if is_timeout(&e) => false,
            Err(e) => {
                drop(transport);
                self.dispatch.fire_error(&TransportError::Io(e));
                false
            }
        }
    }

    fn send(&self, buffer: &[u8]) -> Result<()> {
        if !self.settings.direction.is_output() {
            return Err(TransportError::Unsupported(
                "send on an input endpoint".into(),
            ));
        }
        if self.stage.load(Ordering::SeqCst) >= STAGE_CLOSED {
            return Err(TransportError::Unsupported("endpoint closed".into()));
        }
        match self.kind {
            TransportKind::Udp => {
                let transport = self.transport.lock();
                let Some(Transport::Udp { socket, destination }) = &*transport else {
                    return Err(TransportError::Unsupported("socket not open".into()));
                };
                let destination = (*destination).ok_or_else(|| {
                    TransportError::Config("output endpoint has no destination".into())
                })?;
                socket.send_to(buffer, destination)?;
            }
            TransportKind::TcpServer | TransportKind::TcpClient => {
                let mut connections = self.connections.lock();
                for (peer, e) in fan_out(&mut connections, buffer) {
                    warn!("dropping connection {}: {}", peer, e);
                    self.dispatch
                        .fire_error(&TransportError::ConnectionClosed(peer.to_string()));
                }
            }
        }
        self.dispatch.fire_sent(Bytes::copy_from_slice(buffer));
        Ok(())
    }

    fn receive(&self, auto_push: bool) -> Result<Received> {
        if self.settings.direction.is_output() {
            return Err(TransportError::Unsupported(
                "receive on an output endpoint".into(),
            ));
        }
        match self.kind {
            TransportKind::Udp => self.receive_udp(auto_push),
            TransportKind::TcpClient | TransportKind::TcpServer => self.receive_tcp(auto_push),
        }
    }

    /// One datagram is always exactly one packet.
    fn receive_udp(&self, auto_push: bool) -> Result<Received> {
        let transport = self.transport.lock();
        let Some(Transport::Udp { socket, .. }) = &*transport else {
            return Err(TransportError::Unsupported("socket not open".into()));
        };
        let mut buffer = self.io_buffer.lock();
        match socket.recv(&mut buffer[..]) {
            Ok(n) => {
                let payload = Bytes::copy_from_slice(&buffer[..n]);
                drop(buffer);
                drop(transport);
                Ok(self.finish_packet(payload, auto_push))
            }
            Err(e) if is_timeout(&e) => Ok(Received::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    /// TCP framing is undefined at this layer; a protocol-aware layer above
    /// supplies the length-delimiting strategy. Reads use the first
    /// available connection.
    fn receive_tcp(&self, auto_push: bool) -> Result<Received> {
        let mut framing = self.framing.lock();
        let framing = framing.as_mut().ok_or(TransportError::UnsupportedFraming)?;

        // take the first available connection out of the set so a slow read
        // never holds the set lock against shutdown or send fan-out
        let mut conn = {
            let mut connections = self.connections.lock();
            if connections.is_empty() {
                return Ok(Received::TimedOut);
            }
            connections.remove(0)
        };
        match framing(&mut conn, &self.stop) {
            Ok(received) => {
                if self.stage.load(Ordering::SeqCst) >= STAGE_DRAINING {
                    // a drain request arrived while the read was in flight
                    let _ = conn.shutdown_read();
                }
                self.connections.lock().insert(0, conn);
                match received {
                    Some(payload) => Ok(self.finish_packet(payload, auto_push)),
                    None => Ok(Received::TimedOut),
                }
            }
            Err(e) => {
                // connection-fatal, endpoint-continuable
                let peer = conn.peer();
                conn.close();
                warn!("dropping connection {}: {}", peer, e);
                Err(e)
            }
        }
    }

    fn finish_packet(&self, payload: Bytes, auto_push: bool) -> Received {
        if auto_push {
            if let Some(overflow) = self.queue.push([payload]) {
                self.dispatch.fire_error(&TransportError::QueueOverflow {
                    packets: overflow.packets,
                    octets: overflow.octets,
                });
            }
            Received::Enqueued
        } else {
            Received::Packet(payload)
        }
    }

    fn request_reconnect(&self) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(TransportError::Cancelled);
        }
        self.reconnect
            .state
            .compare_exchange(RC_IDLE, RC_REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TransportError::ReconnectPending)?;

        loop {
            match self.reconnect.state.load(Ordering::SeqCst) {
                RC_DONE_OK => {
                    self.reconnect.state.store(RC_IDLE, Ordering::SeqCst);
                    return Ok(());
                }
                RC_DONE_ERR => {
                    let outcome = self.reconnect.outcome.lock().take();
                    self.reconnect.state.store(RC_IDLE, Ordering::SeqCst);
                    let message = outcome
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".into());
                    return Err(TransportError::ReconnectFailed(message));
                }
                _ => {
                    // withdraw an unserviced request when stopping
                    if self.stop.load(Ordering::SeqCst)
                        && self
                            .reconnect
                            .state
                            .compare_exchange(
                                RC_REQUESTED,
                                RC_IDLE,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                    {
                        return Err(TransportError::Cancelled);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// I/O loop for input endpoints.
    fn input_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new();
        loop {
            if self.stop.load(Ordering::Relaxed)
                || self.stage.load(Ordering::SeqCst) >= STAGE_CLOSED
            {
                break;
            }
            if !self.check_sockets() {
                sleep_cancellable(POLL_INTERVAL, &self.stop);
                continue;
            }
            // draining stops new UDP reads; TCP keeps reading until the
            // shut-down read half reports end of stream
            if self.stage.load(Ordering::SeqCst) >= STAGE_DRAINING
                && self.kind == TransportKind::Udp
            {
                sleep_cancellable(POLL_INTERVAL, &self.stop);
                continue;
            }
            match self.receive(true) {
                Ok(Received::TimedOut) => {}
                Ok(_) => backoff.reset(),
                Err(e) if e.is_recoverable() => {
                    self.dispatch.fire_error(&e);
                    backoff.wait(&self.stop);
                }
                Err(e) => {
                    error!("endpoint i/o loop terminating: {}", e);
                    self.dispatch.fire_error(&e);
                    break;
                }
            }
        }
        debug!("input loop stopped");
    }

    /// I/O loop for output endpoints: a TCP server keeps accepting with
    /// exponential backoff while no client is connected, everything else
    /// idles, still servicing reconnect requests.
    fn output_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new();
        loop {
            if self.stop.load(Ordering::Relaxed)
                || self.stage.load(Ordering::SeqCst) >= STAGE_CLOSED
            {
                break;
            }
            let ready = self.check_sockets();
            if self.kind == TransportKind::TcpServer && !ready {
                backoff.wait(&self.stop);
            } else {
                backoff.reset();
                sleep_cancellable(POLL_INTERVAL, &self.stop);
            }
        }
        debug!("output loop stopped");
    }
}

/// Write the buffer to every connection; failed ones are closed and removed.
/// Returns the peers dropped this round with their errors.
fn fan_out(
    connections: &mut Vec<Connection>,
    buffer: &[u8],
) -> Vec<(SocketAddr, std::io::Error)> {
    let mut dropped = Vec::new();
    connections.retain_mut(|conn| match conn.send(buffer) {
        Ok(()) => true,
        Err(e) => {
            conn.close();
            dropped.push((conn.peer(), e));
            false
        }
    });
    dropped
}

/// Raise the stage to at least `target`. Returns true if this call moved it.
fn advance_stage(stage: &AtomicU8, target: u8) -> bool {
    stage.fetch_max(target, Ordering::SeqCst) < target
}

fn sleep_cancellable(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_START,
        }
    }

    fn reset(&mut self) {
        self.current = BACKOFF_START;
    }

    /// Sleep for the current interval (cancellable), then double it up to
    /// the cap.
    fn wait(&mut self, stop: &AtomicBool) {
        sleep_cancellable(self.current, stop);
        self.current = (self.current * 2).min(BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};

    fn udp_input(timeout_ms: u64) -> Endpoint {
        let mut settings =
            EndpointSettings::new(TransportSpec::Udp, Direction::Input, 0).host("127.0.0.1");
        settings.options.timeout = Duration::from_millis(timeout_ms);
        Endpoint::new(settings).unwrap()
    }

    #[test]
    fn test_kind_resolution() {
        assert_eq!(
            TransportKind::resolve(TransportSpec::Tcp, Direction::Input),
            TransportKind::TcpClient
        );
        assert_eq!(
            TransportKind::resolve(TransportSpec::Tcp, Direction::Output),
            TransportKind::TcpServer
        );
        assert_eq!(
            TransportKind::resolve(TransportSpec::Udp, Direction::Output),
            TransportKind::Udp
        );
    }

    #[test]
    fn test_udp_receive_datagram_and_timeout() {
        let endpoint = udp_input(100);
        let addr = endpoint.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x01, 0x02, 0x03], addr).unwrap();

        // one datagram is exactly one packet, right-sized
        match endpoint.receive(false).unwrap() {
            Received::Packet(payload) => assert_eq!(payload.as_ref(), &[0x01, 0x02, 0x03]),
            other => panic!("unexpected: {:?}", other),
        }

        // nothing sent within the timeout: a timeout indication, not an error
        match endpoint.receive(false).unwrap() {
            Received::TimedOut => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_udp_receive_auto_push() {
        let endpoint = udp_input(100);
        let addr = endpoint.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"queued", addr).unwrap();

        match endpoint.receive(true).unwrap() {
            Received::Enqueued => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(endpoint.queue().len(), 1);
        assert_eq!(endpoint.queue().pop().unwrap().as_ref(), b"queued");
    }

    #[test]
    fn test_udp_send_and_sent_event() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let endpoint = Endpoint::new(
            EndpointSettings::new(TransportSpec::Udp, Direction::Output, port).host("127.0.0.1"),
        )
        .unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        struct Recorder(Arc<Mutex<Vec<Bytes>>>);
        impl crate::network::dispatch::PacketListener for Recorder {
            fn on_packet(&self, payload: Bytes) {
                self.0.lock().push(payload);
            }
        }
        endpoint
            .dispatch()
            .subscribe_sent(Arc::new(Recorder(sent.clone())));

        endpoint.send(b"on air").unwrap();

        let mut buffer = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"on air");
        assert_eq!(sent.lock().len(), 1);
        assert_eq!(sent.lock()[0].as_ref(), b"on air");
    }

    #[test]
    fn test_tcp_receive_without_framing_unsupported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::new(
            EndpointSettings::new(TransportSpec::Tcp, Direction::Input, port).host("127.0.0.1"),
        )
        .unwrap();
        let _server_side = listener.accept().unwrap();

        assert!(matches!(
            endpoint.receive(false),
            Err(TransportError::UnsupportedFraming)
        ));
    }

    #[test]
    fn test_tcp_client_framing_receives_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut settings =
            EndpointSettings::new(TransportSpec::TcpClient, Direction::Input, port)
                .host("127.0.0.1");
        settings.options.timeout = Duration::from_millis(100);
        let endpoint = Endpoint::new(settings).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        // fixed four-byte frames, a stand-in for a real length-delimited codec
        endpoint.set_framing(Box::new(|conn, abort| {
            let mut frame = [0u8; 4];
            match conn.read_bounded(&mut frame, true, abort) {
                crate::network::connection::ReadOutcome::Read(4) => {
                    Ok(Some(Bytes::copy_from_slice(&frame)))
                }
                crate::network::connection::ReadOutcome::Read(_) => Ok(None),
                crate::network::connection::ReadOutcome::Aborted => Ok(None),
                crate::network::connection::ReadOutcome::Eof => Err(
                    TransportError::ConnectionClosed(conn.peer().to_string()),
                ),
                crate::network::connection::ReadOutcome::Failed(e) => Err(e.into()),
            }
        }));

        server_side.write_all(b"WXYZ").unwrap();
        match endpoint.receive(false).unwrap() {
            Received::Packet(payload) => assert_eq!(payload.as_ref(), b"WXYZ"),
            other => panic!("unexpected: {:?}", other),
        }

        // peer gone: the framing error closes and drops the connection
        drop(server_side);
        assert_eq!(endpoint.connection_count(), 1);
        assert!(endpoint.receive(false).is_err());
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[test]
    fn test_draining_endpoint_reads_buffered_frames_to_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut settings =
            EndpointSettings::new(TransportSpec::TcpClient, Direction::Input, port)
                .host("127.0.0.1");
        settings.options.timeout = Duration::from_millis(100);
        let endpoint = Endpoint::new(settings).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        endpoint.set_framing(Box::new(|conn, abort| {
            let mut frame = [0u8; 4];
            match conn.read_bounded(&mut frame, true, abort) {
                crate::network::connection::ReadOutcome::Read(4) => {
                    Ok(Some(Bytes::copy_from_slice(&frame)))
                }
                crate::network::connection::ReadOutcome::Read(_) => Ok(None),
                crate::network::connection::ReadOutcome::Aborted => Ok(None),
                crate::network::connection::ReadOutcome::Eof => Err(
                    TransportError::ConnectionClosed(conn.peer().to_string()),
                ),
                crate::network::connection::ReadOutcome::Failed(e) => Err(e.into()),
            }
        }));

        // two frames sit in the kernel buffer before draining begins
        server_side.write_all(b"AAAABBBB").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        endpoint.shutdown_sockets();

        for expected in [b"AAAA", b"BBBB"] {
            match endpoint.receive(false).unwrap() {
                Received::Packet(payload) => assert_eq!(payload.as_ref(), expected),
                other => panic!("unexpected: {:?}", other),
            }
        }

        // buffer drained: the next read hits end of stream and the
        // connection is dropped
        assert!(matches!(
            endpoint.receive(false),
            Err(TransportError::ConnectionClosed(_))
        ));
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[test]
    fn test_fan_out_partial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut clients = Vec::new();
        let mut connections = Vec::new();
        for _ in 0..3 {
            let client = TcpStream::connect(addr).unwrap();
            let (server_side, peer) = listener.accept().unwrap();
            clients.push(client);
            connections.push(Connection::new(server_side, peer));
        }
        let keep = [connections[0].peer(), connections[2].peer()];

        // break connection #2: writing after a local write-half shutdown
        // fails immediately
        clients[1].shutdown(Shutdown::Both).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // the first write lands in kernel buffers; the RST it provokes makes
        // a following write fail
        let payload = vec![0x55u8; 1024];
        let mut rounds = 0;
        while connections.len() == 3 && rounds < 20 {
            fan_out(&mut connections, &payload);
            std::thread::sleep(Duration::from_millis(10));
            rounds += 1;
        }

        // #1 and #3 survive, #2 is gone
        let peers: Vec<SocketAddr> = connections.iter().map(Connection::peer).collect();
        assert_eq!(peers, keep);

        // the survivors actually got the data
        for idx in [0usize, 2] {
            let client = &mut clients[idx];
            let mut first = [0u8; 16];
            client.read_exact(&mut first).unwrap();
            assert!(first.iter().all(|b| *b == 0x55));
        }
    }

    #[test]
    fn test_reconnect_mutual_exclusion() {
        let endpoint = udp_input(50);

        // a pending request makes a second call fail fast, without blocking
        endpoint
            .shared
            .reconnect
            .state
            .store(RC_REQUESTED, Ordering::SeqCst);
        let started = Instant::now();
        assert!(matches!(
            endpoint.reconnect(),
            Err(TransportError::ReconnectPending)
        ));
        assert!(started.elapsed() < Duration::from_millis(50));
        endpoint
            .shared
            .reconnect
            .state
            .store(RC_IDLE, Ordering::SeqCst);

        // once the loop is running and the first completes, a later
        // reconnect succeeds
        let mut endpoint = endpoint;
        let translator: PacketTranslator = Arc::new(|_, _| Ok(()));
        endpoint.start(Some(translator)).unwrap();
        endpoint.reconnect().unwrap();
        endpoint.reconnect().unwrap();
        endpoint.shutdown();
    }

    #[test]
    fn test_server_accepts_and_fans_out() {
        let mut settings =
            EndpointSettings::new(TransportSpec::TcpServer, Direction::Output, 0)
                .host("127.0.0.1");
        settings.options.timeout = Duration::from_millis(50);
        let mut endpoint = Endpoint::new(settings).unwrap();
        let addr = endpoint.local_addr().unwrap();
        endpoint.start(None).unwrap();

        let mut clients: Vec<TcpStream> = (0..2)
            .map(|_| TcpStream::connect(addr).unwrap())
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.connection_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(endpoint.connection_count(), 2);

        endpoint.send(b"broadcast").unwrap();
        for client in clients.iter_mut() {
            client
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut buffer = [0u8; 9];
            client.read_exact(&mut buffer).unwrap();
            assert_eq!(&buffer, b"broadcast");
        }
        endpoint.shutdown();
    }

    #[test]
    fn test_shutdown_stops_worker_and_clears_queue() {
        let mut endpoint = udp_input(50);
        let addr = endpoint.local_addr().unwrap();

        let handled = Arc::new(Mutex::new(0usize));
        let count = handled.clone();
        let translator: PacketTranslator = Arc::new(move |_, _| {
            *count.lock() += 1;
            Ok(())
        });
        endpoint.start(Some(translator)).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..5 {
            sender.send_to(b"payload", addr).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while *handled.lock() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*handled.lock(), 5);

        endpoint.shutdown();
        assert!(endpoint.queue().is_empty());
        assert!(!endpoint.is_running());
        assert_eq!(endpoint.dispatch().subscriber_counts(), (0, 0, 0));
    }

    #[test]
    fn test_stage_monotonic() {
        let stage = AtomicU8::new(STAGE_RUNNING);
        assert!(advance_stage(&stage, STAGE_DRAINING));
        assert!(!advance_stage(&stage, STAGE_DRAINING));
        assert!(advance_stage(&stage, STAGE_CLOSED));
        // the stage never moves backwards
        assert!(!advance_stage(&stage, STAGE_DRAINING));
        assert_eq!(stage.load(Ordering::SeqCst), STAGE_CLOSED);
    }
}
