//! Socket construction and option application
//!
//! Builds configured UDP and TCP sockets from [`EndpointSettings`] using
//! `socket2`, then hands them over as `std::net` types for blocking I/O.
//! Every socket gets a bounded read timeout so no receive or accept can
//! block indefinitely.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{EndpointOptions, EndpointSettings};
use crate::error::TransportError;
use crate::Result;

/// Resolve a (host, port) pair to a socket address.
///
/// An empty or absent host resolves to the IPv4 wildcard.
pub fn resolve_addr(host: Option<&str>, port: u16) -> Result<SocketAddr> {
    let host = match host {
        Some(h) if !h.is_empty() => h,
        _ => return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Address(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::Address(format!("{host}:{port}: no addresses")))
}

/// Interface address used for a multicast join: the named device parsed as an
/// interface IPv4 address, or the OS default when absent or unparseable.
fn multicast_interface(device: Option<&str>) -> Ipv4Addr {
    match device {
        Some(d) if !d.is_empty() => match d.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("device {:?} is not an interface address, using OS default", d);
                Ipv4Addr::UNSPECIFIED
            }
        },
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

fn apply_common(socket: &Socket, opts: &EndpointOptions) -> std::io::Result<()> {
    socket.set_reuse_address(opts.reuse_addr)?;
    if let Some(size) = opts.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = opts.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(tos) = opts.tos {
        socket.set_tos(tos)?;
    }
    socket.set_read_timeout(Some(opts.timeout))?;
    socket.set_write_timeout(Some(opts.timeout))?;
    Ok(())
}

fn apply_udp(socket: &Socket, opts: &EndpointOptions, multicast: bool) -> std::io::Result<()> {
    if let Some(broadcast) = opts.broadcast {
        socket.set_broadcast(broadcast)?;
    }
    if multicast {
        if let Some(loopback) = opts.multicast_loop {
            socket.set_multicast_loop_v4(loopback)?;
        }
        if let Some(ttl) = opts.multicast_ttl {
            socket.set_multicast_ttl_v4(ttl)?;
        }
    }
    Ok(())
}

fn apply_tcp_stream(socket: &Socket, opts: &EndpointOptions) -> std::io::Result<()> {
    if let Some(keep_alive) = opts.keep_alive {
        socket.set_keepalive(keep_alive)?;
    }
    if let Some(no_delay) = opts.no_delay {
        socket.set_nodelay(no_delay)?;
    }
    if let Some(linger) = opts.linger {
        socket.set_linger(Some(linger))?;
    }
    Ok(())
}

/// Open and configure a UDP socket.
///
/// Input sockets bind the configured address and, for a multicast group,
/// join it via the named interface or the OS default. Output sockets bind
/// the local port only and never join the group; the returned address is the
/// send destination.
pub fn open_udp(settings: &EndpointSettings) -> Result<(UdpSocket, Option<SocketAddr>)> {
    let opts = &settings.options;
    let addr = resolve_addr(settings.host.as_deref(), settings.port)?;
    let multicast = addr.ip().is_multicast();

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    apply_common(&socket, opts)?;
    apply_udp(&socket, opts, multicast)?;

    let destination = if settings.direction.is_output() {
        if settings.host.as_deref().map_or(true, str::is_empty) {
            return Err(TransportError::Config(
                "output UDP endpoint requires a destination host".into(),
            ));
        }
        let local_port = opts.local_port.unwrap_or(0);
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, local_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, local_port).into()
        };
        socket.bind(&local.into())?;
        Some(addr)
    } else {
        let bind_addr = udp_input_bind_addr(addr, multicast);
        socket.bind(&bind_addr.into())?;
        if multicast {
            join_group(&socket, addr.ip(), settings.device.as_deref())?;
        }
        None
    };

    let udp: UdpSocket = socket.into();
    if opts.eager_recv_buffer {
        eager_recv_probe(&udp, opts.timeout);
    }
    debug!(
        "udp socket open: local {:?}, destination {:?}",
        udp.local_addr().ok(),
        destination
    );
    Ok((udp, destination))
}

/// Bind address for an input UDP socket.
///
/// Windows refuses to bind a multicast group address directly, so there the
/// socket binds the port alone before joining the group.
fn udp_input_bind_addr(addr: SocketAddr, multicast: bool) -> SocketAddr {
    if multicast && cfg!(windows) {
        match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, addr.port()).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, addr.port()).into(),
        }
    } else {
        addr
    }
}

fn join_group(socket: &Socket, group: IpAddr, device: Option<&str>) -> Result<()> {
    match group {
        IpAddr::V4(group) => {
            let interface = multicast_interface(device);
            socket.join_multicast_v4(&group, &interface)?;
            debug!("joined multicast group {} on interface {}", group, interface);
        }
        IpAddr::V6(group) => {
            socket.join_multicast_v6(&group, 0)?;
            debug!("joined multicast group {} on default interface", group);
        }
    }
    Ok(())
}

/// Best-effort zero-length receive so the OS materializes its receive buffer
/// before the first real packet, narrowing the early-packet-loss window.
/// Probe failures are ignored.
fn eager_recv_probe(socket: &UdpSocket, timeout: Duration) {
    let _ = socket.set_read_timeout(Some(Duration::from_millis(1)));
    let _ = socket.recv(&mut []);
    let _ = socket.set_read_timeout(Some(timeout));
}

/// Open a TCP server socket bound to the configured address.
///
/// The listener is non-blocking: accept returns `WouldBlock` when no client
/// is waiting, which the endpoint's throttled accept cadence treats as
/// "no client yet".
pub fn open_tcp_listener(settings: &EndpointSettings) -> Result<TcpListener> {
    let opts = &settings.options;
    let addr = resolve_addr(settings.host.as_deref(), settings.port)?;
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    apply_common(&socket, opts)?;
    socket.bind(&addr.into())?;
    socket.listen(opts.server_backlog)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    debug!("tcp listener open on {:?}", listener.local_addr().ok());
    Ok(listener)
}

/// Open a TCP client connection to the configured remote, bounded by the
/// connect timeout.
pub fn open_tcp_client(settings: &EndpointSettings) -> Result<TcpStream> {
    let opts = &settings.options;
    if settings.host.as_deref().map_or(true, str::is_empty) {
        return Err(TransportError::Config(
            "TCP client endpoint requires a remote host".into(),
        ));
    }
    let addr = resolve_addr(settings.host.as_deref(), settings.port)?;
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    apply_common(&socket, opts)?;
    apply_tcp_stream(&socket, opts)?;
    if let Some(local_port) = opts.local_port {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, local_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, local_port).into()
        };
        socket.bind(&local.into())?;
    }
    socket.connect_timeout(&addr.into(), opts.connect_timeout)?;

    let stream: TcpStream = socket.into();
    stream.set_read_timeout(Some(opts.timeout))?;
    stream.set_write_timeout(Some(opts.timeout))?;
    debug!("tcp client connected to {}", addr);
    Ok(stream)
}

/// Apply stream options to a freshly accepted server-side connection.
/// Accepted sockets get the same stream options as client sockets.
pub fn configure_accepted(stream: &TcpStream, opts: &EndpointOptions) -> std::io::Result<()> {
    stream.set_read_timeout(Some(opts.timeout))?;
    stream.set_write_timeout(Some(opts.timeout))?;
    apply_tcp_stream(&SockRef::from(stream), opts)
}
