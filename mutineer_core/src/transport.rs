//! Socket plumbing for replaying a session against a target.
//!
//! A [`Transport`] owns everything that outlives a single run: the target host,
//! the address family inferred from it, and the listening socket used in server
//! mode. Each run gets a fresh [`Connection`] that is closed when the run ends.

use crate::monitor::StopHandle;
use socket2::{Domain, Protocol as SocketProtocol, SockAddr, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, SocketAddrV6};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Size of a single `recv` call.
pub const RECV_CHUNK_SIZE: usize = 4096;
const LISTEN_BACKLOG: i32 = 5;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1);
const IPV4_BROADCAST: &str = "255.255.255.255";
/// `IPPROTO_RAW`: the kernel expects the caller to supply the IP header.
const IPPROTO_RAW: i32 = 255;
/// `ETH_P_ALL`: every link-layer protocol.
const ETH_P_ALL: u16 = 0x0003;

/// IP protocol numbers accepted by name for raw sockets.
const L3_PROTOCOLS: &[(&str, i32)] = &[
    ("ip", 0),
    ("icmp", 1),
    ("igmp", 2),
    ("ggp", 3),
    ("ipip", 4),
    ("st", 5),
    ("egp", 8),
    ("igp", 9),
    ("pup", 12),
    ("idp", 22),
    ("tp", 29),
    ("ipv6", 41),
    ("rsvp", 46),
    ("gre", 47),
    ("esp", 50),
    ("ah", 51),
    ("icmpv6", 58),
    ("eigrp", 88),
    ("ospf", 89),
    ("pim", 103),
    ("vrrp", 112),
    ("l2tp", 115),
    ("sctp", 132),
    ("udplite", 136),
    ("raw", IPPROTO_RAW),
];

/// Errors raised while creating sockets or moving bytes.
///
/// [`TransportError::is_fatal`] separates setup failures, which end the process,
/// from per-run failures that are handed to the exception processor.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Malformed address: {0}")]
    MalformedAddress(String),
    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("Unable to create {kind} socket (raw sockets need elevated privileges): {source}")]
    Creation {
        kind: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Server has closed the connection on message {0}")]
    ConnectionClosed(usize),
    #[error("timed out waiting for message {0}")]
    ReceiveTimeout(usize),
    #[error("Failed to send: {0}")]
    Send(#[source] io::Error),
    #[error("Failed to receive: {0}")]
    Receive(#[source] io::Error),
    #[error("Failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
    #[error("Interrupted by operator")]
    Interrupted,
}

impl TransportError {
    /// Setup failures that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::MalformedAddress(_)
                | TransportError::UnknownProtocol(_)
                | TransportError::Creation { .. }
        )
    }

    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused
        )
    }

    fn creation(kind: &'static str) -> impl FnOnce(io::Error) -> TransportError {
        move |source| TransportError::Creation { kind, source }
    }
}

/// Address family, inferred from the shape of the target host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    /// Anything else: a filesystem path for local sockets, or an interface name
    /// for link-layer sockets.
    Local,
}

impl AddressFamily {
    /// An IPv6 literal may carry a zone suffix (`fe80::1%eth0`, `fe80::1%2`).
    pub fn infer(host: &str) -> Result<Self, TransportError> {
        if is_dotted_quad(host) {
            return Ok(AddressFamily::Ipv4);
        }
        let (addr, _) = split_zone(host);
        if looks_like_ipv6(addr) {
            if addr.matches("::").count() > 1 {
                return Err(TransportError::MalformedAddress(format!(
                    "'{host}' uses '::' more than once"
                )));
            }
            return Ok(AddressFamily::Ipv6);
        }
        Ok(AddressFamily::Local)
    }

    fn domain(self) -> Domain {
        match self {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
            AddressFamily::Local => Domain::UNIX,
        }
    }
}

fn is_dotted_quad(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|part| (1..=3).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit()))
}

fn split_zone(host: &str) -> (&str, Option<&str>) {
    match host.split_once('%') {
        Some((addr, zone)) if !zone.is_empty() => (addr, Some(zone)),
        _ => (host, None),
    }
}

/// Resolves an IPv6 zone, given as an interface index or name.
fn scope_id(zone: &str) -> Result<u32, TransportError> {
    match zone.parse::<u32>() {
        Ok(index) => Ok(index),
        Err(_) => interface_index(zone),
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> Result<u32, TransportError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| TransportError::MalformedAddress(format!("interface '{name}'")))?;
    // SAFETY: `c_name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TransportError::MalformedAddress(format!(
            "no such interface '{name}'"
        )));
    }
    Ok(index)
}

#[cfg(not(unix))]
fn interface_index(name: &str) -> Result<u32, TransportError> {
    Err(TransportError::MalformedAddress(format!(
        "interface names are not supported here, use the index instead of '{name}'"
    )))
}

fn looks_like_ipv6(host: &str) -> bool {
    host.contains(':')
        && host
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
}

/// The socket flavour selected by a session's protocol identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Raw IP socket for the given protocol number.
    RawIp(i32),
    /// Raw link-layer socket (`L2raw`).
    LinkLayer,
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "L2raw" => Ok(Protocol::LinkLayer),
            _ => L3_PROTOCOLS
                .iter()
                .find(|(name, _)| *name == s)
                .map(|(_, number)| Protocol::RawIp(*number))
                .or_else(|| s.parse::<u8>().ok().map(|n| Protocol::RawIp(i32::from(n))))
                .ok_or_else(|| TransportError::UnknownProtocol(s.to_string())),
        }
    }
}

/// How bytes leave a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
    Raw,
    LinkLayer,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketKind::Stream => "stream",
            SocketKind::Datagram => "datagram",
            SocketKind::Raw => "raw",
            SocketKind::LinkLayer => "link-layer",
        };
        f.write_str(name)
    }
}

/// A per-run socket plus the address it talks to.
#[derive(Debug)]
pub struct Connection {
    socket: Socket,
    kind: SocketKind,
    dest: SockAddr,
}

impl Connection {
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Stream sockets write on the connection; every other kind addresses each
    /// datagram explicitly.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match self.kind {
            SocketKind::Stream => self.socket.write_all(bytes).map_err(TransportError::Send),
            _ => self
                .socket
                .send_to(bytes, &self.dest)
                .map(|_| ())
                .map_err(TransportError::Send),
        }
    }

    /// Reads the response to message `message`.
    ///
    /// A single chunk is read unless `expected_len` exceeds [`RECV_CHUNK_SIZE`], in
    /// which case chunks are accumulated until at least `expected_len` bytes
    /// arrived or the peer stops sending. An empty first read means the peer
    /// closed the connection.
    pub fn receive(
        &mut self,
        expected_len: usize,
        timeout: Duration,
        message: usize,
    ) -> Result<Vec<u8>, TransportError> {
        self.socket
            .set_read_timeout(Some(timeout.max(MIN_RECEIVE_TIMEOUT)))
            .map_err(TransportError::Receive)?;

        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        let read = self.read_chunk(&mut chunk, message)?;
        if read == 0 {
            return Err(TransportError::ConnectionClosed(message));
        }
        let mut response = chunk[..read].to_vec();

        if expected_len > RECV_CHUNK_SIZE {
            while response.len() < expected_len {
                let read = self.read_chunk(&mut chunk, message)?;
                if read == 0 {
                    break;
                }
                response.extend_from_slice(&chunk[..read]);
            }
        }
        Ok(response)
    }

    fn read_chunk(&mut self, chunk: &mut [u8], message: usize) -> Result<usize, TransportError> {
        loop {
            match self.socket.read(chunk) {
                Ok(read) => return Ok(read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(TransportError::ReceiveTimeout(message));
                }
                Err(e) => return Err(TransportError::Receive(e)),
            }
        }
    }

    /// Best-effort close; errors are swallowed.
    pub fn close(self) {
        if self.kind == SocketKind::Stream {
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }
}

/// Result of establishing the connection for one run.
#[derive(Debug)]
pub enum Link {
    Connected(Connection),
    /// Server mode accepted a peer other than the target; it has been closed.
    Spurious(String),
}

/// Creates connections of the right kind for a session's protocol.
#[derive(Debug)]
pub struct Transport {
    host: String,
    family: Option<AddressFamily>,
    listener: Option<Socket>,
    stop: StopHandle,
}

impl Transport {
    pub fn new(host: impl Into<String>, stop: StopHandle) -> Self {
        Self {
            host: host.into(),
            family: None,
            listener: None,
            stop,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Inferred on first use and cached for the life of the process.
    pub fn address_family(&mut self) -> Result<AddressFamily, TransportError> {
        if let Some(family) = self.family {
            return Ok(family);
        }
        let family = AddressFamily::infer(&self.host)?;
        self.family = Some(family);
        Ok(family)
    }

    /// Opens the connection for one run.
    ///
    /// In server mode (`client_mode == false`) for TCP, the listening socket is
    /// created on first use and kept; each call accepts one peer and rejects it as
    /// [`Link::Spurious`] if its address is not the target host.
    pub fn connect(
        &mut self,
        proto: &str,
        port: u16,
        client_mode: bool,
    ) -> Result<Link, TransportError> {
        let family = self.address_family()?;
        let protocol: Protocol = proto.parse()?;

        let connection = match protocol {
            Protocol::Tcp if client_mode => {
                let dest = self.endpoint(family, port)?;
                let socket = Socket::new(family.domain(), Type::STREAM, None)
                    .map_err(TransportError::creation("stream"))?;
                socket
                    .connect(&dest)
                    .map_err(|source| TransportError::Connect {
                        addr: self.describe(port),
                        source,
                    })?;
                Connection {
                    socket,
                    kind: SocketKind::Stream,
                    dest,
                }
            }
            Protocol::Tcp => return self.accept(family, port),
            Protocol::Udp => {
                let dest = self.endpoint(family, port)?;
                let socket = Socket::new(family.domain(), Type::DGRAM, None)
                    .map_err(TransportError::creation("datagram"))?;
                Connection {
                    socket,
                    kind: SocketKind::Datagram,
                    dest,
                }
            }
            Protocol::RawIp(number) => {
                if family == AddressFamily::Local {
                    return Err(TransportError::MalformedAddress(format!(
                        "raw IP sockets need an IP address, got '{}'",
                        self.host
                    )));
                }
                let dest = self.endpoint(family, 0)?;
                let socket = Socket::new(
                    family.domain(),
                    Type::RAW,
                    Some(SocketProtocol::from(number)),
                )
                .map_err(TransportError::creation("raw"))?;
                if family == AddressFamily::Ipv4 && number != IPPROTO_RAW {
                    socket
                        .set_header_included(false)
                        .map_err(TransportError::creation("raw"))?;
                }
                Connection {
                    socket,
                    kind: SocketKind::Raw,
                    dest,
                }
            }
            Protocol::LinkLayer => {
                let dest = link_layer_addr(&self.host)?;
                let socket = link_layer_socket()?;
                Connection {
                    socket,
                    kind: SocketKind::LinkLayer,
                    dest,
                }
            }
        };

        if self.host == IPV4_BROADCAST {
            connection
                .socket
                .set_broadcast(true)
                .map_err(TransportError::creation("broadcast"))?;
        }
        Ok(Link::Connected(connection))
    }

    /// Drops the server-mode listening socket, if any.
    pub fn shutdown(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!(host = %self.host, "closed listening socket");
        }
    }

    fn accept(&mut self, family: AddressFamily, port: u16) -> Result<Link, TransportError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => self.listen(family, port)?,
        };
        let accepted = accept_peer(&listener, &self.stop);
        self.listener = Some(listener);
        let (socket, peer) = accepted?;

        let expected = split_zone(&self.host).0.parse::<IpAddr>();
        if let (Some(peer_addr), Ok(expected)) = (peer.as_socket(), expected) {
            if peer_addr.ip() != expected {
                let _ = socket.shutdown(Shutdown::Both);
                return Ok(Link::Spurious(peer_addr.to_string()));
            }
        }

        Ok(Link::Connected(Connection {
            socket,
            kind: SocketKind::Stream,
            dest: peer,
        }))
    }

    fn listen(&self, family: AddressFamily, port: u16) -> Result<Socket, TransportError> {
        let addr = self.endpoint(family, port)?;
        let socket = Socket::new(family.domain(), Type::STREAM, None)
            .map_err(TransportError::creation("listening"))?;
        if family != AddressFamily::Local {
            socket
                .set_reuse_address(true)
                .map_err(TransportError::creation("listening"))?;
        }
        socket
            .bind(&addr)
            .and_then(|_| socket.listen(LISTEN_BACKLOG))
            .and_then(|_| socket.set_nonblocking(true))
            .map_err(TransportError::creation("listening"))?;
        tracing::info!(addr = %self.describe(port), "waiting for the target to connect");
        Ok(socket)
    }

    fn endpoint(&self, family: AddressFamily, port: u16) -> Result<SockAddr, TransportError> {
        match family {
            AddressFamily::Local => SockAddr::unix(&self.host)
                .map_err(|e| TransportError::MalformedAddress(format!("'{}': {e}", self.host))),
            AddressFamily::Ipv4 | AddressFamily::Ipv6 => self.socket_addr(port).map(SockAddr::from),
        }
    }

    fn socket_addr(&self, port: u16) -> Result<SocketAddr, TransportError> {
        let (addr, zone) = split_zone(&self.host);
        let ip: IpAddr = addr
            .parse()
            .map_err(|e| TransportError::MalformedAddress(format!("'{}': {e}", self.host)))?;
        match (ip, zone) {
            (IpAddr::V6(ip), Some(zone)) => Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                0,
                scope_id(zone)?,
            ))),
            _ => Ok(SocketAddr::new(ip, port)),
        }
    }

    fn describe(&self, port: u16) -> String {
        match self.family {
            Some(AddressFamily::Local) => self.host.clone(),
            Some(AddressFamily::Ipv6) => format!("[{}]:{port}", self.host),
            _ => format!("{}:{port}", self.host),
        }
    }
}

fn accept_peer(listener: &Socket, stop: &StopHandle) -> Result<(Socket, SockAddr), TransportError> {
    loop {
        if stop.is_stop_requested() {
            return Err(TransportError::Interrupted);
        }
        match listener.accept() {
            Ok((socket, peer)) => {
                socket
                    .set_nonblocking(false)
                    .map_err(TransportError::Accept)?;
                return Ok((socket, peer));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Accept(e)),
        }
    }
}

#[cfg(target_os = "linux")]
fn link_layer_socket() -> Result<Socket, TransportError> {
    let protocol = SocketProtocol::from(i32::from(ETH_P_ALL.to_be()));
    Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
        .map_err(TransportError::creation("link-layer"))
}

#[cfg(target_os = "linux")]
fn link_layer_addr(interface: &str) -> Result<SockAddr, TransportError> {
    let index = interface_index(interface)?;

    // SAFETY: an all-zero `sockaddr_storage` is valid, and it is large enough and
    // aligned for a `sockaddr_ll`, which is written in place before use.
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let ll = &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();
        ll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        ll.sll_protocol = ETH_P_ALL.to_be();
        ll.sll_ifindex = index as libc::c_int;
        let len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        Ok(SockAddr::new(storage, len))
    }
}

#[cfg(not(target_os = "linux"))]
fn link_layer_socket() -> Result<Socket, TransportError> {
    Err(TransportError::UnknownProtocol(
        "L2raw is only supported on Linux".to_string(),
    ))
}

#[cfg(not(target_os = "linux"))]
fn link_layer_addr(_interface: &str) -> Result<SockAddr, TransportError> {
    Err(TransportError::UnknownProtocol(
        "L2raw is only supported on Linux".to_string(),
    ))
}
