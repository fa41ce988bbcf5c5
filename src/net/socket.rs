//! Non-blocking TCP and UDP wrappers tied to the event loop.
//!
//! Every socket registers its readiness through the loop's I/O conditions;
//! reads and writes never block. Would-block shows up as a zero-progress
//! return and the caller re-arms on the condition.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;

use log::trace;
use thiserror::Error;

use crate::event::{Cond, EventLoop};

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Peer closed the connection")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// A connected, non-blocking TCP stream.
pub struct TcpConnection {
    lp: EventLoop,
    stream: TcpStream,
}

impl TcpConnection {
    pub fn connect(lp: &EventLoop, addr: SocketAddr) -> Result<TcpConnection, SocketError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_std(lp, stream)
    }

    pub fn from_std(lp: &EventLoop, stream: TcpStream) -> Result<TcpConnection, SocketError> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(TcpConnection { lp: lp.clone(), stream })
    }

    pub fn can_read(&self) -> Cond {
        self.lp.can_read(self.stream.as_raw_fd())
    }

    pub fn can_write(&self) -> Cond {
        self.lp.can_write(self.stream.as_raw_fd())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Read into `buf`. Returns 0 when the read would block; a peer
    /// hangup is `SocketError::Closed`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match (&self.stream).read(buf) {
            Ok(0) => Err(SocketError::Closed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) if is_disconnect(&e) => Err(SocketError::Closed),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Write from `buf`. Returns the number of bytes accepted, 0 when the
    /// write would block.
    pub fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        match (&self.stream).write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) if is_disconnect(&e) => Err(SocketError::Closed),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.lp.forget_fd(self.stream.as_raw_fd());
    }
}

/// A non-blocking TCP listener.
pub struct TcpAcceptor {
    lp: EventLoop,
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(lp: &EventLoop, port: u16) -> Result<TcpAcceptor, SocketError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        Ok(TcpAcceptor { lp: lp.clone(), listener })
    }

    pub fn can_accept(&self) -> Cond {
        self.lp.can_read(self.listener.as_raw_fd())
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Accept one pending connection, or `None` when the accept would
    /// block.
    pub fn accept(&self) -> Result<Option<(TcpConnection, SocketAddr)>, SocketError> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let conn = TcpConnection::from_std(&self.lp, stream)?;
                Ok(Some((conn, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.lp.forget_fd(self.listener.as_raw_fd());
    }
}

/// One non-blocking UDP socket: a data pipe leg.
///
/// Client pipes connect immediately; server pipes bind an announced port
/// and connect once the first (priming) datagram reveals the peer's
/// address.
pub struct UdpChannel {
    lp: EventLoop,
    socket: UdpSocket,
    connected: Cell<bool>,
}

impl UdpChannel {
    /// Bind `port` (0 for ephemeral) without a fixed peer.
    pub fn bind(lp: &EventLoop, port: u16) -> Result<UdpChannel, SocketError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        Ok(UdpChannel { lp: lp.clone(), socket, connected: Cell::new(false) })
    }

    /// Bind an ephemeral port connected to `peer`.
    pub fn open(lp: &EventLoop, peer: SocketAddr) -> Result<UdpChannel, SocketError> {
        let channel = Self::bind(lp, 0)?;
        channel.connect(peer)?;
        Ok(channel)
    }

    pub fn connect(&self, peer: SocketAddr) -> Result<(), SocketError> {
        self.socket.connect(peer)?;
        self.connected.set(true);
        trace!(target: "socket", "udp channel locked to {}", peer);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn can_read(&self) -> Cond {
        self.lp.can_read(self.socket.as_raw_fd())
    }

    pub fn can_write(&self) -> Cond {
        self.lp.can_write(self.socket.as_raw_fd())
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Send one datagram to the connected peer. Returns false when the
    /// datagram was not sent (would block, or transient ICMP refusal).
    pub fn send(&self, buf: &[u8]) -> Result<bool, SocketError> {
        match self.socket.send(buf) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            // A previous datagram drew ICMP port-unreachable; the pipe may
            // still come up once the peer's socket exists.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(false),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Receive one datagram along with its source. `None` when the read
    /// would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.socket.recv_from(buf) {
            Ok((n, src)) => Ok(Some((n, src))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.lp.forget_fd(self.socket.as_raw_fd());
    }
}
