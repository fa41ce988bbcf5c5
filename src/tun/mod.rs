//! The OS tunnel device boundary.
//!
//! A [`Tunnel`] is any pollable fd carrying whole IP packets: the real TUN
//! device on Linux, or a socketpair end in tests. Reads and writes are
//! non-blocking; readiness flows through the loop's I/O conditions.

pub mod linux;

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use thiserror::Error;

use crate::event::{Cond, EventLoop};
use crate::tunnel::packet::Packet;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel device closed")]
    Closed,
    #[error("Could not create tunnel device: {0}")]
    Create(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Builds a point-to-point tunnel for a session: `(local, peer)` virtual
/// addresses in, configured device out. Injected so tests can supply a
/// socketpair-backed tunnel.
pub type TunnelFactory = Rc<dyn Fn(Ipv4Addr, Ipv4Addr) -> Result<Tunnel, TunnelError>>;

/// A non-blocking packet fd owned by one dispatcher.
pub struct Tunnel {
    lp: EventLoop,
    fd: OwnedFd,
}

impl Tunnel {
    /// Wrap an fd, switching it to non-blocking mode.
    pub fn from_fd(lp: &EventLoop, fd: OwnedFd) -> Result<Tunnel, TunnelError> {
        // SAFETY: fd is owned and valid; F_GETFL/F_SETFL do not affect
        // memory.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(TunnelError::Io(io::Error::last_os_error()));
        }
        // SAFETY: as above.
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(TunnelError::Io(io::Error::last_os_error()));
        }
        Ok(Tunnel { lp: lp.clone(), fd })
    }

    pub fn can_read(&self) -> Cond {
        self.lp.can_read(self.fd.as_raw_fd())
    }

    pub fn can_write(&self) -> Cond {
        self.lp.can_write(self.fd.as_raw_fd())
    }

    /// Read one packet. Returns false when the read would block.
    pub fn read(&self, packet: &mut Packet) -> Result<bool, TunnelError> {
        let buf = packet.buffer_mut();
        // SAFETY: buf is a valid writable slice for its full length.
        let n = unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
                _ => Err(TunnelError::Io(err)),
            };
        }
        if n == 0 {
            return Err(TunnelError::Closed);
        }
        packet.set_len(n as usize);
        Ok(true)
    }

    /// Write one packet. Returns false when the packet was dropped
    /// (device not ready).
    pub fn write(&self, packet: &Packet) -> Result<bool, TunnelError> {
        let buf = packet.as_slice();
        // SAFETY: buf is a valid readable slice for its length.
        let n = unsafe {
            libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
                io::ErrorKind::BrokenPipe => Err(TunnelError::Closed),
                _ => Err(TunnelError::Io(err)),
            };
        }
        Ok(true)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.lp.forget_fd(self.fd.as_raw_fd());
    }
}
