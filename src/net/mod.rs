//! Sockets, NAT plumbing, and virtual address leasing.

pub mod nat;
pub mod pool;
pub mod socket;

pub use pool::IpAddressPool;
pub use socket::{SocketError, TcpAcceptor, TcpConnection, UdpChannel};
