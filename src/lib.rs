//! stun: a point-to-point VPN tunnel.
//!
//! A client opens an authenticated, encrypted TCP control channel to a
//! server, which leases it a virtual IP on an internal subnet; both sides
//! then run parallel UDP data pipes carrying the tunnel devices' IP
//! packets, multiplexed round-robin, heartbeated, rotated periodically,
//! and reconnected on failure. Everything runs on a single-threaded
//! reactive event loop (see [`event`]).

pub mod client;
pub mod config;
pub mod crypto;
pub mod event;
pub mod logger;
pub mod net;
pub mod server;
pub mod tun;
pub mod tunnel;

pub use client::Client;
pub use server::Server;
