//! Linux TUN device creation.
//!
//! Opens `/dev/net/tun`, binds an interface name with `TUNSETIFF`, and
//! configures addressing with the `ip` tool. Requires CAP_NET_ADMIN.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Command;
use std::rc::Rc;

use log::info;

use super::{Tunnel, TunnelError, TunnelFactory};
use crate::event::EventLoop;

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open a TUN fd named `name` (no packet-info header).
fn open_tun(name: &str) -> Result<OwnedFd, TunnelError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(TunnelError::Create(format!("interface name '{}' too long", name)));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .map_err(|e| TunnelError::Create(format!("open {}: {}", TUN_DEVICE, e)))?;

    let mut ifr = IfReq {
        name: [0u8; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0u8; 22],
    };
    ifr.name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: fd is a freshly opened /dev/net/tun and ifr is a valid
    // TUNSETIFF request for the call's lifetime.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
    if ret < 0 {
        return Err(TunnelError::Create(format!(
            "TUNSETIFF '{}': {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(file.into())
}

fn run_cmd(cmd: &str) -> Result<(), TunnelError> {
    let args: Vec<&str> = cmd.split_whitespace().collect();
    if args.is_empty() {
        return Ok(());
    }
    let output = Command::new(args[0]).args(&args[1..]).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::Create(format!("command '{}' failed: {}", cmd, stderr.trim())));
    }
    Ok(())
}

/// Create and configure a point-to-point TUN device.
pub fn create_device(
    lp: &EventLoop,
    name: &str,
    local: Ipv4Addr,
    peer: Ipv4Addr,
    mtu: u16,
) -> Result<Tunnel, TunnelError> {
    let fd = open_tun(name)?;
    run_cmd(&format!("ip addr add {} peer {} dev {}", local, peer, name))?;
    run_cmd(&format!("ip link set dev {} mtu {}", name, mtu))?;
    run_cmd(&format!("ip link set dev {} up", name))?;
    info!(target: "tun", "device '{}' up: {} peer {}", name, local, peer);
    Tunnel::from_fd(lp, fd)
}

/// Factory producing numbered devices (`<prefix>0`, `<prefix>1`, ...), one
/// per session.
pub fn device_factory(lp: &EventLoop, prefix: &str, mtu: u16) -> TunnelFactory {
    let lp = lp.clone();
    let prefix = prefix.to_string();
    let next_index = Cell::new(0u32);
    Rc::new(move |local, peer| {
        let name = format!("{}{}", prefix, next_index.get());
        next_index.set(next_index.get() + 1);
        create_device(&lp, &name, local, peer, mtu)
    })
}
