//! Server shell: accept control connections, one session each, lease
//! virtual IPs, keep NAT rules tidy.

use std::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::event::{Action, EventLoop};
use crate::net::nat::{self, NatError};
use crate::net::socket::{SocketError, TcpAcceptor};
use crate::net::IpAddressPool;
use crate::tun::TunnelFactory;
use crate::tunnel::session::{ServerContext, ServerSessionHandler};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Socket setup failed: {0}")]
    Socket(#[from] SocketError),
    #[error("NAT setup failed: {0}")]
    Nat(#[from] NatError),
    #[error("Subnet {0} has no usable host addresses")]
    UnusableSubnet(ipnetwork::Ipv4Network),
}

pub struct Server {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    lp: EventLoop,
    ctx: Rc<ServerContext>,
    acceptor: TcpAcceptor,
    sessions: RefCell<Vec<SessionEntry>>,
    _accept_action: RefCell<Option<Action>>,
}

struct SessionEntry {
    id: u64,
    _session: ServerSessionHandler,
    _end_watch: Action,
}

impl Server {
    pub fn new(
        lp: &EventLoop,
        config: ServerConfig,
        tunnel_factory: TunnelFactory,
    ) -> Result<Server, ServerError> {
        // Crash recovery first: stale tagged rules from a previous run.
        nat::clear()?;
        nat::masquerade(config.subnet)?;

        let server_ip = config
            .subnet
            .nth(1)
            .ok_or(ServerError::UnusableSubnet(config.subnet))?;
        let mut pool = IpAddressPool::new(config.subnet);
        pool.reserve(server_ip);
        for addr in config.static_hosts.values() {
            pool.reserve(*addr);
        }

        let acceptor = TcpAcceptor::bind(lp, config.port)?;
        let can_accept = acceptor.can_accept();
        let port = acceptor.local_port();

        let inner = Rc::new(ServerInner {
            lp: lp.clone(),
            ctx: Rc::new(ServerContext {
                config,
                pool: Rc::new(RefCell::new(pool)),
                tunnel_factory,
                server_ip,
            }),
            acceptor,
            sessions: RefCell::new(Vec::new()),
            _accept_action: RefCell::new(None),
        });

        let accept_action = {
            let weak = Rc::downgrade(&inner);
            Action::new(lp, vec![can_accept], move || {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::do_accept(&inner);
                }
            })
        };
        *inner._accept_action.borrow_mut() = Some(accept_action);

        info!(target: "server", "listening on port {} for subnet {}", port, inner.ctx.config.subnet);
        Ok(Server { inner })
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }
}

impl ServerInner {
    fn do_accept(inner: &Rc<ServerInner>) {
        loop {
            match inner.acceptor.accept() {
                Ok(Some((socket, addr))) => {
                    info!(target: "server", "accepted connection from {}", addr);
                    let session =
                        ServerSessionHandler::new(&inner.lp, Rc::clone(&inner.ctx), socket);
                    let id = session.id();
                    let end_watch = {
                        let weak = Rc::downgrade(inner);
                        Action::once(&inner.lp, vec![session.did_end()], move || {
                            if let Some(inner) = weak.upgrade() {
                                ServerInner::remove_session(&inner, id);
                            }
                        })
                    };
                    inner.sessions.borrow_mut().push(SessionEntry {
                        id,
                        _session: session,
                        _end_watch: end_watch,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "server", "accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn remove_session(inner: &Rc<ServerInner>, id: u64) {
        let mut sessions = inner.sessions.borrow_mut();
        sessions.retain(|entry| entry.id != id);
        info!(target: "server", "session {} closed ({} active)", id, sessions.len());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Err(e) = nat::clear() {
            warn!(target: "server", "NAT cleanup failed: {}", e);
        }
    }
}
