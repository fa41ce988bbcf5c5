//! Client shell: one session at a time, fixed-delay reconnect forever.

use std::cell::RefCell;
use std::net::ToSocketAddrs;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{info, warn};

use crate::config::ClientConfig;
use crate::event::{Action, EventLoop, Trigger};
use crate::net::socket::TcpConnection;
use crate::tun::TunnelFactory;
use crate::tunnel::session::ClientSessionHandler;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct Client {
    inner: Rc<ClientInner>,
}

struct ClientInner {
    lp: EventLoop,
    config: ClientConfig,
    tunnel_factory: TunnelFactory,
    session: RefCell<Option<ClientSessionHandler>>,
    end_watch: RefCell<Option<Action>>,
}

impl Client {
    pub fn new(lp: &EventLoop, config: ClientConfig, tunnel_factory: TunnelFactory) -> Client {
        let inner = Rc::new(ClientInner {
            lp: lp.clone(),
            config,
            tunnel_factory,
            session: RefCell::new(None),
            end_watch: RefCell::new(None),
        });
        ClientInner::connect(&inner);
        Client { inner }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.borrow().is_some()
    }
}

impl ClientInner {
    fn connect(inner: &Rc<ClientInner>) {
        let resolved = inner
            .config
            .server_addr
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next());
        let Some(addr) = resolved else {
            warn!(target: "client", "cannot resolve '{}'", inner.config.server_addr);
            Self::schedule_reconnect(inner);
            return;
        };

        match TcpConnection::connect(&inner.lp, addr) {
            Ok(socket) => {
                info!(target: "client", "connected to {}", addr);
                let session = ClientSessionHandler::new(
                    &inner.lp,
                    inner.config.clone(),
                    socket,
                    Rc::clone(&inner.tunnel_factory),
                );
                let watch = {
                    let weak = Rc::downgrade(inner);
                    Action::once(&inner.lp, vec![session.did_end()], move || {
                        if let Some(inner) = weak.upgrade() {
                            info!(target: "client", "we are disconnected");
                            ClientInner::schedule_reconnect(&inner);
                        }
                    })
                };
                *inner.session.borrow_mut() = Some(session);
                *inner.end_watch.borrow_mut() = Some(watch);
            }
            Err(e) => {
                warn!(target: "client", "connect to {} failed: {}", addr, e);
                Self::schedule_reconnect(inner);
            }
        }
    }

    fn schedule_reconnect(inner: &Rc<ClientInner>) {
        inner.session.borrow_mut().take();
        inner.end_watch.borrow_mut().take();

        info!(target: "client", "will reconnect in {} ms", RECONNECT_DELAY.as_millis());
        let weak: Weak<ClientInner> = Rc::downgrade(inner);
        Trigger::perform_in(&inner.lp, RECONNECT_DELAY, move || {
            if let Some(inner) = weak.upgrade() {
                info!(target: "client", "reconnecting...");
                ClientInner::connect(&inner);
            }
        });
    }
}
