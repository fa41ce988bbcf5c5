//! Session lifecycle on both ends of the control channel: handshake,
//! address negotiation, data-pipe announcement and rotation, disconnect
//! propagation.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::config::{ClientConfig, ServerConfig};
use crate::crypto::{AeadEncryptor, Encryptor, PaddingEncryptor};
use crate::event::{Action, Cond, Condition, EventLoop, Timer};
use crate::net::socket::{TcpConnection, UdpChannel};
use crate::net::IpAddressPool;
use crate::tun::TunnelFactory;
use crate::tunnel::dispatcher::Dispatcher;
use crate::tunnel::messenger::Messenger;
use crate::tunnel::packet::Message;
use crate::tunnel::pipe::DataPipe;
use crate::tunnel::stats::TrafficStats;

pub const PROTOCOL_VERSION: u64 = 1;

pub const MSG_HELLO: &str = "hello";
pub const MSG_CONFIG: &str = "config";
pub const MSG_REJECT: &str = "reject";
pub const MSG_NEW_DATA_PIPE: &str = "new_data_pipe";
pub const MSG_DATA_PIPE_READY: &str = "data_pipe_ready";
pub const MSG_ROTATE: &str = "rotate";

/// Retired pipes stay alive this long past the rotation interval so
/// in-flight datagrams drain.
const ROTATION_GRACE: Duration = Duration::from_secs(5);
const QUOTA_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const CONTROL_KEY_INFO: &[u8] = b"control";

thread_local! {
    static NEXT_SESSION_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

/// The encryptor chain for the control channel. Both sides derive it from
/// the shared secret before any byte is exchanged.
pub fn control_chain(
    secret: &str,
    encryption: bool,
    padding_to: usize,
    initiator: bool,
) -> Vec<Box<dyn Encryptor>> {
    build_chain(secret, encryption, padding_to, CONTROL_KEY_INFO, initiator)
}

/// The per-pipe chain, keyed by the session seed and the pipe's sequence
/// number from the announcement message.
fn data_pipe_chain(
    secret: &str,
    encryption: bool,
    padding_to: usize,
    session_seed: u64,
    pipe_seq: u64,
    initiator: bool,
) -> Vec<Box<dyn Encryptor>> {
    let info = format!("pipe-{}-{}", session_seed, pipe_seq);
    build_chain(secret, encryption, padding_to, info.as_bytes(), initiator)
}

fn build_chain(
    secret: &str,
    encryption: bool,
    padding_to: usize,
    info: &[u8],
    initiator: bool,
) -> Vec<Box<dyn Encryptor>> {
    if !encryption {
        return Vec::new();
    }
    let mut chain: Vec<Box<dyn Encryptor>> = Vec::new();
    if padding_to > 0 {
        chain.push(Box::new(PaddingEncryptor::new(padding_to)));
    }
    let aead = AeadEncryptor::for_channel(secret, info, initiator)
        .expect("control key derivation cannot fail");
    chain.push(Box::new(aead));
    chain
}

fn pipe_lifetime(rotation_ms: u64) -> Option<Duration> {
    (rotation_ms > 0).then(|| Duration::from_millis(rotation_ms) + ROTATION_GRACE)
}

// ---------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------

/// Everything a server session needs from its surrounding server.
pub struct ServerContext {
    pub config: ServerConfig,
    pub pool: Rc<RefCell<IpAddressPool>>,
    pub tunnel_factory: TunnelFactory,
    pub server_ip: Ipv4Addr,
}

pub struct ServerSessionHandler {
    inner: Rc<ServerSessionInner>,
}

struct ServerSessionInner {
    id: u64,
    lp: EventLoop,
    ctx: Rc<ServerContext>,
    messenger: Messenger,
    stats: Rc<TrafficStats>,
    state: RefCell<ServerSessionState>,
    did_end: Condition,
    _end_watch: RefCell<Option<Action>>,
}

#[derive(Default)]
struct ServerSessionState {
    user: Option<String>,
    client_ip: Option<Ipv4Addr>,
    session_seed: u64,
    pipe_seq: u64,
    dispatcher: Option<Dispatcher>,
    _rotation: Option<(Rc<RefCell<Timer>>, Action)>,
    _quota_watch: Option<(Rc<RefCell<Timer>>, Action)>,
}

impl ServerSessionHandler {
    pub fn new(lp: &EventLoop, ctx: Rc<ServerContext>, socket: TcpConnection) -> ServerSessionHandler {
        let chain = control_chain(
            &ctx.config.secret,
            ctx.config.encryption,
            ctx.config.padding_to,
            false,
        );
        let messenger = Messenger::new(lp, socket, chain);

        let inner = Rc::new(ServerSessionInner {
            id: next_session_id(),
            lp: lp.clone(),
            ctx,
            messenger: messenger.clone(),
            stats: Rc::new(TrafficStats::default()),
            state: RefCell::new(ServerSessionState::default()),
            did_end: Condition::new(lp),
            _end_watch: RefCell::new(None),
        });

        messenger.register_handler(MSG_HELLO, {
            let weak = Rc::downgrade(&inner);
            move |msg: &Message| {
                let inner = weak.upgrade()?;
                ServerSessionInner::handle_hello(&inner, msg)
            }
        });

        messenger.register_handler(MSG_DATA_PIPE_READY, {
            let weak = Rc::downgrade(&inner);
            move |msg: &Message| {
                if let Some(inner) = weak.upgrade() {
                    let port = msg.body().and_then(|b| b.get("port").and_then(Value::as_u64));
                    debug!(target: "session", "session {}: client primed pipe on port {:?}",
                           inner.id, port);
                }
                None
            }
        });

        let end_watch = {
            let weak = Rc::downgrade(&inner);
            Action::once(lp, vec![messenger.did_disconnect()], move || {
                if let Some(inner) = weak.upgrade() {
                    ServerSessionInner::teardown(&inner);
                }
            })
        };
        *inner._end_watch.borrow_mut() = Some(end_watch);

        debug!(target: "session", "session {} waiting for hello", inner.id);
        ServerSessionHandler { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn did_end(&self) -> Cond {
        self.inner.did_end.cond()
    }

    pub fn client_ip(&self) -> Option<Ipv4Addr> {
        self.inner.state.borrow().client_ip
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.state.borrow().dispatcher.as_ref().map(|d| d.pipe_count()).unwrap_or(0)
    }
}

impl ServerSessionInner {
    fn handle_hello(inner: &Rc<ServerSessionInner>, msg: &Message) -> Option<Message> {
        if inner.state.borrow().client_ip.is_some() {
            warn!(target: "session", "session {}: duplicate hello", inner.id);
            inner.messenger.disconnect();
            return None;
        }

        let body = msg.body().unwrap_or(Value::Null);
        let version = body.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != PROTOCOL_VERSION {
            info!(target: "session", "session {}: rejected version {}", inner.id, version);
            return Some(reject("incompatible protocol version"));
        }

        let secret = body.get("secret").and_then(Value::as_str).unwrap_or("");
        if secret != inner.ctx.config.secret {
            info!(target: "session", "session {}: rejected bad secret", inner.id);
            return Some(reject("bad secret"));
        }

        let user = body.get("user").and_then(Value::as_str).map(str::to_string);
        if inner.ctx.config.authentication {
            let known = user
                .as_deref()
                .map(|u| inner.ctx.config.quotas.contains_key(u))
                .unwrap_or(false);
            if !known {
                info!(target: "session", "session {}: rejected unknown user {:?}", inner.id, user);
                return Some(reject("unknown user"));
            }
        }

        let static_ip = user
            .as_deref()
            .and_then(|u| inner.ctx.config.static_hosts.get(u).copied());
        let client_ip = match static_ip.or_else(|| inner.ctx.pool.borrow_mut().lease()) {
            Some(ip) => ip,
            None => {
                info!(target: "session", "session {}: address pool exhausted", inner.id);
                return Some(reject("address pool exhausted"));
            }
        };

        let tunnel = match (*inner.ctx.tunnel_factory)(inner.ctx.server_ip, client_ip) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(target: "session", "session {}: tunnel creation failed: {}", inner.id, e);
                inner.ctx.pool.borrow_mut().release(client_ip);
                return Some(reject("cannot create tunnel device"));
            }
        };

        let rotation_ms = inner.ctx.config.rotation_interval_secs * 1000;
        let session_seed: u64 = rand::random();
        {
            let mut state = inner.state.borrow_mut();
            state.user = user.clone();
            state.client_ip = Some(client_ip);
            state.session_seed = session_seed;
            state.dispatcher = Some(Dispatcher::new(&inner.lp, tunnel));
        }

        // The config reply must precede the first pipe announcement, so
        // both are pushed here in order instead of using the reply path.
        inner.messenger.send(Message::new(
            MSG_CONFIG,
            json!({
                "client_ip": client_ip.to_string(),
                "server_ip": inner.ctx.server_ip.to_string(),
                "subnet_prefix": inner.ctx.config.subnet.prefix(),
                "data_pipe_seed": session_seed,
                "rotation_interval_ms": rotation_ms,
                "encryption": inner.ctx.config.encryption,
                "padding_to": inner.ctx.config.padding_to,
            }),
        ));
        Self::open_data_pipe(inner, MSG_NEW_DATA_PIPE);
        Self::start_rotation(inner, rotation_ms);
        Self::start_quota_watch(inner);

        info!(target: "session", "session {}: assigned {} to user {:?}",
              inner.id, client_ip, user);
        None
    }

    /// Bind a fresh UDP pipe, hand it to the dispatcher, and announce it
    /// with `kind` (`new_data_pipe` initially, `rotate` on rollover).
    fn open_data_pipe(inner: &Rc<ServerSessionInner>, kind: &str) {
        let socket = match UdpChannel::bind(&inner.lp, 0) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(target: "session", "session {}: cannot bind data pipe: {}", inner.id, e);
                return;
            }
        };
        let port = socket.local_port();

        let mut state = inner.state.borrow_mut();
        if state.dispatcher.is_none() {
            return;
        }
        let seq = state.pipe_seq;
        state.pipe_seq += 1;
        let session_seed = state.session_seed;

        let config = &inner.ctx.config;
        let chain = data_pipe_chain(
            &config.secret,
            config.encryption,
            config.padding_to,
            session_seed,
            seq,
            false,
        );
        let rotation_ms = config.rotation_interval_secs * 1000;
        let pipe = DataPipe::server(
            &inner.lp,
            socket,
            chain,
            pipe_lifetime(rotation_ms),
            Rc::clone(&inner.stats),
        );
        state.dispatcher.as_ref().unwrap().add_data_pipe(pipe);
        drop(state);

        inner
            .messenger
            .send(Message::new(kind, json!({ "port": port, "seed": seq })));
        info!(target: "session", "session {}: announced data pipe on port {} ({})",
              inner.id, port, kind);
    }

    fn start_rotation(inner: &Rc<ServerSessionInner>, rotation_ms: u64) {
        if rotation_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(rotation_ms);
        let timer = Rc::new(RefCell::new(Timer::new(&inner.lp, interval)));
        let cond = timer.borrow().did_fire();
        let action = {
            let weak = Rc::downgrade(inner);
            let timer = Rc::clone(&timer);
            Action::new(&inner.lp, vec![cond], move || {
                timer.borrow_mut().extend(interval);
                if let Some(inner) = weak.upgrade() {
                    debug!(target: "session", "session {}: rotating data pipes", inner.id);
                    ServerSessionInner::open_data_pipe(&inner, MSG_ROTATE);
                }
            })
        };
        inner.state.borrow_mut()._rotation = Some((timer, action));
    }

    fn start_quota_watch(inner: &Rc<ServerSessionInner>) {
        let quota = {
            let state = inner.state.borrow();
            state
                .user
                .as_deref()
                .and_then(|u| inner.ctx.config.quotas.get(u).copied())
        };
        let Some(quota) = quota else {
            return;
        };

        let timer = Rc::new(RefCell::new(Timer::new(&inner.lp, QUOTA_CHECK_INTERVAL)));
        let cond = timer.borrow().did_fire();
        let action = {
            let weak = Rc::downgrade(inner);
            let timer = Rc::clone(&timer);
            Action::new(&inner.lp, vec![cond], move || {
                timer.borrow_mut().extend(QUOTA_CHECK_INTERVAL);
                if let Some(inner) = weak.upgrade() {
                    if inner.stats.total_bytes() > quota {
                        info!(target: "session", "session {}: quota of {} bytes exhausted",
                              inner.id, quota);
                        inner.messenger.disconnect();
                    }
                }
            })
        };
        inner.state.borrow_mut()._quota_watch = Some((timer, action));
    }

    fn teardown(inner: &Rc<ServerSessionInner>) {
        {
            let mut state = inner.state.borrow_mut();
            state.dispatcher = None;
            state._rotation = None;
            state._quota_watch = None;
            if let Some(ip) = state.client_ip.take() {
                // Static assignments were never leased; release is a no-op
                // for them.
                inner.ctx.pool.borrow_mut().release(ip);
            }
        }
        inner.did_end.fire();
        info!(target: "session", "session {} ended", inner.id);
    }
}

// ---------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------

pub struct ClientSessionHandler {
    inner: Rc<ClientSessionInner>,
}

struct ClientSessionInner {
    id: u64,
    lp: EventLoop,
    config: ClientConfig,
    server_host: IpAddr,
    messenger: Messenger,
    tunnel_factory: TunnelFactory,
    stats: Rc<TrafficStats>,
    state: RefCell<ClientSessionState>,
    did_end: Condition,
    _end_watch: RefCell<Option<Action>>,
}

#[derive(Default)]
struct ClientSessionState {
    negotiated: Option<Negotiated>,
    dispatcher: Option<Dispatcher>,
}

struct Negotiated {
    client_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
    session_seed: u64,
    rotation_ms: u64,
    encryption: bool,
    padding_to: usize,
}

impl ClientSessionHandler {
    pub fn new(
        lp: &EventLoop,
        config: ClientConfig,
        socket: TcpConnection,
        tunnel_factory: TunnelFactory,
    ) -> ClientSessionHandler {
        let server_host = socket
            .peer_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let chain = control_chain(&config.secret, config.encryption, config.padding_to, true);
        let messenger = Messenger::new(lp, socket, chain);

        let inner = Rc::new(ClientSessionInner {
            id: next_session_id(),
            lp: lp.clone(),
            config,
            server_host,
            messenger: messenger.clone(),
            tunnel_factory,
            stats: Rc::new(TrafficStats::default()),
            state: RefCell::new(ClientSessionState::default()),
            did_end: Condition::new(lp),
            _end_watch: RefCell::new(None),
        });

        messenger.register_handler(MSG_CONFIG, {
            let weak = Rc::downgrade(&inner);
            move |msg: &Message| {
                let inner = weak.upgrade()?;
                ClientSessionInner::handle_config(&inner, msg);
                None
            }
        });

        messenger.register_handler(MSG_REJECT, {
            let weak = Rc::downgrade(&inner);
            move |msg: &Message| {
                if let Some(inner) = weak.upgrade() {
                    let reason = msg
                        .body()
                        .and_then(|b| b.get("reason").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_else(|| "unspecified".to_string());
                    warn!(target: "session", "server rejected session: {}", reason);
                    inner.messenger.disconnect();
                }
                None
            }
        });

        for kind in [MSG_NEW_DATA_PIPE, MSG_ROTATE] {
            messenger.register_handler(kind, {
                let weak = Rc::downgrade(&inner);
                move |msg: &Message| {
                    let inner = weak.upgrade()?;
                    ClientSessionInner::handle_pipe_announcement(&inner, msg)
                }
            });
        }

        let end_watch = {
            let weak = Rc::downgrade(&inner);
            Action::once(lp, vec![messenger.did_disconnect()], move || {
                if let Some(inner) = weak.upgrade() {
                    ClientSessionInner::teardown(&inner);
                }
            })
        };
        *inner._end_watch.borrow_mut() = Some(end_watch);

        // Open the conversation.
        messenger.send(Message::new(
            MSG_HELLO,
            json!({
                "version": PROTOCOL_VERSION,
                "secret": inner.config.secret,
                "user": inner.config.user,
            }),
        ));

        ClientSessionHandler { inner }
    }

    pub fn did_end(&self) -> Cond {
        self.inner.did_end.cond()
    }

    pub fn client_ip(&self) -> Option<Ipv4Addr> {
        self.inner.state.borrow().negotiated.as_ref().map(|n| n.client_ip)
    }

    pub fn is_established(&self) -> bool {
        self.inner.state.borrow().dispatcher.is_some()
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.state.borrow().dispatcher.as_ref().map(|d| d.pipe_count()).unwrap_or(0)
    }
}

impl ClientSessionInner {
    fn handle_config(inner: &Rc<ClientSessionInner>, msg: &Message) {
        if inner.state.borrow().negotiated.is_some() {
            warn!(target: "session", "duplicate config from server");
            inner.messenger.disconnect();
            return;
        }

        let body = msg.body().unwrap_or(Value::Null);
        let parsed = (|| -> Option<Negotiated> {
            Some(Negotiated {
                client_ip: body.get("client_ip")?.as_str()?.parse().ok()?,
                server_ip: body.get("server_ip")?.as_str()?.parse().ok()?,
                session_seed: body.get("data_pipe_seed")?.as_u64()?,
                rotation_ms: body.get("rotation_interval_ms")?.as_u64()?,
                encryption: body.get("encryption")?.as_bool()?,
                padding_to: body.get("padding_to")?.as_u64()? as usize,
            })
        })();
        let Some(negotiated) = parsed else {
            warn!(target: "session", "malformed config from server");
            inner.messenger.disconnect();
            return;
        };

        let tunnel =
            match (*inner.tunnel_factory)(negotiated.client_ip, negotiated.server_ip) {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    warn!(target: "session", "tunnel creation failed: {}", e);
                    inner.messenger.disconnect();
                    return;
                }
            };

        info!(target: "session", "configured: {} -> {} (rotation {} ms)",
              negotiated.client_ip, negotiated.server_ip, negotiated.rotation_ms);
        let mut state = inner.state.borrow_mut();
        state.dispatcher = Some(Dispatcher::new(&inner.lp, tunnel));
        state.negotiated = Some(negotiated);
    }

    fn handle_pipe_announcement(inner: &Rc<ClientSessionInner>, msg: &Message) -> Option<Message> {
        let body = msg.body().unwrap_or(Value::Null);
        let port = body.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
        let seq = body.get("seed").and_then(Value::as_u64);
        let state = inner.state.borrow();
        let (Some(negotiated), Some(dispatcher), Some(seq), true) = (
            state.negotiated.as_ref(),
            state.dispatcher.as_ref(),
            seq,
            port != 0,
        ) else {
            drop(state);
            warn!(target: "session", "data pipe announced before config; disconnecting");
            inner.messenger.disconnect();
            return None;
        };

        let peer = SocketAddr::new(inner.server_host, port);
        let socket = match UdpChannel::open(&inner.lp, peer) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(target: "session", "cannot open data pipe to {}: {}", peer, e);
                return None;
            }
        };
        let chain = data_pipe_chain(
            &inner.config.secret,
            negotiated.encryption,
            negotiated.padding_to,
            negotiated.session_seed,
            seq,
            true,
        );
        let pipe = DataPipe::client(
            &inner.lp,
            socket,
            chain,
            pipe_lifetime(negotiated.rotation_ms),
            Rc::clone(&inner.stats),
        );
        dispatcher.add_data_pipe(pipe);
        info!(target: "session", "opened data pipe to {}", peer);

        Some(Message::new(MSG_DATA_PIPE_READY, json!({ "port": port })))
    }

    fn teardown(inner: &Rc<ClientSessionInner>) {
        {
            let mut state = inner.state.borrow_mut();
            state.dispatcher = None;
            state.negotiated = None;
        }
        inner.did_end.fire();
        info!(target: "session", "session {} ended", inner.id);
    }
}

fn reject(reason: &str) -> Message {
    Message::new(MSG_REJECT, json!({ "reason": reason }))
}
