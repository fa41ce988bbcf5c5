//! End-to-end session tests over localhost: handshake, addressing, pipe
//! priming, two-way packet flow, disconnect propagation, and reconnect.
//!
//! A datagram socketpair stands in for each TUN device so no elevated
//! privileges are needed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;
use std::time::{Duration, Instant};

use stun::client::{Client, RECONNECT_DELAY};
use stun::config::{ClientConfig, ServerConfig};
use stun::event::EventLoop;
use stun::net::socket::TcpConnection;
use stun::net::IpAddressPool;
use stun::tun::{Tunnel, TunnelFactory};
use stun::tunnel::session::{ClientSessionHandler, ServerContext, ServerSessionHandler};

const SECRET: &str = "integration-secret";

fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        subnet: "10.77.0.0/24".parse().unwrap(),
        secret: SECRET.to_string(),
        encryption: true,
        padding_to: 0,
        rotation_interval_secs: 60,
        authentication: false,
        quotas: HashMap::new(),
        static_hosts: HashMap::new(),
        tunnel_prefix: "stun".to_string(),
        mtu: 1280,
    }
}

fn client_config(server_addr: &str) -> ClientConfig {
    ClientConfig {
        server_addr: server_addr.to_string(),
        secret: SECRET.to_string(),
        user: None,
        encryption: true,
        padding_to: 0,
        tunnel_prefix: "stun".to_string(),
        mtu: 1280,
    }
}

/// A tunnel factory backed by datagram socketpairs; the "kernel" ends are
/// collected for the test to inject and observe packets.
fn test_factory(lp: &EventLoop) -> (TunnelFactory, Rc<RefCell<Vec<UnixDatagram>>>) {
    let kernel_ends: Rc<RefCell<Vec<UnixDatagram>>> = Rc::new(RefCell::new(Vec::new()));
    let factory: TunnelFactory = {
        let lp = lp.clone();
        let kernel_ends = kernel_ends.clone();
        Rc::new(move |_local, _peer| {
            let (ours, kernel) = UnixDatagram::pair().unwrap();
            kernel.set_nonblocking(true).unwrap();
            kernel_ends.borrow_mut().push(kernel);
            Tunnel::from_fd(&lp, ours.into())
        })
    };
    (factory, kernel_ends)
}

fn server_context(lp: &EventLoop, config: ServerConfig) -> (Rc<ServerContext>, Rc<RefCell<Vec<UnixDatagram>>>) {
    let server_ip = config.subnet.nth(1).unwrap();
    let mut pool = IpAddressPool::new(config.subnet);
    pool.reserve(server_ip);
    let (factory, kernels) = test_factory(lp);
    let ctx = Rc::new(ServerContext {
        config,
        pool: Rc::new(RefCell::new(pool)),
        tunnel_factory: factory,
        server_ip,
    });
    (ctx, kernels)
}

fn control_pair(lp: &EventLoop) -> (TcpConnection, TcpConnection) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (
        TcpConnection::from_std(lp, client).unwrap(),
        TcpConnection::from_std(lp, server).unwrap(),
    )
}

fn run_until(lp: &EventLoop, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        lp.tick();
    }
    done()
}

#[test]
fn handshake_assigns_first_pool_address_and_carries_traffic() {
    let lp = EventLoop::new();
    let (ctx, server_kernels) = server_context(&lp, server_config());
    let (client_factory, client_kernels) = test_factory(&lp);

    let (client_sock, server_sock) = control_pair(&lp);
    let server_session = ServerSessionHandler::new(&lp, ctx, server_sock);
    let client_session = ClientSessionHandler::new(
        &lp,
        client_config("127.0.0.1:0"),
        client_sock,
        client_factory,
    );

    // Handshake: config arrives, the tunnel comes up, one pipe on each side.
    assert!(run_until(&lp, Duration::from_secs(5), || {
        client_session.is_established()
            && client_session.pipe_count() >= 1
            && server_session.pipe_count() >= 1
    }));
    assert_eq!(client_session.client_ip(), Some("10.77.0.2".parse().unwrap()));
    assert_eq!(server_session.client_ip(), Some("10.77.0.2".parse().unwrap()));

    // Client-to-server packet flow.
    client_kernels.borrow()[0].send(b"ping-from-client").unwrap();
    let mut buf = [0u8; 2048];
    assert!(run_until(&lp, Duration::from_secs(5), || {
        match server_kernels.borrow()[0].recv(&mut buf) {
            Ok(n) => {
                assert_eq!(&buf[..n], b"ping-from-client");
                true
            }
            Err(_) => false,
        }
    }));

    // Server-to-client needs the server pipe primed by the client's
    // primer magic first.
    server_kernels.borrow()[0].send(b"pong-from-server").unwrap();
    assert!(run_until(&lp, Duration::from_secs(5), || {
        match client_kernels.borrow()[0].recv(&mut buf) {
            Ok(n) => {
                assert_eq!(&buf[..n], b"pong-from-server");
                true
            }
            Err(_) => false,
        }
    }));
}

#[test]
fn unknown_user_is_rejected_when_authentication_is_on() {
    let lp = EventLoop::new();
    let mut config = server_config();
    config.authentication = true;
    let (ctx, _server_kernels) = server_context(&lp, config);
    let pool = Rc::clone(&ctx.pool);
    let (client_factory, _client_kernels) = test_factory(&lp);

    let (client_sock, server_sock) = control_pair(&lp);
    let _server_session = ServerSessionHandler::new(&lp, ctx, server_sock);
    let client_session = ClientSessionHandler::new(
        &lp,
        client_config("127.0.0.1:0"),
        client_sock,
        client_factory,
    );

    let ended = client_session.did_end();
    assert!(run_until(&lp, Duration::from_secs(5), || lp.eval(ended)));
    assert!(!client_session.is_established());
    assert_eq!(pool.borrow().leased_count(), 0);
}

#[test]
fn wrong_secret_never_establishes() {
    let lp = EventLoop::new();
    let (ctx, _server_kernels) = server_context(&lp, server_config());
    let (client_factory, _client_kernels) = test_factory(&lp);

    let (client_sock, server_sock) = control_pair(&lp);
    let _server_session = ServerSessionHandler::new(&lp, ctx, server_sock);
    let mut bad_config = client_config("127.0.0.1:0");
    bad_config.secret = "wrong".to_string();
    let client_session =
        ClientSessionHandler::new(&lp, bad_config, client_sock, client_factory);

    // Neither side can read the other; the first undecryptable frame
    // disconnects.
    let ended = client_session.did_end();
    assert!(run_until(&lp, Duration::from_secs(5), || lp.eval(ended)));
    assert!(!client_session.is_established());
}

#[test]
fn server_loss_tears_down_the_client_session() {
    let lp = EventLoop::new();
    let (ctx, _server_kernels) = server_context(&lp, server_config());
    let pool = Rc::clone(&ctx.pool);
    let (client_factory, _client_kernels) = test_factory(&lp);

    let (client_sock, server_sock) = control_pair(&lp);
    let server_session = ServerSessionHandler::new(&lp, ctx, server_sock);
    let client_session = ClientSessionHandler::new(
        &lp,
        client_config("127.0.0.1:0"),
        client_sock,
        client_factory,
    );

    assert!(run_until(&lp, Duration::from_secs(5), || client_session.is_established()));
    assert_eq!(pool.borrow().leased_count(), 1);

    // Kill the server mid-session: its socket closes, the client's
    // messenger notices, and the session ends.
    drop(server_session);
    let ended = client_session.did_end();
    assert!(run_until(&lp, Duration::from_secs(5), || lp.eval(ended)));
    assert!(!client_session.is_established());
}

#[test]
fn client_shell_reconnects_after_fixed_delay() {
    let lp = EventLoop::new();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let (factory, _kernels) = test_factory(&lp);
    let _client = Client::new(&lp, client_config(&addr.to_string()), factory);

    // Accept and immediately drop the first connection.
    let first = Instant::now();
    assert!(run_until(&lp, Duration::from_secs(5), || {
        matches!(listener.accept(), Ok(_))
    }));

    // The dropped socket ends the session; the shell retries after the
    // fixed delay.
    let reconnected = run_until(&lp, RECONNECT_DELAY + Duration::from_secs(4), || {
        matches!(listener.accept(), Ok(_))
    });
    assert!(reconnected);
    assert!(first.elapsed() >= RECONNECT_DELAY);
}
