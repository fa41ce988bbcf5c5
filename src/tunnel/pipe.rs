//! One UDP leg of the multiplexed data plane.
//!
//! A pipe owns its socket, bounded inbound/outbound queues, and a per-pipe
//! encryptor chain. Client pipes know the peer address up front and are
//! primed immediately; server pipes bind an announced port and become
//! primed once the peer's primer datagram arrives, which also reveals the
//! peer's NAT-mapped address.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::crypto::{self, Encryptor};
use crate::event::{Action, Cond, Condition, EventLoop, Fifo, Timer};
use crate::net::socket::UdpChannel;
use crate::tunnel::packet::Packet;
use crate::tunnel::stats::TrafficStats;

/// Reserved 64-bit value a primer datagram carries; never produced by the
/// AEAD framing (nonces count up from zero).
pub const PRIMER_MAGIC: u64 = 0x9E2A_11C7_55D0_3FB8;

pub const PRIMER_INTERVAL: Duration = Duration::from_millis(500);
const PIPE_QUEUE_SIZE: usize = 32;

thread_local! {
    static NEXT_PIPE_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_pipe_id() -> u64 {
    NEXT_PIPE_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

struct PipeIo {
    socket: UdpChannel,
    encryptors: Vec<Box<dyn Encryptor>>,
}

/// Sends the priming magic to the peer until dropped. Doubles as a NAT
/// keepalive for the pipe's lifetime.
pub struct UdpPrimer {
    _timer: Rc<RefCell<Timer>>,
    _action: Action,
}

impl UdpPrimer {
    pub fn new(lp: &EventLoop, outbound: &Fifo<Packet>) -> UdpPrimer {
        let timer = Rc::new(RefCell::new(Timer::new(lp, Duration::ZERO)));
        let cond = timer.borrow().did_fire();
        let action = {
            let outbound = outbound.clone();
            let timer = Rc::clone(&timer);
            Action::new(lp, vec![cond, outbound.can_push()], move || {
                let mut packet = Packet::data();
                packet.pack_u64(PRIMER_MAGIC);
                outbound.push(packet);
                timer.borrow_mut().extend(PRIMER_INTERVAL);
            })
        };
        UdpPrimer { _timer: timer, _action: action }
    }
}

/// Watches for the priming magic on the receive path and fires
/// `did_finish` the first time it is observed.
pub struct UdpPrimerAcceptor {
    did_finish: Rc<Condition>,
}

impl UdpPrimerAcceptor {
    pub fn new(lp: &EventLoop) -> UdpPrimerAcceptor {
        UdpPrimerAcceptor { did_finish: Rc::new(Condition::new(lp)) }
    }

    pub fn did_finish(&self) -> Cond {
        self.did_finish.cond()
    }

    fn observer(&self) -> Rc<Condition> {
        Rc::clone(&self.did_finish)
    }
}

/// A UDP-backed bidirectional carrier with its own queues, encryptor
/// chain, priming state, and optional rotation deadline.
pub struct DataPipe {
    id: u64,
    pub inbound: Fifo<Packet>,
    pub outbound: Fifo<Packet>,
    local_port: u16,
    is_primed: Rc<Condition>,
    did_close: Rc<Condition>,
    _sender: Action,
    _receiver: Action,
    _primer: Option<UdpPrimer>,
    _acceptor: Option<UdpPrimerAcceptor>,
    _primed_watch: Option<Action>,
    _lifetime: Option<(Timer, Action)>,
}

impl DataPipe {
    /// A pipe whose socket is already connected to the peer (client side):
    /// primed from the start, and runs a primer toward the peer.
    pub fn client(
        lp: &EventLoop,
        socket: UdpChannel,
        encryptors: Vec<Box<dyn Encryptor>>,
        lifetime: Option<Duration>,
        stats: Rc<TrafficStats>,
    ) -> DataPipe {
        Self::build(lp, socket, encryptors, lifetime, stats, true)
    }

    /// A pipe on a freshly bound socket (server side): unprimed until the
    /// peer's primer magic arrives.
    pub fn server(
        lp: &EventLoop,
        socket: UdpChannel,
        encryptors: Vec<Box<dyn Encryptor>>,
        lifetime: Option<Duration>,
        stats: Rc<TrafficStats>,
    ) -> DataPipe {
        Self::build(lp, socket, encryptors, lifetime, stats, false)
    }

    fn build(
        lp: &EventLoop,
        socket: UdpChannel,
        encryptors: Vec<Box<dyn Encryptor>>,
        lifetime: Option<Duration>,
        stats: Rc<TrafficStats>,
        connected_side: bool,
    ) -> DataPipe {
        let id = next_pipe_id();
        let inbound = Fifo::new(lp, PIPE_QUEUE_SIZE);
        let outbound = Fifo::new(lp, PIPE_QUEUE_SIZE);
        let local_port = socket.local_port();
        let can_read = socket.can_read();
        let can_write = socket.can_write();

        let is_primed = Rc::new(if connected_side {
            Condition::fired(lp)
        } else {
            Condition::new(lp)
        });
        let did_close = Rc::new(Condition::new(lp));
        let io = Rc::new(RefCell::new(PipeIo { socket, encryptors }));

        let (primer, acceptor, primed_watch) = if connected_side {
            (Some(UdpPrimer::new(lp, &outbound)), None, None)
        } else {
            let acceptor = UdpPrimerAcceptor::new(lp);
            let watch = {
                let is_primed = Rc::clone(&is_primed);
                Action::once(lp, vec![acceptor.did_finish()], move || {
                    is_primed.fire();
                    info!(target: "pipe", "data pipe primed by peer");
                })
            };
            (None, Some(acceptor), Some(watch))
        };
        let magic_seen = acceptor.as_ref().map(|a| a.observer());

        let sender = {
            let io = Rc::clone(&io);
            let outbound = outbound.clone();
            let did_close = Rc::clone(&did_close);
            let stats = Rc::clone(&stats);
            Action::new(lp, vec![can_write, outbound.can_pop()], move || {
                let mut packet = outbound.pop();
                let mut io = io.borrow_mut();
                if !io.socket.is_connected() {
                    // Unprimed server pipe: the peer address is unknown
                    // until its primer arrives.
                    trace!(target: "pipe", "dropping outbound packet on unprimed pipe");
                    return;
                }
                let plain_len = packet.len();
                let wire_len = if plain_len == 8 && packet.unpack_u64() == Some(PRIMER_MAGIC) {
                    // Priming datagrams travel below the encryption layer.
                    plain_len
                } else {
                    match crypto::encrypt_chain(&mut io.encryptors, packet.buffer_mut(), plain_len)
                    {
                        Ok(len) => len,
                        Err(e) => {
                            warn!(target: "pipe", "outbound encryption failed: {}", e);
                            return;
                        }
                    }
                };
                packet.set_len(wire_len);
                match io.socket.send(packet.as_slice()) {
                    Ok(true) => stats.record_sent(wire_len),
                    Ok(false) => trace!(target: "pipe", "datagram not sent; dropping"),
                    Err(e) => {
                        drop(io);
                        warn!(target: "pipe", "socket failed while sending: {}", e);
                        did_close.fire();
                    }
                }
            })
        };

        let receiver = {
            let io = Rc::clone(&io);
            let inbound = inbound.clone();
            let did_close = Rc::clone(&did_close);
            let stats = Rc::clone(&stats);
            Action::new(lp, vec![can_read, inbound.can_push()], move || {
                let mut io = io.borrow_mut();
                let mut packet = Packet::data();
                let (size, source) = match io.socket.recv_from(packet.buffer_mut()) {
                    Ok(Some(pair)) => pair,
                    Ok(None) => return,
                    Err(e) => {
                        drop(io);
                        warn!(target: "pipe", "socket failed while receiving: {}", e);
                        did_close.fire();
                        return;
                    }
                };
                packet.set_len(size);

                if size == 8 && packet.unpack_u64() == Some(PRIMER_MAGIC) {
                    if !io.socket.is_connected() {
                        if let Err(e) = io.socket.connect(source) {
                            warn!(target: "pipe", "cannot lock pipe to {}: {}", source, e);
                            return;
                        }
                    }
                    if let Some(observed) = &magic_seen {
                        observed.fire();
                    }
                    return;
                }

                match crypto::decrypt_chain(&mut io.encryptors, packet.buffer_mut(), size) {
                    Ok(len) => {
                        packet.set_len(len);
                        stats.record_received(len);
                        inbound.push(packet);
                    }
                    Err(e) => {
                        debug!(target: "pipe", "dropping undecryptable datagram: {}", e);
                    }
                }
            })
        };

        let lifetime = lifetime.map(|ttl| {
            let timer = Timer::new(lp, ttl);
            let expiry = {
                let did_close = Rc::clone(&did_close);
                Action::once(lp, vec![timer.did_fire()], move || {
                    debug!(target: "pipe", "data pipe lifetime elapsed");
                    did_close.fire();
                })
            };
            (timer, expiry)
        });

        DataPipe {
            id,
            inbound,
            outbound,
            local_port,
            is_primed,
            did_close,
            _sender: sender,
            _receiver: receiver,
            _primer: primer,
            _acceptor: acceptor,
            _primed_watch: primed_watch,
            _lifetime: lifetime,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Set once the peer has acknowledged the UDP path.
    pub fn is_primed(&self) -> Cond {
        self.is_primed.cond()
    }

    pub fn did_close(&self) -> Cond {
        self.did_close.cond()
    }

    /// Retire the pipe; its owner's close trigger removes it.
    pub fn close(&self) {
        self.did_close.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AeadEncryptor;
    use std::time::Instant;

    fn chain(label: &str, initiator: bool) -> Vec<Box<dyn Encryptor>> {
        let aead = AeadEncryptor::for_channel("secret", label.as_bytes(), initiator).unwrap();
        vec![Box::new(aead) as Box<dyn Encryptor>]
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
    fn primer_magic_primes_the_server_pipe() {
        let lp = EventLoop::new();
        let stats = Rc::new(TrafficStats::default());

        let server_socket = UdpChannel::bind(&lp, 0).unwrap();
        let port = server_socket.local_port();
        let server_pipe =
            DataPipe::server(&lp, server_socket, chain("p", false), None, Rc::clone(&stats));
        assert!(!lp.eval(server_pipe.is_primed()));

        let client_socket =
            UdpChannel::open(&lp, format!("127.0.0.1:{}", port).parse().unwrap()).unwrap();
        let client_pipe =
            DataPipe::client(&lp, client_socket, chain("p", true), None, Rc::clone(&stats));
        assert!(lp.eval(client_pipe.is_primed()));

        assert!(run_until(&lp, Duration::from_secs(3), || lp.eval(server_pipe.is_primed())));
    }

    #[test]
    fn data_flows_encrypted_between_pipes() {
        let lp = EventLoop::new();
        let stats = Rc::new(TrafficStats::default());

        let server_socket = UdpChannel::bind(&lp, 0).unwrap();
        let port = server_socket.local_port();
        let server_pipe =
            DataPipe::server(&lp, server_socket, chain("q", false), None, Rc::clone(&stats));
        let client_socket =
            UdpChannel::open(&lp, format!("127.0.0.1:{}", port).parse().unwrap()).unwrap();
        let client_pipe =
            DataPipe::client(&lp, client_socket, chain("q", true), None, Rc::clone(&stats));

        assert!(run_until(&lp, Duration::from_secs(3), || lp.eval(server_pipe.is_primed())));

        let mut packet = Packet::data();
        packet.fill(b"an ip packet");
        client_pipe.outbound.push(packet);

        assert!(run_until(&lp, Duration::from_secs(3), || !server_pipe.inbound.is_empty()));
        let received = server_pipe.inbound.pop();
        assert_eq!(received.as_slice(), b"an ip packet");
        assert!(stats.bytes_received.get() > 0);
    }

    #[test]
    fn lifetime_expiry_fires_did_close() {
        let lp = EventLoop::new();
        let stats = Rc::new(TrafficStats::default());
        let socket = UdpChannel::open(&lp, "127.0.0.1:9".parse().unwrap()).unwrap();
        let pipe = DataPipe::client(
            &lp,
            socket,
            Vec::new(),
            Some(Duration::from_millis(50)),
            stats,
        );

        assert!(!lp.eval(pipe.did_close()));
        assert!(run_until(&lp, Duration::from_secs(2), || lp.eval(pipe.did_close())));
    }
}
