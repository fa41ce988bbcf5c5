//! Framed, encrypted control channel with heartbeat liveness.
//!
//! Wire format: `u32_le length || ciphertext(JSON {type, body})`. The
//! transporter's sender and receiver actions move messages between the
//! outbound FIFO and the socket; the receiver's dependence on
//! `outbound.can_push()` guarantees a handler can always enqueue its
//! reply without deadlocking. The heartbeater beats every second and
//! disconnects after ten silent ones.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, trace, warn};
use serde_json::{json, Value};

use crate::crypto::{self, Encryptor};
use crate::event::{Action, Cond, Condition, EventLoop, Fifo, Timer};
use crate::net::socket::{SocketError, TcpConnection};
use crate::tunnel::packet::{Message, MESSAGE_SIZE};
use crate::tunnel::stats::AvgStat;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(10_000);

const HEARTBEAT: &str = "heartbeat";
const HEARTBEAT_REPLY: &str = "heartbeat_reply";

const OUTBOUND_QUEUE_SIZE: usize = 32;
const RECEIVE_BUFFER_SIZE: usize = 8192;
const LENGTH_HEADER_SIZE: usize = 4;

/// Per-type message handler; the returned message, if any, is sent back.
pub type Handler = Box<dyn FnMut(&Message) -> Option<Message>>;

/// Framed message channel over a connected TCP socket.
///
/// Cheap to clone; all clones drive the same channel.
#[derive(Clone)]
pub struct Messenger {
    inner: Rc<MessengerInner>,
}

struct MessengerInner {
    lp: EventLoop,
    outbound: Fifo<Message>,
    handlers: RefCell<HashMap<String, Handler>>,
    transporter: RefCell<Option<Transporter>>,
    heartbeater: RefCell<Option<Heartbeater>>,
    did_disconnect: Condition,
    disconnected: Cell<bool>,
    rtt: AvgStat,
}

impl Messenger {
    pub fn new(
        lp: &EventLoop,
        socket: TcpConnection,
        encryptors: Vec<Box<dyn Encryptor>>,
    ) -> Messenger {
        Self::with_heartbeat(lp, socket, encryptors, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT)
    }

    /// As [`new`](Self::new) with explicit heartbeat timing.
    pub fn with_heartbeat(
        lp: &EventLoop,
        socket: TcpConnection,
        encryptors: Vec<Box<dyn Encryptor>>,
        beat_interval: Duration,
        beat_timeout: Duration,
    ) -> Messenger {
        let inner = Rc::new(MessengerInner {
            lp: lp.clone(),
            outbound: Fifo::new(lp, OUTBOUND_QUEUE_SIZE),
            handlers: RefCell::new(HashMap::new()),
            transporter: RefCell::new(None),
            heartbeater: RefCell::new(None),
            did_disconnect: Condition::new(lp),
            disconnected: Cell::new(false),
            rtt: AvgStat::new("rtt"),
        });
        let messenger = Messenger { inner };
        let transporter = Transporter::new(&messenger, socket, encryptors);
        *messenger.inner.transporter.borrow_mut() = Some(transporter);
        let heartbeater = Heartbeater::new(&messenger, beat_interval, beat_timeout);
        *messenger.inner.heartbeater.borrow_mut() = Some(heartbeater);
        messenger
    }

    /// True while the outbound queue accepts another message.
    pub fn can_send(&self) -> Cond {
        self.inner.outbound.can_push()
    }

    /// Enqueue a message. Callers gate on [`can_send`](Self::can_send);
    /// pushing into a full queue is a programmer error.
    pub fn send(&self, message: Message) {
        if let Some(kind) = message.kind() {
            trace!(target: "messenger", "sending: {}", kind);
        }
        self.inner.outbound.push(message);
    }

    /// Register the handler for a message type. Registering a duplicate
    /// type is a programming error.
    pub fn register_handler(
        &self,
        kind: &str,
        handler: impl FnMut(&Message) -> Option<Message> + 'static,
    ) {
        let previous = self
            .inner
            .handlers
            .borrow_mut()
            .insert(kind.to_string(), Box::new(handler));
        assert!(previous.is_none(), "duplicate handler registered for message type {}", kind);
    }

    pub fn did_disconnect(&self) -> Cond {
        self.inner.did_disconnect.cond()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.get()
    }

    /// Tear down the transporter and heartbeater and fire
    /// `did_disconnect` exactly once.
    pub fn disconnect(&self) {
        disconnect_inner(&self.inner);
    }

    pub fn rtt_average_ms(&self) -> Option<f64> {
        self.inner.rtt.average()
    }

    pub fn rtt_samples(&self) -> u64 {
        self.inner.rtt.count()
    }
}

fn disconnect_inner(inner: &Rc<MessengerInner>) {
    if inner.disconnected.replace(true) {
        return;
    }
    inner.transporter.borrow_mut().take();
    inner.heartbeater.borrow_mut().take();
    // Handler closures hold component state (timers, session pieces);
    // clearing them here breaks the reference cycle back to the session.
    inner.handlers.borrow_mut().clear();
    inner.did_disconnect.fire();
    debug!(target: "messenger", "channel torn down");
}

fn dispatch(inner: &Rc<MessengerInner>, message: &Message) {
    let Some((kind, _)) = message.parse() else {
        return;
    };
    trace!(target: "messenger", "received: {}", kind);

    // The handler runs with the registry unlocked so it may register
    // other types or disconnect the channel.
    let handler = inner.handlers.borrow_mut().remove(&kind);
    let Some(mut handler) = handler else {
        warn!(target: "messenger", "unknown message type '{}'", kind);
        disconnect_inner(inner);
        return;
    };
    let reply = handler(message);
    if !inner.disconnected.get() {
        inner.handlers.borrow_mut().entry(kind).or_insert(handler);
        if let Some(reply) = reply {
            inner.outbound.push(reply);
        }
    }
}

struct TransportState {
    socket: TcpConnection,
    encryptors: Vec<Box<dyn Encryptor>>,
    buffer: BytesMut,
}

/// Sender and receiver actions moving frames between the outbound FIFO
/// and the socket.
struct Transporter {
    _sender: Action,
    _receiver: Action,
}

impl Transporter {
    fn new(
        messenger: &Messenger,
        socket: TcpConnection,
        encryptors: Vec<Box<dyn Encryptor>>,
    ) -> Transporter {
        let lp = &messenger.inner.lp;
        let outbound = messenger.inner.outbound.clone();
        let can_read = socket.can_read();
        let can_write = socket.can_write();
        let state = Rc::new(RefCell::new(TransportState {
            socket,
            encryptors,
            buffer: BytesMut::with_capacity(RECEIVE_BUFFER_SIZE),
        }));

        let sender = {
            let weak = Rc::downgrade(&messenger.inner);
            let state = Rc::clone(&state);
            let outbound = outbound.clone();
            Action::new(lp, vec![can_write, outbound.can_pop()], move || {
                let Some(inner) = weak.upgrade() else { return };
                Self::do_send(&inner, &state, &outbound);
            })
        };

        let receiver = {
            let weak = Rc::downgrade(&messenger.inner);
            let state = Rc::clone(&state);
            Action::new(lp, vec![can_read, outbound.can_push()], move || {
                let Some(inner) = weak.upgrade() else { return };
                Self::do_receive(&inner, &state);
            })
        };

        Transporter { _sender: sender, _receiver: receiver }
    }

    fn do_send(
        inner: &Rc<MessengerInner>,
        state: &Rc<RefCell<TransportState>>,
        outbound: &Fifo<Message>,
    ) {
        let mut message = outbound.pop();

        let mut st = state.borrow_mut();
        let plain_len = message.len();
        let wire_len = match crypto::encrypt_chain(&mut st.encryptors, message.buffer_mut(), plain_len)
        {
            Ok(len) => len,
            Err(e) => {
                drop(st);
                warn!(target: "messenger", "outbound encryption failed: {}", e);
                disconnect_inner(inner);
                return;
            }
        };
        message.set_len(wire_len);

        let mut frame = BytesMut::with_capacity(LENGTH_HEADER_SIZE + wire_len);
        frame.put_u32_le(wire_len as u32);
        frame.put_slice(message.as_slice());

        match st.socket.write(&frame) {
            Ok(n) if n == frame.len() => {}
            Ok(_) => panic!("message frame fragmented on write"),
            Err(SocketError::Closed) => {
                drop(st);
                info!(target: "messenger", "peer closed the control channel while sending");
                disconnect_inner(inner);
            }
            Err(e) => {
                drop(st);
                warn!(target: "messenger", "send failed: {}", e);
                disconnect_inner(inner);
            }
        }
    }

    fn do_receive(inner: &Rc<MessengerInner>, state: &Rc<RefCell<TransportState>>) {
        let mut broken = false;
        let mut inbox: Vec<Message> = Vec::new();

        {
            let mut st = state.borrow_mut();
            let used = st.buffer.len();
            let room = RECEIVE_BUFFER_SIZE.saturating_sub(used);
            if room == 0 {
                warn!(target: "messenger", "receive buffer overflow");
                broken = true;
            } else {
                let mut chunk = [0u8; RECEIVE_BUFFER_SIZE];
                match st.socket.read(&mut chunk[..room]) {
                    Ok(0) => return,
                    Ok(n) => st.buffer.extend_from_slice(&chunk[..n]),
                    Err(SocketError::Closed) => {
                        info!(target: "messenger", "peer closed the control channel");
                        broken = true;
                    }
                    Err(e) => {
                        warn!(target: "messenger", "receive failed: {}", e);
                        broken = true;
                    }
                }
            }

            // Deliver every complete frame in the buffer.
            while !broken {
                if st.buffer.len() < LENGTH_HEADER_SIZE {
                    break;
                }
                let frame_len = u32::from_le_bytes(
                    st.buffer[..LENGTH_HEADER_SIZE].try_into().expect("4-byte slice"),
                ) as usize;
                if frame_len > MESSAGE_SIZE {
                    warn!(target: "messenger", "oversized frame of {} bytes", frame_len);
                    broken = true;
                    break;
                }
                if st.buffer.len() < LENGTH_HEADER_SIZE + frame_len {
                    break;
                }
                st.buffer.advance(LENGTH_HEADER_SIZE);
                let mut message = Message::empty();
                message.buffer_mut()[..frame_len].copy_from_slice(&st.buffer[..frame_len]);
                message.set_len(frame_len);
                st.buffer.advance(frame_len);

                match crypto::decrypt_chain(&mut st.encryptors, message.buffer_mut(), frame_len) {
                    Ok(len) => message.set_len(len),
                    Err(e) => {
                        warn!(target: "messenger", "cannot decrypt frame: {}", e);
                        broken = true;
                        break;
                    }
                }
                if !message.is_valid() {
                    info!(target: "messenger", "disconnecting on invalid message");
                    broken = true;
                    break;
                }
                inbox.push(message);
            }
        }

        if broken {
            disconnect_inner(inner);
            return;
        }
        for message in inbox {
            if inner.disconnected.get() {
                break;
            }
            dispatch(inner, &message);
        }
    }
}

/// Periodic liveness: beat every interval, reply to beats, give up after
/// the timeout.
struct Heartbeater {
    _beat_timer: Rc<RefCell<Timer>>,
    _missed_timer: Rc<RefCell<Timer>>,
    _beater: Action,
    _missed: Action,
}

impl Heartbeater {
    fn new(messenger: &Messenger, interval: Duration, timeout: Duration) -> Heartbeater {
        let lp = messenger.inner.lp.clone();
        let outbound = messenger.inner.outbound.clone();

        let beat_timer = Rc::new(RefCell::new(Timer::new(&lp, Duration::ZERO)));
        let beat_cond = beat_timer.borrow().did_fire();
        let beater = {
            let lp = lp.clone();
            let outbound = outbound.clone();
            let beat_timer = Rc::clone(&beat_timer);
            Action::new(&messenger.inner.lp, vec![beat_cond, outbound.can_push()], move || {
                outbound.push(Message::new(HEARTBEAT, json!({ "start": lp.now_ms() })));
                beat_timer.borrow_mut().extend(interval);
            })
        };

        let missed_timer = Rc::new(RefCell::new(Timer::new(&lp, timeout)));
        let missed_cond = missed_timer.borrow().did_fire();
        let missed = {
            let weak = Rc::downgrade(&messenger.inner);
            Action::once(&lp, vec![missed_cond], move || {
                info!(target: "messenger", "disconnected due to missed heartbeats");
                if let Some(inner) = weak.upgrade() {
                    disconnect_inner(&inner);
                }
            })
        };

        messenger.register_handler(HEARTBEAT, {
            let missed_timer = Rc::clone(&missed_timer);
            move |message: &Message| {
                missed_timer.borrow_mut().reset(timeout);
                Some(Message::new(HEARTBEAT_REPLY, message.body().unwrap_or(Value::Null)))
            }
        });

        messenger.register_handler(HEARTBEAT_REPLY, {
            let lp = lp.clone();
            let weak = Rc::downgrade(&messenger.inner);
            move |message: &Message| {
                if let Some(inner) = weak.upgrade() {
                    let start = message.body().and_then(|b| b.get("start").and_then(Value::as_u64));
                    if let Some(start) = start {
                        inner.rtt.accumulate(lp.now_ms().saturating_sub(start));
                    }
                }
                None
            }
        });

        Heartbeater {
            _beat_timer: beat_timer,
            _missed_timer: missed_timer,
            _beater: beater,
            _missed: missed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AeadEncryptor;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    /// A loop-driven connection on one end, a raw blocking stream on the
    /// other.
    fn loop_and_raw(lp: &EventLoop) -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (TcpConnection::from_std(lp, accepted).unwrap(), raw)
    }

    fn messenger_pair(lp: &EventLoop) -> (Messenger, Messenger) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            Messenger::new(lp, TcpConnection::from_std(lp, client).unwrap(), Vec::new()),
            Messenger::new(lp, TcpConnection::from_std(lp, server).unwrap(), Vec::new()),
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

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut framed = (payload.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(payload);
        framed
    }

    #[test]
    fn reassembles_frames_across_chunk_boundaries() {
        let lp = EventLoop::new();
        let (conn, mut raw) = loop_and_raw(&lp);
        let messenger = Messenger::new(&lp, conn, Vec::new());

        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        for kind in ["first", "second"] {
            let seen = seen.clone();
            messenger.register_handler(kind, move |msg: &Message| {
                seen.borrow_mut().push(msg.kind().unwrap());
                None
            });
        }

        let mut wire = frame(br#"{"type":"first","body":{}}"#);
        wire.extend_from_slice(&frame(br#"{"type":"second","body":{}}"#));

        // Fragment the stream: 3 bytes, 1 byte, then the rest, letting the
        // receiver chew on each partial prefix.
        raw.write_all(&wire[..3]).unwrap();
        raw.flush().unwrap();
        for _ in 0..5 {
            lp.tick();
        }
        assert!(seen.borrow().is_empty());
        raw.write_all(&wire[3..4]).unwrap();
        raw.flush().unwrap();
        for _ in 0..5 {
            lp.tick();
        }
        raw.write_all(&wire[4..]).unwrap();
        raw.flush().unwrap();

        assert!(run_until(&lp, Duration::from_secs(2), || seen.borrow().len() == 2));
        assert_eq!(*seen.borrow(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn handler_reply_is_written_back() {
        let lp = EventLoop::new();
        let (a, b) = messenger_pair(&lp);

        b.register_handler("echo", |msg: &Message| {
            Some(Message::new("echo_reply", msg.body().unwrap()))
        });

        let reply: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        {
            let reply = reply.clone();
            a.register_handler("echo_reply", move |msg: &Message| {
                *reply.borrow_mut() = msg.body();
                None
            });
        }

        a.send(Message::new("echo", json!({ "n": 42 })));
        assert!(run_until(&lp, Duration::from_secs(2), || reply.borrow().is_some()));
        assert_eq!(reply.borrow().as_ref().unwrap()["n"], 42);
    }

    #[test]
    fn encrypted_channel_delivers_messages() {
        let lp = EventLoop::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let a = Messenger::new(
            &lp,
            TcpConnection::from_std(&lp, client).unwrap(),
            vec![Box::new(AeadEncryptor::for_channel("shared", b"control", true).unwrap())],
        );
        let b = Messenger::new(
            &lp,
            TcpConnection::from_std(&lp, server).unwrap(),
            vec![Box::new(AeadEncryptor::for_channel("shared", b"control", false).unwrap())],
        );

        let got = Rc::new(Cell::new(false));
        {
            let got = got.clone();
            b.register_handler("ping", move |_| {
                got.set(true);
                None
            });
        }
        a.send(Message::new("ping", json!({})));
        assert!(run_until(&lp, Duration::from_secs(2), || got.get()));
        drop(a);
    }

    #[test]
    fn invalid_json_disconnects() {
        let lp = EventLoop::new();
        let (conn, mut raw) = loop_and_raw(&lp);
        let messenger = Messenger::new(&lp, conn, Vec::new());

        raw.write_all(&frame(b"not json at all")).unwrap();
        raw.flush().unwrap();

        let m = messenger.clone();
        assert!(run_until(&lp, Duration::from_secs(2), || m.is_disconnected()));
        assert!(lp.eval(messenger.did_disconnect()));
    }

    #[test]
    fn unknown_message_type_disconnects() {
        let lp = EventLoop::new();
        let (conn, mut raw) = loop_and_raw(&lp);
        let messenger = Messenger::new(&lp, conn, Vec::new());

        raw.write_all(&frame(br#"{"type":"mystery","body":{}}"#)).unwrap();
        raw.flush().unwrap();

        let m = messenger.clone();
        assert!(run_until(&lp, Duration::from_secs(2), || m.is_disconnected()));
    }

    #[test]
    fn peer_close_disconnects() {
        let lp = EventLoop::new();
        let (conn, raw) = loop_and_raw(&lp);
        let messenger = Messenger::new(&lp, conn, Vec::new());
        drop(raw);

        let m = messenger.clone();
        assert!(run_until(&lp, Duration::from_secs(2), || m.is_disconnected()));
    }

    #[test]
    fn missed_heartbeats_disconnect_with_zero_rtt_samples() {
        let lp = EventLoop::new();
        let (conn, raw) = loop_and_raw(&lp);
        // The raw peer never replies; keep it open so only the missed
        // timer can end the session.
        let messenger = Messenger::with_heartbeat(
            &lp,
            conn,
            Vec::new(),
            Duration::from_millis(20),
            Duration::from_millis(150),
        );

        let started = Instant::now();
        let m = messenger.clone();
        assert!(run_until(&lp, Duration::from_secs(5), || m.is_disconnected()));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(messenger.rtt_samples(), 0);
        drop(raw);
    }

    #[test]
    fn heartbeats_keep_the_channel_alive_and_record_rtt() {
        let lp = EventLoop::new();
        let (a, b) = messenger_pair(&lp);
        // Exchange heartbeats for a while: nobody disconnects and both
        // sides accumulate RTT samples from the replies.
        assert!(run_until(&lp, Duration::from_secs(4), || a.rtt_samples() >= 2));
        assert!(!a.is_disconnected());
        assert!(!b.is_disconnected());
        assert!(a.rtt_average_ms().is_some());
    }

    #[test]
    #[should_panic(expected = "duplicate handler registered")]
    fn duplicate_handler_registration_panics() {
        let lp = EventLoop::new();
        let (a, _b) = messenger_pair(&lp);
        a.register_handler("x", |_| None);
        a.register_handler("x", |_| None);
    }
}
