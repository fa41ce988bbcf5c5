//! Round-robin multiplexer between the tunnel device and the data pipes.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use crate::event::{Action, Condition, EventLoop};
use crate::tun::Tunnel;
use crate::tunnel::packet::Packet;
use crate::tunnel::pipe::DataPipe;

/// Load-balances tunnel packets across a dynamic, ordered set of pipes.
///
/// Sending starts the scan at a rotating index so primed pipes share the
/// offered load; receiving scans pipes in insertion order. Pipes remove
/// themselves when their `did_close` fires.
pub struct Dispatcher {
    lp: EventLoop,
    state: Rc<RefCell<DispatcherState>>,
    _can_send: Rc<Condition>,
    _can_receive: Rc<Condition>,
    _sender: Action,
    _receiver: Action,
}

struct DispatcherState {
    tunnel: Tunnel,
    pipes: Vec<DataPipe>,
    close_watchers: Vec<(u64, Action)>,
    current_index: usize,
}

impl Dispatcher {
    pub fn new(lp: &EventLoop, tunnel: Tunnel) -> Dispatcher {
        let tunnel_can_read = tunnel.can_read();
        let tunnel_can_write = tunnel.can_write();
        let state = Rc::new(RefCell::new(DispatcherState {
            tunnel,
            pipes: Vec::new(),
            close_watchers: Vec::new(),
            current_index: 0,
        }));

        // Some pipe is primed with room to take one more packet.
        let can_send = Rc::new(Condition::computed(lp, {
            let lp = lp.clone();
            let state = Rc::downgrade(&state);
            move || {
                let Some(state) = state.upgrade() else { return false };
                let st = state.borrow();
                st.pipes
                    .iter()
                    .any(|p| lp.eval(p.is_primed()) && lp.eval(p.outbound.can_push()))
            }
        }));

        // Some pipe holds a received packet.
        let can_receive = Rc::new(Condition::computed(lp, {
            let lp = lp.clone();
            let state = Rc::downgrade(&state);
            move || {
                let Some(state) = state.upgrade() else { return false };
                let st = state.borrow();
                st.pipes.iter().any(|p| lp.eval(p.inbound.can_pop()))
            }
        }));

        let sender = {
            let lp2 = lp.clone();
            let state = Rc::clone(&state);
            Action::new(lp, vec![tunnel_can_read, can_send.cond()], move || {
                Self::do_send(&lp2, &state);
            })
        };

        let receiver = {
            let lp2 = lp.clone();
            let state = Rc::clone(&state);
            Action::new(lp, vec![can_receive.cond(), tunnel_can_write], move || {
                Self::do_receive(&lp2, &state);
            })
        };

        Dispatcher {
            lp: lp.clone(),
            state,
            _can_send: can_send,
            _can_receive: can_receive,
            _sender: sender,
            _receiver: receiver,
        }
    }

    /// Take ownership of a pipe and arm its removal on close.
    pub fn add_data_pipe(&self, pipe: DataPipe) {
        let id = pipe.id();
        let did_close = pipe.did_close();
        let watcher = {
            let state = Rc::downgrade(&self.state);
            Action::once(&self.lp, vec![did_close], move || {
                let Some(state) = state.upgrade() else { return };
                let mut st = state.borrow_mut();
                let before = st.pipes.len();
                st.pipes.retain(|p| p.id() != id);
                assert!(st.pipes.len() < before, "cannot find the data pipe to remove");
                st.close_watchers.retain(|(watched, _)| *watched != id);
                info!(target: "dispatcher", "data pipe removed ({} remain)", st.pipes.len());
            })
        };

        let mut st = self.state.borrow_mut();
        debug!(target: "dispatcher", "data pipe added (port {})", pipe.local_port());
        st.pipes.push(pipe);
        st.close_watchers.push((id, watcher));
    }

    pub fn pipe_count(&self) -> usize {
        self.state.borrow().pipes.len()
    }

    fn do_send(lp: &EventLoop, state: &Rc<RefCell<DispatcherState>>) {
        let mut st = state.borrow_mut();

        let mut packet = Packet::tunnel();
        match st.tunnel.read(&mut packet) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => panic!("tunnel should never close: {}", e),
        }

        let count = st.pipes.len();
        assert!(count > 0, "cannot find a free data pipe to send to");
        let target = (0..count)
            .map(|offset| (st.current_index + offset) % count)
            .find(|&idx| {
                let pipe = &st.pipes[idx];
                lp.eval(pipe.is_primed()) && lp.eval(pipe.outbound.can_push())
            });
        st.current_index = (st.current_index + 1) % count;

        match target {
            Some(idx) => st.pipes[idx].outbound.push(packet),
            None => panic!("cannot find a free data pipe to send to"),
        }
    }

    fn do_receive(lp: &EventLoop, state: &Rc<RefCell<DispatcherState>>) {
        let mut st = state.borrow_mut();

        let ready = st
            .pipes
            .iter()
            .position(|p| lp.eval(p.inbound.can_pop()))
            .expect("cannot find a ready data pipe to receive from");
        let packet = st.pipes[ready].inbound.pop();

        match st.tunnel.write(&packet) {
            Ok(true) => {}
            Ok(false) => info!(target: "dispatcher", "dropped an incoming packet"),
            Err(e) => panic!("tunnel should never close: {}", e),
        }
    }
}
