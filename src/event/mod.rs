//! Single-threaded reactive core: conditions, actions, timers, and the
//! loop that drives them.
//!
//! Everything hangs off an [`EventLoop`] handle passed explicitly through
//! constructors. Components register *conditions* (readiness predicates)
//! and *actions* (callbacks gated on a conjunction of conditions); one
//! `poll(2)` per tick refreshes I/O readiness and a `timerfd` in the same
//! poll set supplies timer wakeups. Callbacks never block; they return and
//! wait for their predicates to come true again.

pub mod action;
pub mod condition;
pub mod fifo;
pub mod io;
pub mod timer;

pub use action::{Action, Trigger};
pub use condition::{Cond, Condition, IoDir};
pub use fifo::Fifo;
pub use timer::Timer;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

use condition::{ConditionKind, ConditionSlot};
use io::IoManager;
use timer::TimerService;

/// Monotonic milliseconds since the loop was created.
pub type Time = u64;

/// Upper bound on how long one probe may block when nothing is ready.
const POLL_CEILING_MS: i32 = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ActionId {
    index: u32,
    generation: u32,
}

type Callback = Rc<RefCell<dyn FnMut()>>;

struct ActionSlot {
    generation: u32,
    live: bool,
    one_shot: bool,
    conditions: Vec<Cond>,
    callback: Option<Callback>,
}

struct Reactor {
    origin: Instant,
    conditions: Vec<ConditionSlot>,
    free_conditions: Vec<u32>,
    actions: Vec<ActionSlot>,
    free_actions: Vec<u32>,
    io: IoManager,
    timers: TimerService,
    stopped: bool,
    in_tick: bool,
    deferred_free: Vec<u32>,
}

/// Cloneable handle to the reactor. One loop per thread; the handle is
/// neither `Send` nor `Sync`.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Reactor>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop {
            inner: Rc::new(RefCell::new(Reactor {
                origin: Instant::now(),
                conditions: Vec::new(),
                free_conditions: Vec::new(),
                actions: Vec::new(),
                free_actions: Vec::new(),
                io: IoManager::new(),
                timers: TimerService::new(),
                stopped: false,
                in_tick: false,
                deferred_free: Vec::new(),
            })),
        }
    }

    pub fn now_ms(&self) -> Time {
        self.inner.borrow().origin.elapsed().as_millis() as Time
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    pub(crate) fn alloc_condition(&self, kind: ConditionKind, value: bool) -> Cond {
        let mut r = self.inner.borrow_mut();
        match r.free_conditions.pop() {
            Some(index) => {
                let slot = &mut r.conditions[index as usize];
                slot.live = true;
                slot.value = value;
                slot.kind = kind;
                Cond { index, generation: slot.generation }
            }
            None => {
                let index = r.conditions.len() as u32;
                r.conditions.push(ConditionSlot { generation: 0, live: true, value, kind });
                Cond { index, generation: 0 }
            }
        }
    }

    pub(crate) fn release_condition(&self, cond: Cond) {
        let mut r = self.inner.borrow_mut();
        let Some(slot) = r.conditions.get_mut(cond.index as usize) else {
            return;
        };
        if !slot.live || slot.generation != cond.generation {
            return;
        }
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.kind = ConditionKind::Base;
        if let Some(key) = {
            let mut found = None;
            for (k, v) in r.io.conditions.iter() {
                if *v == cond {
                    found = Some(*k);
                    break;
                }
            }
            found
        } {
            r.io.conditions.remove(&key);
        }
        r.free_conditions.push(cond.index);
    }

    pub(crate) fn set_condition(&self, cond: Cond, value: bool) {
        let mut r = self.inner.borrow_mut();
        if let Some(slot) = r.conditions.get_mut(cond.index as usize) {
            if slot.live && slot.generation == cond.generation {
                slot.value = value;
            }
        }
    }

    /// Whether the condition is currently registered with this loop.
    pub fn is_known(&self, cond: Cond) -> bool {
        let r = self.inner.borrow();
        r.conditions
            .get(cond.index as usize)
            .map(|s| s.live && s.generation == cond.generation)
            .unwrap_or(false)
    }

    /// Current value of a condition. Unknown conditions read false;
    /// computed conditions re-evaluate their expression.
    pub fn eval(&self, cond: Cond) -> bool {
        let expr = {
            let r = self.inner.borrow();
            let Some(slot) = r.conditions.get(cond.index as usize) else {
                return false;
            };
            if !slot.live || slot.generation != cond.generation {
                return false;
            }
            match &slot.kind {
                ConditionKind::Computed(expr) => Rc::clone(expr),
                _ => return slot.value,
            }
        };
        // Evaluated with the reactor borrow released: the expression reads
        // other conditions through this same handle.
        expr()
    }

    /// The shared readability condition for `fd`.
    pub fn can_read(&self, fd: RawFd) -> Cond {
        self.io_condition(fd, IoDir::Read)
    }

    /// The shared writability condition for `fd`.
    pub fn can_write(&self, fd: RawFd) -> Cond {
        self.io_condition(fd, IoDir::Write)
    }

    fn io_condition(&self, fd: RawFd, dir: IoDir) -> Cond {
        {
            let r = self.inner.borrow();
            if let Some(&cond) = r.io.conditions.get(&(fd, dir)) {
                return cond;
            }
        }
        let cond = self.alloc_condition(ConditionKind::Io { fd, dir }, false);
        self.inner.borrow_mut().io.conditions.insert((fd, dir), cond);
        cond
    }

    /// Drop both conditions registered for `fd`. Called when the fd's
    /// owner closes it.
    pub fn forget_fd(&self, fd: RawFd) {
        for dir in [IoDir::Read, IoDir::Write] {
            let cond = {
                let r = self.inner.borrow();
                r.io.conditions.get(&(fd, dir)).copied()
            };
            if let Some(cond) = cond {
                self.release_condition(cond);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub(crate) fn set_timeout(&self, target: Time, cond: Cond) {
        let now = self.now_ms();
        self.inner.borrow_mut().timers.set_timeout(now, target, cond);
    }

    pub(crate) fn remove_timeout(&self, cond: Cond) {
        self.inner.borrow_mut().timers.remove_timeout(cond);
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub(crate) fn add_action(
        &self,
        conditions: Vec<Cond>,
        callback: Callback,
        one_shot: bool,
    ) -> ActionId {
        let mut r = self.inner.borrow_mut();
        match r.free_actions.pop() {
            Some(index) => {
                let slot = &mut r.actions[index as usize];
                slot.live = true;
                slot.one_shot = one_shot;
                slot.conditions = conditions;
                slot.callback = Some(callback);
                ActionId { index, generation: slot.generation }
            }
            None => {
                let index = r.actions.len() as u32;
                r.actions.push(ActionSlot {
                    generation: 0,
                    live: true,
                    one_shot,
                    conditions,
                    callback: Some(callback),
                });
                ActionId { index, generation: 0 }
            }
        }
    }

    pub(crate) fn remove_action(&self, id: ActionId) {
        let mut r = self.inner.borrow_mut();
        let Some(slot) = r.actions.get_mut(id.index as usize) else {
            return;
        };
        if !slot.live || slot.generation != id.generation {
            return;
        }
        slot.live = false;
        if r.in_tick {
            // The tick is iterating the action table; reclaim after it
            // finishes so a callback may destroy its own action.
            r.deferred_free.push(id.index);
        } else {
            Reactor::free_action(&mut r, id.index);
        }
    }

    fn can_invoke(&self, id: ActionId) -> bool {
        let conditions = {
            let r = self.inner.borrow();
            match r.actions.get(id.index as usize) {
                Some(slot) if slot.live && slot.generation == id.generation => {
                    slot.conditions.clone()
                }
                _ => return false,
            }
        };
        conditions.iter().all(|&c| self.is_known(c) && self.eval(c))
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Run one tick: probe readiness, fire due timers, then invoke every
    /// live action whose conditions all hold. Each action's predicate is
    /// re-checked against fresh values immediately before invocation, so
    /// an action consuming a queue edge stops later actions from seeing a
    /// stale one.
    pub fn tick(&self) {
        let snapshot: Vec<ActionId> = {
            let r = self.inner.borrow();
            r.actions
                .iter()
                .enumerate()
                .filter(|(_, s)| s.live)
                .map(|(i, s)| ActionId { index: i as u32, generation: s.generation })
                .collect()
        };

        let ready_now = snapshot.iter().any(|&id| self.can_invoke(id));
        let timeout = if ready_now { 0 } else { POLL_CEILING_MS };

        let interest: Vec<Cond> = {
            let r = self.inner.borrow();
            snapshot
                .iter()
                .filter_map(|id| r.actions.get(id.index as usize))
                .filter(|s| s.live)
                .flat_map(|s| s.conditions.iter().copied())
                .collect()
        };

        let fired = {
            let mut r = self.inner.borrow_mut();
            let origin = r.origin;
            let Reactor { conditions, io, timers, .. } = &mut *r;
            let timer_readable = io.probe(conditions, &interest, timers.fd(), timeout);
            if timer_readable {
                let now = origin.elapsed().as_millis() as Time;
                timers.drain(now)
            } else {
                Vec::new()
            }
        };
        for cond in fired {
            self.set_condition(cond, true);
        }

        self.inner.borrow_mut().in_tick = true;
        for id in snapshot {
            if !self.can_invoke(id) {
                continue;
            }
            let (callback, one_shot) = {
                let r = self.inner.borrow();
                let slot = &r.actions[id.index as usize];
                (slot.callback.clone(), slot.one_shot)
            };
            if let Some(callback) = callback {
                // Invoked with the reactor borrow released; the callback
                // may freely create and destroy actions, timers, and
                // conditions through this handle.
                (callback.borrow_mut())();
            }
            if one_shot {
                self.remove_action(id);
            }
        }

        let deferred = {
            let mut r = self.inner.borrow_mut();
            r.in_tick = false;
            std::mem::take(&mut r.deferred_free)
        };
        if !deferred.is_empty() {
            let mut r = self.inner.borrow_mut();
            for index in deferred {
                Reactor::free_action(&mut r, index);
            }
        }
    }

    /// Run until [`stop`](Self::stop) is called or no live action remains
    /// and no timer is armed.
    pub fn run(&self) {
        loop {
            {
                let r = self.inner.borrow();
                if r.stopped {
                    break;
                }
                let has_actions = r.actions.iter().any(|s| s.live);
                if !has_actions && !r.timers.armed() {
                    break;
                }
            }
            self.tick();
        }
    }

    pub fn stop(&self) {
        self.inner.borrow_mut().stopped = true;
    }
}

impl Reactor {
    fn free_action(r: &mut Reactor, index: u32) {
        let slot = &mut r.actions[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.conditions.clear();
        slot.callback = None;
        r.free_actions.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    #[test]
    fn run_returns_once_nothing_is_live() {
        let lp = EventLoop::new();
        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            Trigger::perform_in(&lp, Duration::from_millis(20), move || {
                fired.set(true);
            });
        }
        // One trigger, one timer: run drains both, then exits on its own.
        lp.run();
        assert!(fired.get());
    }

    #[test]
    fn stop_ends_the_run_with_work_pending() {
        let lp = EventLoop::new();
        let always = Condition::fired(&lp);
        let ticks = Rc::new(Cell::new(0u32));

        let _action = {
            let lp2 = lp.clone();
            let ticks = ticks.clone();
            Action::new(&lp, vec![always.cond()], move || {
                ticks.set(ticks.get() + 1);
                if ticks.get() == 3 {
                    lp2.stop();
                }
            })
        };
        lp.run();
        assert_eq!(ticks.get(), 3);
    }

    #[test]
    fn computed_condition_reflects_its_inputs() {
        let lp = EventLoop::new();
        let a = Condition::new(&lp);
        let b = Condition::new(&lp);
        let both = {
            let lp2 = lp.clone();
            let (ca, cb) = (a.cond(), b.cond());
            Condition::computed(&lp, move || lp2.eval(ca) && lp2.eval(cb))
        };

        assert!(!lp.eval(both.cond()));
        a.fire();
        assert!(!lp.eval(both.cond()));
        b.fire();
        assert!(lp.eval(both.cond()));
        a.arm();
        assert!(!lp.eval(both.cond()));
    }

    #[test]
    fn io_condition_tracks_socket_readiness() {
        let lp = EventLoop::new();
        let (tx, rx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let reads = Rc::new(Cell::new(0u32));
        let _action = {
            let reads = reads.clone();
            let rx_fd = rx.as_raw_fd();
            Action::new(&lp, vec![lp.can_read(rx_fd)], move || {
                let mut buf = [0u8; 16];
                if rx.recv(&mut buf).is_ok() {
                    reads.set(reads.get() + 1);
                }
            })
        };

        lp.tick();
        assert_eq!(reads.get(), 0);

        tx.send(b"x").unwrap();
        let start = std::time::Instant::now();
        while reads.get() == 0 && start.elapsed() < Duration::from_secs(2) {
            lp.tick();
        }
        assert_eq!(reads.get(), 1);
    }

    #[test]
    fn every_ready_action_fires_each_tick() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let counts: Vec<Rc<Cell<u32>>> = (0..4).map(|_| Rc::new(Cell::new(0))).collect();

        let _actions: Vec<Action> = counts
            .iter()
            .map(|count| {
                let count = count.clone();
                Action::new(&lp, vec![ready.cond()], move || {
                    count.set(count.get() + 1);
                })
            })
            .collect();

        for _ in 0..5 {
            lp.tick();
        }
        for count in &counts {
            assert_eq!(count.get(), 5);
        }
    }
}
