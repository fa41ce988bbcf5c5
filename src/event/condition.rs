use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::EventLoop;

/// Direction of interest for an I/O condition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IoDir {
    Read,
    Write,
}

/// A generational reference to a condition registered with an event loop.
///
/// `Cond` is a plain value: cheap to copy into action dependency lists and
/// safe to outlive its owner. A `Cond` whose slot has been reclaimed is
/// simply no longer known to the loop, and any action depending on it can
/// never become invokable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Cond {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

pub(crate) enum ConditionKind {
    /// Manually toggled via `arm()` / `fire()`.
    Base,
    /// Set each tick from the readiness probe.
    Io { fd: RawFd, dir: IoDir },
    /// Recomputed on demand from other conditions' current values.
    Computed(Rc<dyn Fn() -> bool>),
    /// Fired by the timer service when its deadline is reached.
    Timer,
}

pub(crate) struct ConditionSlot {
    pub(crate) generation: u32,
    pub(crate) live: bool,
    pub(crate) value: bool,
    pub(crate) kind: ConditionKind,
}

impl ConditionSlot {
    pub(crate) fn io_key(&self) -> Option<(RawFd, IoDir)> {
        match &self.kind {
            ConditionKind::Io { fd, dir } => Some((*fd, *dir)),
            _ => None,
        }
    }
}

/// An owned condition: the registration is released when this is dropped.
///
/// Components hand out the inner [`Cond`] for actions to depend on while
/// retaining the `Condition` itself, which keeps the loop registration
/// alive.
pub struct Condition {
    lp: EventLoop,
    cond: Cond,
}

impl Condition {
    /// A base condition, initially unset.
    pub fn new(lp: &EventLoop) -> Condition {
        let cond = lp.alloc_condition(ConditionKind::Base, false);
        Condition { lp: lp.clone(), cond }
    }

    /// A base condition that starts out set.
    pub fn fired(lp: &EventLoop) -> Condition {
        let cond = lp.alloc_condition(ConditionKind::Base, true);
        Condition { lp: lp.clone(), cond }
    }

    /// A computed condition. `expr` must be pure over other conditions'
    /// current values; it is re-evaluated every time the condition is read.
    pub fn computed(lp: &EventLoop, expr: impl Fn() -> bool + 'static) -> Condition {
        let cond = lp.alloc_condition(ConditionKind::Computed(Rc::new(expr)), false);
        Condition { lp: lp.clone(), cond }
    }

    pub(crate) fn timer(lp: &EventLoop) -> Condition {
        let cond = lp.alloc_condition(ConditionKind::Timer, false);
        Condition { lp: lp.clone(), cond }
    }

    pub fn cond(&self) -> Cond {
        self.cond
    }

    /// Set the condition.
    pub fn fire(&self) {
        self.lp.set_condition(self.cond, true);
    }

    /// Clear the condition.
    pub fn arm(&self) {
        self.lp.set_condition(self.cond, false);
    }

    pub fn is_set(&self) -> bool {
        self.lp.eval(self.cond)
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        self.lp.release_condition(self.cond);
    }
}
