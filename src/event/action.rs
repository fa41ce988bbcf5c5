use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use super::condition::Cond;
use super::timer::Timer;
use super::{ActionId, EventLoop};

/// A recurring callback gated on a conjunction of conditions.
///
/// The callback runs once per tick whenever every referenced condition is
/// known to the loop and evaluates true. Dropping the `Action` removes it;
/// there are no late fires.
pub struct Action {
    lp: EventLoop,
    id: ActionId,
}

impl Action {
    pub fn new(lp: &EventLoop, conditions: Vec<Cond>, callback: impl FnMut() + 'static) -> Action {
        let callback: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(callback));
        let id = lp.add_action(conditions, callback, false);
        Action { lp: lp.clone(), id }
    }

    /// An owned one-shot: fires at most once, and is cancelled when the
    /// guard is dropped. Unlike [`Trigger::arm`] the loop does not keep it
    /// alive past its owner.
    pub fn once(lp: &EventLoop, conditions: Vec<Cond>, callback: impl FnOnce() + 'static) -> Action {
        let mut callback = Some(callback);
        let wrapped: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(move || {
            if let Some(cb) = callback.take() {
                cb();
            }
        }));
        let id = lp.add_action(conditions, wrapped, true);
        Action { lp: lp.clone(), id }
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        self.lp.remove_action(self.id);
    }
}

/// One-shot actions owned by the loop: fire once, then dispose of
/// themselves.
pub struct Trigger;

impl Trigger {
    /// Arm a callback that runs the first time all `conditions` hold, then
    /// self-destructs.
    pub fn arm(lp: &EventLoop, conditions: Vec<Cond>, callback: impl FnOnce() + 'static) {
        let mut callback = Some(callback);
        let wrapped: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(move || {
            if let Some(cb) = callback.take() {
                cb();
            }
        }));
        lp.add_action(conditions, wrapped, true);
    }

    /// Run `callback` once, `delay` from now.
    pub fn perform_in(lp: &EventLoop, delay: Duration, callback: impl FnOnce() + 'static) {
        let timer = Timer::new(lp, delay);
        let cond = timer.did_fire();
        // The closure keeps the timer alive until it fires.
        let mut state = Some((timer, callback));
        let wrapped: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(move || {
            if let Some((timer, cb)) = state.take() {
                drop(timer);
                cb();
            }
        }));
        lp.add_action(vec![cond], wrapped, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Condition;
    use std::cell::Cell;

    #[test]
    fn action_fires_when_all_conditions_hold() {
        let lp = EventLoop::new();
        let a = Condition::new(&lp);
        let b = Condition::new(&lp);
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        let _action = Action::new(&lp, vec![a.cond(), b.cond()], move || {
            counter.set(counter.get() + 1);
        });

        lp.tick();
        assert_eq!(count.get(), 0);

        a.fire();
        lp.tick();
        assert_eq!(count.get(), 0);

        b.fire();
        lp.tick();
        assert_eq!(count.get(), 1);

        // Still ready: recurring actions fire every tick.
        lp.tick();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn dropped_action_never_fires() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        let action = Action::new(&lp, vec![ready.cond()], move || {
            counter.set(counter.get() + 1);
        });
        drop(action);

        lp.tick();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn action_depending_on_released_condition_is_dormant() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let cond = ready.cond();
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        let _action = Action::new(&lp, vec![cond], move || {
            counter.set(counter.get() + 1);
        });

        drop(ready);
        lp.tick();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn trigger_fires_exactly_once() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        Trigger::arm(&lp, vec![ready.cond()], move || {
            counter.set(counter.get() + 1);
        });

        lp.tick();
        lp.tick();
        lp.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn callback_may_destroy_its_own_action() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let holder: Rc<RefCell<Option<Action>>> = Rc::new(RefCell::new(None));
        let count = Rc::new(Cell::new(0u32));

        let counter = count.clone();
        let holder2 = holder.clone();
        let action = Action::new(&lp, vec![ready.cond()], move || {
            counter.set(counter.get() + 1);
            holder2.borrow_mut().take();
        });
        *holder.borrow_mut() = Some(action);

        lp.tick();
        lp.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn action_created_inside_callback_joins_next_tick() {
        let lp = EventLoop::new();
        let ready = Condition::fired(&lp);
        let cond = ready.cond();
        let count = Rc::new(Cell::new(0u32));
        let spawned: Rc<RefCell<Option<Action>>> = Rc::new(RefCell::new(None));

        let counter = count.clone();
        let spawned2 = spawned.clone();
        let lp2 = lp.clone();
        Trigger::arm(&lp, vec![cond], move || {
            let counter = counter.clone();
            let inner = Action::new(&lp2, vec![cond], move || {
                counter.set(counter.get() + 1);
            });
            *spawned2.borrow_mut() = Some(inner);
        });

        lp.tick();
        assert_eq!(count.get(), 0);
        lp.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn perform_in_runs_after_delay() {
        let lp = EventLoop::new();
        let done = Rc::new(Cell::new(false));

        let flag = done.clone();
        Trigger::perform_in(&lp, Duration::from_millis(20), move || {
            flag.set(true);
        });

        let start = std::time::Instant::now();
        while !done.get() && start.elapsed() < Duration::from_secs(2) {
            lp.tick();
        }
        assert!(done.get());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
