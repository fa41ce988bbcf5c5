use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::condition::{Cond, Condition};
use super::EventLoop;

/// Bounded FIFO queue exposing `can_push` / `can_pop` conditions.
///
/// The conditions flip at exactly the empty↔nonempty and full↔nonfull
/// transitions, so an action firing on `can_pop` in the same tick as a
/// `push` observes the updated predicate. Queues are the only channel
/// between actions; handles are cheaply cloneable and share the storage.
///
/// `push` on a full queue and `pop` on an empty one are programmer errors
/// and panic: callers gate on the conditions.
pub struct Fifo<T> {
    inner: Rc<FifoInner<T>>,
}

struct FifoInner<T> {
    queue: RefCell<VecDeque<T>>,
    capacity: usize,
    can_push: Condition,
    can_pop: Condition,
}

impl<T> Fifo<T> {
    pub fn new(lp: &EventLoop, capacity: usize) -> Fifo<T> {
        assert!(capacity > 0, "FIFO capacity must be positive");
        Fifo {
            inner: Rc::new(FifoInner {
                queue: RefCell::new(VecDeque::with_capacity(capacity)),
                capacity,
                can_push: Condition::fired(lp),
                can_pop: Condition::new(lp),
            }),
        }
    }

    pub fn can_push(&self) -> Cond {
        self.inner.can_push.cond()
    }

    pub fn can_pop(&self) -> Cond {
        self.inner.can_pop.cond()
    }

    pub fn push(&self, value: T) {
        let mut queue = self.inner.queue.borrow_mut();
        assert!(queue.len() < self.inner.capacity, "push into a full FIFO");
        queue.push_back(value);
        self.inner.can_pop.fire();
        if queue.len() == self.inner.capacity {
            self.inner.can_push.arm();
        }
    }

    pub fn pop(&self) -> T {
        let mut queue = self.inner.queue.borrow_mut();
        let value = queue.pop_front().expect("pop from an empty FIFO");
        self.inner.can_push.fire();
        if queue.is_empty() {
            self.inner.can_pop.arm();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.borrow().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Fifo { inner: Rc::clone(&self.inner) }
    }
}
