use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

use super::condition::{Cond, Condition};
use super::{EventLoop, Time};

/// Sorted timeout queue backed by one monotonic `timerfd` per loop.
///
/// The timerfd sits in the same `poll(2)` set the I/O manager probes each
/// tick, so timer wakeups and socket readiness share a single blocking
/// point. `targets` is kept sorted descending by deadline: the imminent
/// entry is always at the tail.
pub(crate) struct TimerService {
    fd: RawFd,
    targets: Vec<(Time, Cond)>,
    /// Deadline the timerfd is currently armed for; 0 when disarmed.
    current_target: Time,
}

impl TimerService {
    pub(crate) fn new() -> TimerService {
        // SAFETY: plain syscall; a negative return is checked below.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            panic!(
                "cannot create timerfd: {}",
                std::io::Error::last_os_error()
            );
        }
        TimerService { fd, targets: Vec::new(), current_target: 0 }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn armed(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Register or update the deadline for `cond` and reprogram the
    /// timerfd if the new deadline is nearer than the armed one.
    pub(crate) fn set_timeout(&mut self, now: Time, target: Time, cond: Cond) {
        match self.targets.iter_mut().find(|(_, c)| *c == cond) {
            Some(entry) => entry.0 = target,
            None => self.targets.push((target, cond)),
        }
        self.targets.sort_by(|a, b| b.0.cmp(&a.0));
        self.update(now);
    }

    /// Drop the entry for `cond`. The timerfd is not reprogrammed; a
    /// spurious wake is harmless.
    pub(crate) fn remove_timeout(&mut self, cond: Cond) {
        self.targets.retain(|(_, c)| *c != cond);
    }

    /// Drain the timerfd and pop every entry due at or before
    /// `max(now, current_target)`. Returns the conditions to fire.
    pub(crate) fn drain(&mut self, now: Time) -> Vec<Cond> {
        let mut buf = [0u8; 8];
        // SAFETY: fd is a valid timerfd; short or EAGAIN reads are fine,
        // we only need to consume the expiration count.
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }

        let target = now.max(self.current_target);
        let mut fired = Vec::new();
        while let Some(&(deadline, cond)) = self.targets.last() {
            if deadline > target {
                break;
            }
            self.targets.pop();
            fired.push(cond);
        }
        self.current_target = 0;
        if !self.targets.is_empty() {
            self.update(now);
        }
        trace!(target: "timer", "drained: {} fired, {} pending", fired.len(), self.targets.len());
        fired
    }

    fn update(&mut self, now: Time) {
        let tail = match self.targets.last() {
            Some(&(deadline, _)) => deadline,
            None => return,
        };
        if self.current_target != 0 && tail >= self.current_target {
            return;
        }

        // Arm for at least 1 ms; a zero it_value would disarm the timer.
        let timeout = tail.saturating_sub(now).max(1);
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (timeout / 1000) as libc::time_t,
                tv_nsec: ((timeout % 1000) * 1_000_000) as libc::c_long,
            },
        };
        // SAFETY: fd is a valid timerfd and spec is a valid itimerspec.
        let ret = unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            panic!(
                "cannot program timerfd: {}",
                std::io::Error::last_os_error()
            );
        }
        self.current_target = now + timeout;
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        // SAFETY: fd was returned by timerfd_create and is closed once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// An armed timeout with a `did_fire` condition.
///
/// `did_fire` is unset between arming and the deadline and becomes set at
/// or after it. Resetting or extending re-arms the condition.
pub struct Timer {
    lp: EventLoop,
    did_fire: Condition,
    target: Time,
}

impl Timer {
    pub fn new(lp: &EventLoop, timeout: Duration) -> Timer {
        let mut timer = Timer {
            lp: lp.clone(),
            did_fire: Condition::timer(lp),
            target: 0,
        };
        timer.reset(timeout);
        timer
    }

    pub fn did_fire(&self) -> Cond {
        self.did_fire.cond()
    }

    /// Re-arm for `now + timeout`.
    pub fn reset(&mut self, timeout: Duration) {
        self.did_fire.arm();
        self.target = self.lp.now_ms() + timeout.as_millis() as Time;
        self.lp.set_timeout(self.target, self.did_fire.cond());
    }

    /// Re-arm for the previous deadline plus `timeout`, keeping the period
    /// free of drift from callback latency.
    pub fn extend(&mut self, timeout: Duration) {
        self.did_fire.arm();
        self.target += timeout.as_millis() as Time;
        self.lp.set_timeout(self.target, self.did_fire.cond());
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.lp.remove_timeout(self.did_fire.cond());
    }
}
