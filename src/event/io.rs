use std::collections::HashMap;
use std::os::unix::io::RawFd;

use super::condition::{Cond, ConditionSlot, IoDir};

/// Maps `(fd, direction)` to its shared I/O condition.
///
/// Multiple actions may depend on the same condition; the registry hands
/// out one condition per `(fd, direction)` pair and the reactor updates its
/// value from a single `poll(2)` each tick.
pub(crate) struct IoManager {
    pub(crate) conditions: HashMap<(RawFd, IoDir), Cond>,
}

impl IoManager {
    pub(crate) fn new() -> IoManager {
        IoManager { conditions: HashMap::new() }
    }

    /// Run one readiness probe over the fds named by `interest` (the I/O
    /// conditions referenced by live actions) plus the loop's timerfd, and
    /// write readiness back into the condition slots. Returns whether the
    /// timerfd is readable.
    pub(crate) fn probe(
        &mut self,
        slots: &mut [ConditionSlot],
        interest: &[Cond],
        timer_fd: RawFd,
        timeout_ms: i32,
    ) -> bool {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(interest.len() + 1);
        let mut index_of: HashMap<RawFd, usize> = HashMap::new();

        for cond in interest {
            let slot = &slots[cond.index as usize];
            if !slot.live || slot.generation != cond.generation {
                continue;
            }
            if let Some((fd, dir)) = slot.io_key() {
                let events = match dir {
                    IoDir::Read => libc::POLLIN,
                    IoDir::Write => libc::POLLOUT,
                };
                match index_of.get(&fd) {
                    Some(&i) => fds[i].events |= events,
                    None => {
                        index_of.insert(fd, fds.len());
                        fds.push(libc::pollfd { fd, events, revents: 0 });
                    }
                }
            }
        }

        let timer_index = fds.len();
        fds.push(libc::pollfd { fd: timer_fd, events: libc::POLLIN, revents: 0 });

        // SAFETY: fds is a valid array of initialized pollfd for its length.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            // EINTR leaves every revents zeroed; conditions read as not
            // ready this tick and the next probe retries.
            for fd in fds.iter_mut() {
                fd.revents = 0;
            }
        }

        for cond in interest {
            let slot = &mut slots[cond.index as usize];
            if !slot.live || slot.generation != cond.generation {
                continue;
            }
            if let Some((fd, dir)) = slot.io_key() {
                let revents = index_of.get(&fd).map(|&i| fds[i].revents).unwrap_or(0);
                // Error and hangup count as ready: the subsequent read or
                // write surfaces the failure instead of the loop spinning.
                let mask = match dir {
                    IoDir::Read => libc::POLLIN | libc::POLLERR | libc::POLLHUP,
                    IoDir::Write => libc::POLLOUT | libc::POLLERR | libc::POLLHUP,
                };
                slot.value = revents & mask != 0;
            }
        }

        fds[timer_index].revents & libc::POLLIN != 0
    }
}
