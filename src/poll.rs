use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bitflags::bitflags;

use crate::event_loop::EventLoop;

bitflags! {
    /// Readiness mask delivered to watcher callbacks.
    pub(crate) struct Events: libc::c_short {
        const READABLE = libc::POLLIN;
        const WRITABLE = libc::POLLOUT;
    }
}

pub(crate) type IoCallback = Rc<dyn Fn(&mut EventLoop, Events)>;

struct IoWatcher {
    interest: Events,
    cb: IoCallback,
}

/// `poll(2)`-backed readiness table. Registrations are keyed by fd;
/// re-registering an fd replaces its interest and callback.
pub(crate) struct Poller {
    watchers: HashMap<RawFd, IoWatcher>,
}

impl Poller {
    pub fn new() -> Poller {
        Poller {
            watchers: HashMap::new(),
        }
    }

    pub fn register(&mut self, fd: RawFd, interest: Events, cb: IoCallback) {
        self.watchers.insert(fd, IoWatcher { interest, cb });
    }

    pub fn unregister(&mut self, fd: RawFd) {
        self.watchers.remove(&fd);
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Block for up to `timeout_ms` (`-1` blocks indefinitely) and
    /// collect the callbacks of every ready descriptor. `EINTR` yields
    /// an empty dispatch so the caller can recompute its timeout.
    pub fn poll(&self, timeout_ms: libc::c_int) -> io::Result<Vec<(IoCallback, Events)>> {
        let mut fds: Vec<libc::pollfd> = self
            .watchers
            .iter()
            .map(|(&fd, watcher)| libc::pollfd {
                fd,
                events: watcher.interest.bits(),
                revents: 0,
            })
            .collect();

        let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }

            let watcher = &self.watchers[&pfd.fd];
            let mut events = Events::from_bits_truncate(pfd.revents) & watcher.interest;
            if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                events |= watcher.interest;
            }

            if !events.is_empty() {
                ready.push((watcher.cb.clone(), events));
            }
        }

        Ok(ready)
    }
}
