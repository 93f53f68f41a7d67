use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::Instant;

use crate::aio::AioDriver;
use crate::poll::Poller;
use crate::timer::{self, TimerWheel};

/// Callback invoked on an AIO handle with the number of completions
/// that accumulated since the previous notification.
pub type AioCallback = dyn Fn(&mut EventLoop, u64);

/// A single-threaded event loop scoped to the thread that created it.
///
/// The loop owns the timer wheel and, once the first [`AioHandle`] is
/// opened, the kernel AIO driver. All callbacks run on the caller's
/// thread from within [`run_once`]; they may freely start and stop
/// timers and submit requests, but must not re-enter the dispatcher.
///
/// [`AioHandle`]: struct.AioHandle.html
/// [`run_once`]: #method.run_once
pub struct EventLoop {
    origin: Instant,
    /// Cached loop time, milliseconds since creation.
    pub(crate) time: u64,
    pub(crate) poller: Poller,
    pub(crate) wheel: TimerWheel,
    pub(crate) aio: Option<AioDriver>,
    pub(crate) aio_handles: Vec<(u64, Rc<AioCallback>)>,
    pub(crate) next_aio_handle_id: u64,
}

impl EventLoop {
    /// Create a loop. Its clock starts at zero.
    pub fn new() -> EventLoop {
        EventLoop {
            origin: Instant::now(),
            time: 0,
            poller: Poller::new(),
            wheel: TimerWheel::new(0),
            aio: None,
            aio_handles: Vec::new(),
            next_aio_handle_id: 0,
        }
    }

    /// Cached loop time in milliseconds. Updated once per iteration,
    /// not on every call.
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Refresh the cached loop time from the monotonic clock.
    pub fn update_time(&mut self) {
        self.time = self.origin.elapsed().as_millis() as u64;
    }

    /// Catch the timer wheel up to the current loop time, firing every
    /// timer that became due.
    pub fn run_timers(&mut self) {
        self.update_time();
        let catchup = self.time;
        timer::run_timers(self, catchup);
    }

    /// Milliseconds until the nearest scheduled timer, or `None` when
    /// no timer is active. The value is a safe upper bound for how
    /// long the poller may sleep.
    pub fn next_timeout(&self) -> Option<u64> {
        self.wheel.next_timeout()
    }

    /// One loop iteration: run due timers, block on the poller until
    /// the next deadline or fd readiness, then dispatch readiness
    /// callbacks.
    pub fn run_once(&mut self) -> io::Result<()> {
        self.run_timers();

        let timeout = match self.next_timeout() {
            Some(ms) => ms.min(libc::c_int::max_value() as u64) as libc::c_int,
            None if self.poller.is_empty() => 0,
            None => -1,
        };

        let ready = self.poller.poll(timeout)?;
        self.update_time();

        for (cb, events) in ready {
            cb(self, events);
        }

        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("time", &self.time)
            .field("active_timers", &self.wheel.active_timers())
            .field("aio", &self.aio)
            .finish()
    }
}
