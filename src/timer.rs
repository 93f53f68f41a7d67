use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use log::trace;

use crate::errors::TimerError;
use crate::event_loop::EventLoop;

pub(crate) const TVR_BITS: u32 = 8;
pub(crate) const TVR_SIZE: u64 = 1 << TVR_BITS;
pub(crate) const TVR_MASK: u64 = TVR_SIZE - 1;

pub(crate) const TVN_BITS: u32 = 6;
pub(crate) const TVN_SIZE: u64 = 1 << TVN_BITS;
pub(crate) const TVN_MASK: u64 = TVN_SIZE - 1;

/// Largest relative expiration the wheel can represent; longer
/// timeouts are clamped to it.
pub(crate) const MAX_TVAL: u64 = (1u64 << (TVR_BITS + 4 * TVN_BITS)) - 1;

/// Callback invoked when a timer expires.
pub type TimerCallback = dyn Fn(&mut EventLoop, &Timer);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Location {
    /// Not scheduled.
    Detached,
    /// Linked into wheel `level` (0 is the finest), bucket `index`.
    Wheel { level: u8, index: u16 },
    /// Spliced into the work list of the tick being dispatched.
    Pending,
}

struct TimerEntry {
    link: LinkedListLink,
    location: Cell<Location>,
    /// Identity token of the wheel the entry is linked into.
    owner: RefCell<Weak<()>>,
    timeout: Cell<u64>,
    repeat: Cell<u64>,
    start_id: Cell<u64>,
    cb: RefCell<Option<Rc<TimerCallback>>>,
}

intrusive_adapter!(TimerAdapter = Rc<TimerEntry>: TimerEntry { link: LinkedListLink });

/// Hierarchical timing wheel: one 256-bucket wheel at millisecond
/// granularity plus four 64-bucket wheels above it. A timer lands in
/// the coarsest wheel whose range covers its relative deadline and
/// cascades down each time a finer wheel wraps.
pub(crate) struct TimerWheel {
    tv1: Vec<LinkedList<TimerAdapter>>,
    tvn: [Vec<LinkedList<TimerAdapter>>; 4],
    /// Work list of the tick currently being dispatched. Kept on the
    /// wheel so `stop` can still unlink a spliced timer.
    pending: LinkedList<TimerAdapter>,
    /// Last processed tick, in loop-time milliseconds.
    pub(crate) now: u64,
    next_tick: u64,
    active: usize,
    start_counter: u64,
    ident: Rc<()>,
}

impl TimerWheel {
    pub fn new(now: u64) -> TimerWheel {
        fn buckets(n: u64) -> Vec<LinkedList<TimerAdapter>> {
            (0..n).map(|_| LinkedList::new(TimerAdapter::new())).collect()
        }

        TimerWheel {
            tv1: buckets(TVR_SIZE),
            tvn: [
                buckets(TVN_SIZE),
                buckets(TVN_SIZE),
                buckets(TVN_SIZE),
                buckets(TVN_SIZE),
            ],
            pending: LinkedList::new(TimerAdapter::new()),
            now,
            next_tick: now + 1,
            active: 0,
            start_counter: 0,
            ident: Rc::new(()),
        }
    }

    pub fn active_timers(&self) -> usize {
        self.active
    }

    fn next_start_id(&mut self) -> u64 {
        let id = self.start_counter;
        self.start_counter += 1;
        id
    }

    fn bucket_mut(&mut self, level: u8, index: u16) -> &mut LinkedList<TimerAdapter> {
        match level {
            0 => &mut self.tv1[index as usize],
            n => &mut self.tvn[n as usize - 1][index as usize],
        }
    }

    fn insert(&mut self, entry: Rc<TimerEntry>) {
        self.schedule(entry);
        self.active += 1;
    }

    /// Link `entry` into the bucket covering its deadline. Buckets are
    /// keyed on the absolute expiry tick; the wheel is picked by the
    /// deadline's distance from `next_tick`, the next tick to be
    /// processed. A deadline at or before the last processed tick
    /// lands in the current finest bucket and fires on the next tick.
    fn schedule(&mut self, entry: Rc<TimerEntry>) {
        debug_assert!(!entry.link.is_linked());

        let timeout = entry.timeout.get();
        let (level, index) = if timeout < self.next_tick {
            (0u8, (self.next_tick & TVR_MASK) as u16)
        } else {
            let delta = (timeout - self.next_tick).min(MAX_TVAL);
            let expires = self.next_tick + delta;

            if delta < TVR_SIZE {
                (0, (expires & TVR_MASK) as u16)
            } else if delta < 1u64 << (TVR_BITS + TVN_BITS) {
                (1, ((expires >> TVR_BITS) & TVN_MASK) as u16)
            } else if delta < 1u64 << (TVR_BITS + 2 * TVN_BITS) {
                (2, ((expires >> (TVR_BITS + TVN_BITS)) & TVN_MASK) as u16)
            } else if delta < 1u64 << (TVR_BITS + 3 * TVN_BITS) {
                (3, ((expires >> (TVR_BITS + 2 * TVN_BITS)) & TVN_MASK) as u16)
            } else {
                (4, ((expires >> (TVR_BITS + 3 * TVN_BITS)) & TVN_MASK) as u16)
            }
        };

        entry.location.set(Location::Wheel { level, index });
        *entry.owner.borrow_mut() = Rc::downgrade(&self.ident);
        self.bucket_mut(level, index).push_back(entry);
    }

    /// Unlink `entry` from whichever list currently holds it.
    fn unlink(&mut self, entry: &Rc<TimerEntry>) {
        let bucket = match entry.location.get() {
            Location::Detached => return,
            Location::Wheel { level, index } => self.bucket_mut(level, index),
            Location::Pending => &mut self.pending,
        };

        let mut cursor = unsafe { bucket.cursor_mut_from_ptr(Rc::as_ptr(entry)) };
        cursor.remove().expect("timer entry missing from its bucket");

        entry.location.set(Location::Detached);
        *entry.owner.borrow_mut() = Weak::new();
        self.active -= 1;
    }

    /// Move every timer of the upper-wheel bucket `next_tick` selects
    /// back through `schedule`; each lands in a finer wheel. Returns
    /// the bucket index so the caller can short-circuit the chain.
    fn cascade(&mut self, level: usize) -> u64 {
        let shift = TVR_BITS + (level as u32 - 1) * TVN_BITS;
        let index = (self.next_tick >> shift) & TVN_MASK;

        while let Some(entry) = self.tvn[level - 1][index as usize].pop_front() {
            trace!("cascading timer out of wheel {} bucket {}", level + 1, index);
            self.schedule(entry);
        }

        index
    }

    /// Advance one tick: run the cascade chain on wheel-1 wrap, then
    /// splice the due bucket into the pending work list.
    fn advance(&mut self) {
        debug_assert!(self.next_tick == self.now + 1);
        debug_assert!(self.pending.is_empty());

        self.now += 1;
        let index = (self.next_tick & TVR_MASK) as usize;

        if index == 0
            && self.cascade(1) == 0
            && self.cascade(2) == 0
            && self.cascade(3) == 0
        {
            self.cascade(4);
        }

        self.next_tick += 1;

        while let Some(entry) = self.tv1[index].pop_front() {
            entry.location.set(Location::Pending);
            self.pending.push_back(entry);
        }
    }

    /// Milliseconds the poller may block before the next timer is due:
    /// the distance to the nearest occupied wheel-1 bucket, capped by
    /// the distance to the next cascade refill, since a coarser wheel
    /// may hold an earlier deadline than any already in wheel-1.
    /// `None` means no timer is scheduled at all.
    pub fn next_timeout(&self) -> Option<u64> {
        if self.active == 0 {
            return None;
        }

        let refill = match self.next_tick & TVR_MASK {
            0 => 1,
            index => TVR_SIZE - index + 1,
        };

        for offset in 0..TVR_SIZE {
            let index = ((self.next_tick + offset) & TVR_MASK) as usize;
            if !self.tv1[index].is_empty() {
                return Some((offset + 1).min(refill));
            }
        }

        Some(refill)
    }
}

/// Catch the wheel up to `catchup` milliseconds of loop time, firing
/// every timer that became due along the way. Timers due at the same
/// tick fire in the order they were started; a repeating timer is
/// re-armed before its callback runs.
pub(crate) fn run_timers(lp: &mut EventLoop, catchup: u64) {
    while lp.wheel.now < catchup {
        lp.wheel.advance();

        while let Some(entry) = lp.wheel.pending.pop_front() {
            entry.location.set(Location::Detached);
            *entry.owner.borrow_mut() = Weak::new();
            lp.wheel.active -= 1;

            let repeat = entry.repeat.get();
            if repeat != 0 {
                entry.timeout.set(lp.wheel.now.saturating_add(repeat));
                let id = lp.wheel.next_start_id();
                entry.start_id.set(id);
                lp.wheel.insert(entry.clone());
            }

            let cb = entry.cb.borrow().clone();
            let timer = Timer { entry };
            if let Some(cb) = cb {
                cb(lp, &timer);
            }
        }
    }
}

/// A one-shot or repeating millisecond timer.
///
/// The handle is cheaply cloneable; clones refer to the same
/// underlying timer. Dropping every clone of an active timer does not
/// stop it: the loop keeps it alive until it fires or is stopped.
#[derive(Clone)]
pub struct Timer {
    entry: Rc<TimerEntry>,
}

impl Timer {
    /// Create a detached timer with no callback and `repeat == 0`.
    pub fn new() -> Timer {
        Timer {
            entry: Rc::new(TimerEntry {
                link: LinkedListLink::new(),
                location: Cell::new(Location::Detached),
                owner: RefCell::new(Weak::new()),
                timeout: Cell::new(0),
                repeat: Cell::new(0),
                start_id: Cell::new(0),
                cb: RefCell::new(None),
            }),
        }
    }

    /// Arm the timer to fire `timeout` milliseconds from now and then
    /// every `repeat` milliseconds (`0` for one-shot). An active timer
    /// is stopped and restarted. The absolute deadline saturates
    /// rather than wrapping.
    pub fn start<F>(&self, lp: &mut EventLoop, cb: F, timeout: u64, repeat: u64)
    where
        F: Fn(&mut EventLoop, &Timer) + 'static,
    {
        self.start_rc(lp, Rc::new(cb), timeout, repeat);
    }

    fn start_rc(&self, lp: &mut EventLoop, cb: Rc<TimerCallback>, timeout: u64, repeat: u64) {
        if self.is_active() {
            self.stop(lp);
        }

        let entry = &self.entry;
        entry.timeout.set(lp.now().saturating_add(timeout));
        entry.repeat.set(repeat);
        let id = lp.wheel.next_start_id();
        entry.start_id.set(id);
        *entry.cb.borrow_mut() = Some(cb);

        lp.wheel.insert(entry.clone());
    }

    /// Disarm the timer. A no-op when the timer is not active;
    /// in particular, a callback may stop its own handle freely.
    pub fn stop(&self, lp: &mut EventLoop) {
        if self.entry.location.get() == Location::Detached {
            return;
        }

        let owner = self.entry.owner.borrow().upgrade();
        match owner {
            // The owning loop is gone along with its buckets.
            None => self.entry.location.set(Location::Detached),
            Some(ident) => {
                assert!(
                    Rc::ptr_eq(&ident, &lp.wheel.ident),
                    "timer is scheduled on a different loop"
                );
                lp.wheel.unlink(&self.entry);
            }
        }
    }

    /// Restart a repeating timer with `timeout = repeat`. A no-op for
    /// a non-repeating timer; fails if the timer was never started.
    pub fn again(&self, lp: &mut EventLoop) -> Result<(), TimerError> {
        let cb = match self.entry.cb.borrow().clone() {
            Some(cb) => cb,
            None => return Err(TimerError::NeverStarted),
        };

        let repeat = self.entry.repeat.get();
        if repeat != 0 {
            self.stop(lp);
            self.start_rc(lp, cb, repeat, repeat);
        }

        Ok(())
    }

    /// Set the repeat interval in milliseconds (`0` makes the timer
    /// one-shot). Takes effect the next time the timer is re-armed.
    pub fn set_repeat(&self, repeat: u64) {
        self.entry.repeat.set(repeat);
    }

    /// Current repeat interval in milliseconds.
    pub fn get_repeat(&self) -> u64 {
        self.entry.repeat.get()
    }

    /// Whether the timer is scheduled to fire.
    pub fn is_active(&self) -> bool {
        self.entry.location.get() != Location::Detached
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .field("timeout", &self.entry.timeout.get())
            .field("repeat", &self.entry.repeat.get())
            .finish()
    }
}
