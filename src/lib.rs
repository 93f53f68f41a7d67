#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

//! Callback-driven event loop core for Linux.
//!
//! Two subsystems share the loop: a bridge to [Linux kernel-level
//! AIO](http://lse.sourceforge.net/io/aio.html), which submits vectored
//! file reads and writes to the kernel and demultiplexes their
//! completions back to per-request callbacks via an `eventfd`, and a
//! hierarchical timing wheel that schedules one-shot and repeating
//! millisecond timers with O(1) insertion and removal.
//!
//! Kernel-level AIO is different from the [Posix AIO
//! library](http://man7.org/linux/man-pages/man7/aio.7.html): the
//! latter is implemented with a pool of userland threads issuing
//! blocking system calls, while the kernel schedules the former
//! asynchronously against the underlying block device.
//!
//! Everything is single-threaded and cooperative. The loop blocks in
//! [`EventLoop::run_once`] until the nearest timer deadline or fd
//! readiness, then runs callbacks to completion on the calling thread.
//!
//! [`EventLoop::run_once`]: struct.EventLoop.html#method.run_once

pub use aio::{AioHandle, AioOp, FsCallback, FsRequest, IoBuf, MAX_SUBMIT};
pub use errors::{AioSetupError, SubmitError, TimerError};
pub use event_loop::{AioCallback, EventLoop};
pub use eventfd::NotifierError;
pub use flags::{ReadFlags, WriteFlags};
pub use timer::{Timer, TimerCallback};

mod aio;
mod errors;
mod event_loop;
mod eventfd;
mod flags;
mod poll;
mod sys;
mod timer;
