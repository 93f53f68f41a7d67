use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::{fmt, mem};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use log::{debug, trace};

use crate::errors::{AioSetupError, SubmitError};
use crate::event_loop::{AioCallback, EventLoop};
use crate::eventfd::CompletionNotifier;
use crate::flags::{ReadFlags, WriteFlags};
use crate::poll::{Events, IoCallback};
use crate::sys;

/// Kernel context depth requested at setup.
pub(crate) const NR_EVENTS: usize = 8192;

/// Most control blocks a single request may carry.
pub const MAX_SUBMIT: usize = 64;

/// Operation performed by an [`FsRequest`].
///
/// [`FsRequest`]: struct.FsRequest.html
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AioOp {
    /// Positioned vectored read
    Read,

    /// Positioned vectored write
    Write,
}

impl AioOp {
    #[inline]
    fn opcode(self) -> u16 {
        match self {
            AioOp::Read => sys::IOCB_CMD_PREAD,
            AioOp::Write => sys::IOCB_CMD_PWRITE,
        }
    }
}

/// Owned I/O buffer with a stable heap address, safe to hand to the
/// kernel while the owning request is in flight.
pub struct IoBuf {
    bytes: Box<[u8]>,
}

impl IoBuf {
    /// Allocate a zeroed buffer of `size` bytes.
    pub fn with_size(size: usize) -> IoBuf {
        IoBuf {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Buffer capacity in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for IoBuf {
    fn from(bytes: Vec<u8>) -> IoBuf {
        IoBuf {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl AsRef<[u8]> for IoBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsMut<[u8]> for IoBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IoBuf").field("len", &self.len()).finish()
    }
}

/// Callback fired exactly once when every buffer of a request has
/// completed. Receives the finished request back, buffers included.
pub type FsCallback = dyn FnOnce(&mut EventLoop, FsRequest);

/// A vectored file read or write in flight through the kernel AIO
/// context. One control block is submitted per buffer; the request
/// completes when the last of them does.
pub struct FsRequest {
    file: RawFd,
    op: AioOp,
    offset: i64,
    rw_flags: u32,
    bufs: Vec<IoBuf>,
    iocbs: Option<Box<[sys::iocb]>>,
    outstanding: u32,
    result: i64,
    failed: bool,
    cb: Option<Box<FsCallback>>,
}

impl FsRequest {
    /// Build a read of `bufs` from `file` starting at `offset`.
    ///
    /// The caller must keep `file` open until the callback fires.
    pub fn read<F>(file: &impl AsRawFd, offset: i64, bufs: Vec<IoBuf>, cb: F) -> FsRequest
    where
        F: FnOnce(&mut EventLoop, FsRequest) + 'static,
    {
        FsRequest::new(AioOp::Read, file.as_raw_fd(), offset, bufs, Box::new(cb))
    }

    /// Build a write of `bufs` to `file` starting at `offset`.
    ///
    /// The caller must keep `file` open until the callback fires.
    pub fn write<F>(file: &impl AsRawFd, offset: i64, bufs: Vec<IoBuf>, cb: F) -> FsRequest
    where
        F: FnOnce(&mut EventLoop, FsRequest) + 'static,
    {
        FsRequest::new(AioOp::Write, file.as_raw_fd(), offset, bufs, Box::new(cb))
    }

    fn new(op: AioOp, file: RawFd, offset: i64, bufs: Vec<IoBuf>, cb: Box<FsCallback>) -> FsRequest {
        FsRequest {
            file,
            op,
            offset,
            rw_flags: 0,
            bufs,
            iocbs: None,
            outstanding: 0,
            result: 0,
            failed: false,
            cb: Some(cb),
        }
    }

    /// Apply [`ReadFlags`] to every control block of this request.
    ///
    /// [`ReadFlags`]: struct.ReadFlags.html
    pub fn read_flags(mut self, flags: ReadFlags) -> FsRequest {
        debug_assert_eq!(AioOp::Read, self.op);
        self.rw_flags = flags.bits();
        self
    }

    /// Apply [`WriteFlags`] to every control block of this request.
    ///
    /// [`WriteFlags`]: struct.WriteFlags.html
    pub fn write_flags(mut self, flags: WriteFlags) -> FsRequest {
        debug_assert_eq!(AioOp::Write, self.op);
        self.rw_flags = flags.bits();
        self
    }

    /// Operation this request performs.
    pub fn op(&self) -> AioOp {
        self.op
    }

    /// Starting file offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Aggregate outcome: the summed byte count of all completions on
    /// success, or the error of the first failed completion.
    pub fn result(&self) -> Result<u64, io::Error> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result as i32))
        } else {
            Ok(self.result as u64)
        }
    }

    /// The request's buffers.
    pub fn bufs(&self) -> &[IoBuf] {
        &self.bufs
    }

    /// Consume the request, reclaiming its buffers.
    pub fn into_bufs(self) -> Vec<IoBuf> {
        self.bufs
    }

    /// Fold one completion into the aggregate result. The first failed
    /// completion latches: its `res` becomes the result and later
    /// successes are not summed. Returns `true` once every control
    /// block has completed.
    fn apply_completion(&mut self, res: i64, res2: i64) -> bool {
        if !self.failed {
            if res2 == 0 && res >= 0 {
                self.result += res;
            } else {
                self.failed = true;
                self.result = res;
            }
        }

        self.outstanding -= 1;
        self.outstanding == 0
    }
}

impl fmt::Debug for FsRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FsRequest")
            .field("op", &self.op)
            .field("file", &self.file)
            .field("offset", &self.offset)
            .field("nbufs", &self.bufs.len())
            .field("outstanding", &self.outstanding)
            .field("result", &self.result)
            .finish()
    }
}

/// In-flight slot owned by the driver's outstanding list. Its address
/// rides in `aio_data` so completions find their request; the list
/// keeps the box alive until the last completion arrives.
pub(crate) struct InFlight {
    link: LinkedListLink,
    req: RefCell<Option<FsRequest>>,
}

intrusive_adapter!(InFlightAdapter = Box<InFlight>: InFlight { link: LinkedListLink });

/// Per-loop AIO watcher: the kernel context, the completion notifier
/// registered with the poller, and the outstanding-request list.
pub(crate) struct AioDriver {
    ctx: sys::aio_context_t,
    notifier: CompletionNotifier,
    outstanding: LinkedList<InFlightAdapter>,
}

impl AioDriver {
    fn new() -> Result<AioDriver, AioSetupError> {
        let notifier = CompletionNotifier::new()?;

        let mut ctx: sys::aio_context_t = 0;
        if unsafe { sys::io_setup(NR_EVENTS as libc::c_long, &mut ctx) } != 0 {
            return Err(AioSetupError::IoSetup(io::Error::last_os_error()));
        }

        debug!(
            "kernel aio context ready, {} slots, notifier fd {}",
            NR_EVENTS,
            notifier.fd()
        );

        Ok(AioDriver {
            ctx,
            notifier,
            outstanding: LinkedList::new(InFlightAdapter::new()),
        })
    }

    pub fn notifier_fd(&self) -> RawFd {
        self.notifier.fd()
    }
}

impl Drop for AioDriver {
    fn drop(&mut self) {
        // io_destroy cancels requests still in the kernel and waits on
        // them, so the outstanding boxes are released only afterwards.
        let result = unsafe { sys::io_destroy(self.ctx) };
        assert_eq!(0, result, "io_destroy returned bad code");
    }
}

impl fmt::Debug for AioDriver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AioDriver")
            .field("notifier", &self.notifier)
            .finish()
    }
}

/// Registration of one completion-count consumer on a loop.
///
/// Creating the first handle brings up the loop's AIO driver; closing
/// the last one destroys the kernel context. Whenever completions
/// accumulate, every open handle's callback receives the count and is
/// expected to call [`EventLoop::process_completions`] with it.
///
/// [`EventLoop::process_completions`]: struct.EventLoop.html#method.process_completions
#[derive(Debug)]
pub struct AioHandle {
    id: u64,
}

impl AioHandle {
    /// Register a consumer, setting up the loop's AIO driver if this
    /// is the first one.
    pub fn new<F>(lp: &mut EventLoop, cb: F) -> Result<AioHandle, AioSetupError>
    where
        F: Fn(&mut EventLoop, u64) + 'static,
    {
        lp.ensure_aio()?;

        let id = lp.next_aio_handle_id;
        lp.next_aio_handle_id += 1;
        let cb: Rc<AioCallback> = Rc::new(cb);
        lp.aio_handles.push((id, cb));

        Ok(AioHandle { id })
    }

    /// Commit `req` for asynchronous execution. All of its control
    /// blocks enter the kernel atomically; a partial submission aborts,
    /// since continuing would corrupt request accounting.
    pub fn submit(&self, lp: &mut EventLoop, mut req: FsRequest) -> Result<(), SubmitError> {
        let nbufs = req.bufs.len();
        if nbufs == 0 || nbufs > MAX_SUBMIT {
            return Err(SubmitError::InvalidBufferCount(nbufs));
        }

        let driver = lp.aio.as_mut().ok_or(SubmitError::Stopped)?;

        if req.offset < 0 {
            req.offset = 0;
        }

        let resfd = driver.notifier.fd();
        let mut offset = req.offset;
        let mut iocbs = Vec::with_capacity(nbufs);

        for buf in req.bufs.iter_mut() {
            let mut block = sys::iocb::default();
            block.aio_fildes = req.file as u32;
            block.aio_lio_opcode = req.op.opcode();
            block.aio_rw_flags = req.rw_flags as i32;
            block.aio_buf = buf.as_mut().as_mut_ptr() as u64;
            block.aio_nbytes = buf.len() as u64;
            block.aio_offset = offset;
            block.aio_flags = sys::IOCB_FLAG_RESFD;
            block.aio_resfd = resfd as u32;

            offset += buf.len() as i64;
            iocbs.push(block);
        }

        req.outstanding = nbufs as u32;
        req.result = 0;
        req.failed = false;

        let mut iocbs = iocbs.into_boxed_slice();

        let slot = Box::new(InFlight {
            link: LinkedListLink::new(),
            req: RefCell::new(None),
        });
        let tag = &*slot as *const InFlight as u64;
        for block in iocbs.iter_mut() {
            block.aio_data = tag;
        }

        let mut ptrs: Vec<*mut sys::iocb> =
            iocbs.iter_mut().map(|block| block as *mut sys::iocb).collect();

        req.iocbs = Some(iocbs);
        *slot.req.borrow_mut() = Some(req);
        driver.outstanding.push_back(slot);

        trace!("submitting {} control blocks", nbufs);
        let submitted = unsafe { sys::io_submit(driver.ctx, nbufs as libc::c_long, ptrs.as_mut_ptr()) };
        if submitted != nbufs as libc::c_long {
            panic!(
                "io_submit accepted {} of {} control blocks: {}",
                submitted,
                nbufs,
                io::Error::last_os_error()
            );
        }

        Ok(())
    }

    /// Unregister this consumer. Closing the last handle tears the
    /// driver down.
    pub fn close(&self, lp: &mut EventLoop) {
        lp.aio_handles.retain(|(id, _)| *id != self.id);

        if lp.aio_handles.is_empty() {
            if let Some(driver) = lp.aio.take() {
                debug!("last aio handle closed, destroying kernel context");
                lp.poller.unregister(driver.notifier_fd());
                mem::drop(driver);
            }
        }
    }
}

impl EventLoop {
    fn ensure_aio(&mut self) -> Result<(), AioSetupError> {
        if self.aio.is_some() {
            return Ok(());
        }

        let driver = AioDriver::new()?;
        let fd = driver.notifier_fd();
        self.aio = Some(driver);

        let on_readable: IoCallback = Rc::new(|lp: &mut EventLoop, _events: Events| {
            let count = match lp.aio.as_ref() {
                Some(driver) => driver.notifier.drain(),
                None => return,
            };
            if count == 0 {
                return;
            }

            let callbacks: Vec<Rc<AioCallback>> =
                lp.aio_handles.iter().map(|(_, cb)| cb.clone()).collect();
            for cb in callbacks {
                cb(lp, count);
            }
        });
        self.poller.register(fd, Events::READABLE, on_readable);

        Ok(())
    }

    /// Drain up to `count` completion events from the kernel and
    /// deliver them to their requests. Intended to be called from an
    /// [`AioHandle`] callback with the count it received.
    ///
    /// [`AioHandle`]: struct.AioHandle.html
    pub fn process_completions(&mut self, count: u64) {
        let mut events: Vec<sys::io_event> = Vec::with_capacity(count as usize);
        let mut remaining = count;

        while remaining > 0 {
            let ctx = match self.aio.as_ref() {
                Some(driver) => driver.ctx,
                None => return,
            };

            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            let received = unsafe {
                sys::io_getevents(
                    ctx,
                    1,
                    remaining as libc::c_long,
                    events.as_mut_ptr(),
                    &mut ts,
                )
            };

            if received < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("io_getevents failed: {}", err);
            }
            if received == 0 {
                return;
            }

            unsafe { events.set_len(received as usize) };
            trace!("harvested {} of {} completion events", received, remaining);

            for event in &events {
                self.apply_event(event);
            }

            remaining -= received as u64;
        }
    }

    fn apply_event(&mut self, event: &sys::io_event) {
        let slot_ptr = event.data as usize as *const InFlight;

        let finished = {
            let slot = unsafe { &*slot_ptr };
            let mut req = slot.req.borrow_mut();
            let req = req
                .as_mut()
                .expect("completion for a request that already finished");
            req.apply_completion(event.res, event.res2)
        };

        if finished {
            let driver = self.aio.as_mut().expect("completion without a driver");
            let slot = {
                let mut cursor = unsafe { driver.outstanding.cursor_mut_from_ptr(slot_ptr) };
                cursor
                    .remove()
                    .expect("finished request missing from the outstanding list")
            };

            let mut req = slot
                .req
                .into_inner()
                .expect("finished request slot is empty");
            req.iocbs = None;

            if let Some(cb) = req.cb.take() {
                cb(self, req);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::{AsRawFd, RawFd};

    use super::*;

    struct Fd(RawFd);

    impl AsRawFd for Fd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    fn in_flight_request(nbufs: u32) -> FsRequest {
        let bufs = (0..nbufs).map(|_| IoBuf::with_size(16)).collect();
        let mut req = FsRequest::read(&Fd(0), 0, bufs, |_, _| {});
        req.outstanding = nbufs;
        req
    }

    #[test]
    fn successful_completions_sum_into_result() {
        let mut req = in_flight_request(3);

        assert!(!req.apply_completion(4, 0));
        assert!(!req.apply_completion(5, 0));
        assert!(req.apply_completion(6, 0));

        assert_eq!(15, req.result().unwrap());
    }

    #[test]
    fn first_failure_latches_the_result() {
        let mut req = in_flight_request(3);

        assert!(!req.apply_completion(4, 0));
        assert!(!req.apply_completion(-libc::EIO as i64, 0));
        assert!(req.apply_completion(7, 0));

        assert_eq!(
            libc::EIO,
            req.result().unwrap_err().raw_os_error().unwrap()
        );
    }

    #[test]
    fn later_failures_do_not_overwrite_the_first() {
        let mut req = in_flight_request(2);

        req.apply_completion(-libc::EIO as i64, 0);
        req.apply_completion(-libc::EBADF as i64, 0);

        assert_eq!(
            libc::EIO,
            req.result().unwrap_err().raw_os_error().unwrap()
        );
    }

    #[test]
    fn nonzero_res2_freezes_summing() {
        let mut req = in_flight_request(3);

        req.apply_completion(4, 0);
        req.apply_completion(0, 22);
        req.apply_completion(7, 0);

        // The failing event's res is the final result, later successes
        // are not summed.
        assert_eq!(0, req.result().unwrap());
    }
}
