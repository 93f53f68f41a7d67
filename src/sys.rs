#![allow(non_camel_case_types)]

use libc::{c_long, syscall, timespec};

pub type aio_context_t = libc::c_ulong;

/*
 * Opcodes and flags from include/uapi/linux/aio_abi.h
 */

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;

/* Set if aio_resfd carries an eventfd to signal on completion. */
pub const IOCB_FLAG_RESFD: u32 = 1;

/*
 * Per-IO flags for aio_rw_flags, extracted from
 * https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/fs.h
 */

/* high priority request, poll if possible */
pub const RWF_HIPRI: u32 = 0x1;

/* per-IO O_DSYNC */
pub const RWF_DSYNC: u32 = 0x2;

/* per-IO O_SYNC */
pub const RWF_SYNC: u32 = 0x4;

/* per-IO, return -EAGAIN if operation would block */
pub const RWF_NOWAIT: u32 = 0x8;

/* per-IO O_APPEND */
pub const RWF_APPEND: u32 = 0x10;

/// Control block handed to [`io_submit`]. Layout matches
/// `struct iocb` in `include/uapi/linux/aio_abi.h`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct iocb {
    pub aio_data: u64,

    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    #[cfg(target_endian = "little")]
    pub aio_rw_flags: i32,

    #[cfg(target_endian = "big")]
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,

    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

/// Completion record harvested by [`io_getevents`]. Layout matches
/// `struct io_event` in `include/uapi/linux/aio_abi.h`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct io_event {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

// -----------------------------------------------------------------------------------------------
// Inline functions that wrap the kernel calls for the entry points corresponding to Linux
// AIO functions
// -----------------------------------------------------------------------------------------------

// Initialize an AIO context for a given submission queue size within the kernel.
//
// See [io_setup(2)](http://man7.org/linux/man-pages/man2/io_setup.2.html) for details.
#[inline(always)]
pub unsafe fn io_setup(nr: c_long, ctxp: *mut aio_context_t) -> c_long {
    syscall(libc::SYS_io_setup, nr, ctxp)
}

// Destroy an AIO context.
//
// See [io_destroy(2)](http://man7.org/linux/man-pages/man2/io_destroy.2.html) for details.
#[inline(always)]
pub unsafe fn io_destroy(ctx: aio_context_t) -> c_long {
    syscall(libc::SYS_io_destroy, ctx)
}

// Submit a batch of IO operations.
//
// See [io_submit(2)](http://man7.org/linux/man-pages/man2/io_submit.2.html) for details.
#[inline(always)]
pub unsafe fn io_submit(ctx: aio_context_t, nr: c_long, iocbpp: *mut *mut iocb) -> c_long {
    syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

// Retrieve completion events for previously submitted IO requests.
//
// See [io_getevents(2)](http://man7.org/linux/man-pages/man2/io_getevents.2.html) for details.
#[inline(always)]
pub unsafe fn io_getevents(
    ctx: aio_context_t,
    min_nr: c_long,
    max_nr: c_long,
    events: *mut io_event,
    timeout: *mut timespec,
) -> c_long {
    syscall(libc::SYS_io_getevents, ctx, min_nr, max_nr, events, timeout)
}
