use bitflags::bitflags;

use crate::sys;

bitflags! {
    /// Per-request write flags. See [`io_submit`](http://man7.org/linux/man-pages/man2/io_submit.2.html)
    pub struct WriteFlags: u32 {
        /// Append data to the end of the file, as `O_APPEND` in
        /// [`open(2)`]. The request offset is ignored and the file
        /// offset is not changed.
        ///
        /// [`open(2)`]: http://man7.org/linux/man-pages/man2/open.2.html
        const APPEND = sys::RWF_APPEND;

        /// Write completes according to synchronized I/O data
        /// integrity, as `O_DSYNC` in [`open(2)`].
        ///
        /// [`open(2)`]: http://man7.org/linux/man-pages/man2/open.2.html
        const DSYNC = sys::RWF_DSYNC;

        /// High priority request, poll if possible
        const HIPRI = sys::RWF_HIPRI;

        /// Don't wait if the I/O will block, e.g. for file block
        /// allocations or dirty page flush; the completion carries
        /// `-EAGAIN` in its `res` field instead.
        const NOWAIT = sys::RWF_NOWAIT;

        /// Write completes according to synchronized I/O file
        /// integrity, as `O_SYNC` in [`open(2)`].
        ///
        /// [`open(2)`]: http://man7.org/linux/man-pages/man2/open.2.html
        const SYNC = sys::RWF_SYNC;
    }
}

bitflags! {
    /// Per-request read flags. See [`io_submit`](http://man7.org/linux/man-pages/man2/io_submit.2.html)
    pub struct ReadFlags: u32 {
        /// High priority request, poll if possible
        const HIPRI = sys::RWF_HIPRI;

        /// Don't wait if the I/O will block, e.g. for file block
        /// allocations or dirty page flush; the completion carries
        /// `-EAGAIN` in its `res` field instead.
        const NOWAIT = sys::RWF_NOWAIT;
    }
}
