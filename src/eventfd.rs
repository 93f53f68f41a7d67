use std::io;
use std::os::unix::io::RawFd;
use std::{fmt, mem};

use log::debug;
use thiserror::Error;

/// Error creating the completion notification descriptor
#[derive(Error, Debug)]
pub enum NotifierError {
    /// `eventfd(2)` failed for a reason other than `ENOSYS`
    #[error("error creating eventfd: `{0}`")]
    CreateEventFd(#[source] io::Error),

    /// The pipe fallback could not be created either
    #[error("error creating fallback pipe: `{0}`")]
    CreatePipe(#[source] io::Error),
}

/// Descriptor the kernel signals when AIO completions become available.
///
/// Normally an `eventfd(2)` counter: a read yields the number of
/// completions accumulated since the previous read. On kernels without
/// eventfd a non-blocking pipe stands in and the count is the number of
/// raw bytes drained.
pub(crate) struct CompletionNotifier {
    read_fd: RawFd,
    /// Writable end of the fallback pipe; `-1` in eventfd mode.
    write_fd: RawFd,
}

impl CompletionNotifier {
    pub fn new() -> Result<CompletionNotifier, NotifierError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd >= 0 {
            return Ok(CompletionNotifier {
                read_fd: fd,
                write_fd: -1,
            });
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) {
            return Err(NotifierError::CreateEventFd(err));
        }

        debug!("eventfd unavailable, falling back to a pipe");

        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(NotifierError::CreatePipe(io::Error::last_os_error()));
        }

        Ok(CompletionNotifier {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    fn is_counter(&self) -> bool {
        self.write_fd == -1
    }

    /// Drain the descriptor fully and return the aggregate completion
    /// count. Must only be called once the poller has reported the
    /// descriptor readable.
    pub fn drain(&self) -> u64 {
        let mut buf = [0u8; 1024];
        let mut total: usize = 0;
        let mut counter: u64 = 0;

        loop {
            let r = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

            if r > 0 {
                if self.is_counter() {
                    for chunk in buf[..r as usize].chunks_exact(mem::size_of::<u64>()) {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        counter += u64::from_ne_bytes(raw);
                    }
                }
                total += r as usize;
            }

            if r == buf.len() as isize {
                continue;
            }

            if r != -1 {
                break;
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => panic!("completion notifier read failed: {}", err),
            }
        }

        if self.is_counter() {
            assert_eq!(
                mem::size_of::<u64>(),
                total,
                "eventfd read transferred {} bytes",
                total
            );
            counter
        } else {
            total as u64
        }
    }
}

impl fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("fd", &self.read_fd)
            .field("counter", &self.is_counter())
            .finish()
    }
}

impl Drop for CompletionNotifier {
    fn drop(&mut self) {
        if self.write_fd != -1 && self.write_fd != self.read_fd {
            unsafe { libc::close(self.write_fd) };
        }
        unsafe { libc::close(self.read_fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(fd: RawFd, n: u64) {
        let bytes = n.to_ne_bytes();
        let r = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(bytes.len() as isize, r);
    }

    #[test]
    fn counter_accumulates_signals() {
        let notifier = CompletionNotifier::new().unwrap();
        assert!(notifier.is_counter());

        signal(notifier.fd(), 3);
        signal(notifier.fd(), 4);

        assert_eq!(7, notifier.drain());
    }

    #[test]
    fn pipe_counts_raw_bytes() {
        let mut fds: [RawFd; 2] = [-1; 2];
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(0, r);

        let notifier = CompletionNotifier {
            read_fd: fds[0],
            write_fd: fds[1],
        };

        let payload = [0u8; 5];
        let written = unsafe {
            libc::write(
                notifier.write_fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(payload.len() as isize, written);

        assert_eq!(5, notifier.drain());
    }
}
