use std::io;

use thiserror::Error;

use crate::eventfd::NotifierError;

/// Error while bringing up the loop's AIO driver
#[derive(Error, Debug)]
pub enum AioSetupError {
    /// Could not create the completion notification descriptor
    #[error("completion notifier error: `{0}`")]
    Notifier(#[from] NotifierError),

    /// Error from `io_setup`
    #[error("io_setup error: `{0}`")]
    IoSetup(#[source] io::Error),
}

/// Error from submitting a file request
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The request carried no buffers, or more than [`MAX_SUBMIT`]
    ///
    /// [`MAX_SUBMIT`]: constant.MAX_SUBMIT.html
    #[error("buffer count `{0}` out of range")]
    InvalidBufferCount(usize),

    /// The loop's AIO driver is not running (no open handle)
    #[error("AIO driver stopped")]
    Stopped,
}

/// Timer operation error
#[derive(Error, Debug)]
pub enum TimerError {
    /// `again` called on a timer that was never started
    #[error("timer was never started")]
    NeverStarted,
}
