// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error kinds raised by this crate.
//!
//! Every error a caller can observe from [`crate::Process::new`] or from the later lifetime of
//! a [`crate::Process`] is represented here. Spawn-time failures are synchronous; failures that
//! occur after `fork()` surface later, as a hangup on the control fd, rather than as a
//! returned `Error`.

use std::io;

use nix::errno::Errno;

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `argv[0]` or the `supervise` binary could not be located on `PATH`.
    #[error("executable not found on PATH: {0}")]
    NotFound(String),

    /// An fd-map source referred to a descriptor that was not open.
    #[error("fds[{target}] refers to a closed file descriptor: {source_fd}")]
    InvalidValue {
        /// The target descriptor whose source was invalid.
        target: i32,
        /// The source descriptor that was not open.
        source_fd: i32,
    },

    /// An argument did not satisfy the type contract (e.g. an empty `argv`).
    #[error("{0}")]
    TypeError(String),

    /// A syscall failed: socket, fork, dup2, chdir, or exec.
    #[error("io failure during {context}: {source}")]
    IoFailure {
        /// Human-readable description of what was being attempted.
        context: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `send_signal` (or `terminate`/`kill`) was called after the control fd was closed.
    #[error("control fd is already closed")]
    AlreadyClosed,

    /// `wait`/`wait_tree` observed hangup before a final event for the primary child arrived.
    #[error("process was abruptly closed; no final status is available")]
    AbruptClose,
}

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Error {
        Error::IoFailure { context, source }
    }

    pub(crate) fn io_errno(context: &'static str, errno: Errno) -> Error {
        Error::IoFailure {
            context,
            source: io::Error::from(errno),
        }
    }
}

/// Convenience alias used throughout this crate's public API.
pub type Result<T> = std::result::Result<T, Error>;

// Kept for parity with the teacher crate's bare-`io::Result` surface where a caller wants to
// erase our error type down to `std::io::Error`.
impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoFailure { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

