// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! dfork launches a child process behind a small supervisor so that the whole tree of
//! descendants it spawns can be tracked and torn down from a single control file descriptor,
//! rather than from a single pid.
//!
//! The supervisor is a separate executable (named `supervise`, looked up on `PATH`) that this
//! crate forks into. It reports every descendant's exit as a fixed-size binary record over a
//! `SOCK_SEQPACKET` socket pair and accepts signal-delivery requests the same way, so a caller
//! never has to reach for `/proc` or `waitpid` directly.
//!
//! ```no_run
//! use dfork::{Process, SpawnRequest};
//!
//! let mut child = Process::new(SpawnRequest::new(["sleep", "10"]).build())?;
//! child.terminate()?;
//! let status = child.wait()?;
//! assert!(status.died());
//! # Ok::<(), dfork::Error>(())
//! ```

mod error;
mod fdutil;
mod flags;
mod handle;
/// The wire dialect spoken over the control socket.
///
/// Exposed publicly so that an alternative `supervise` binary (this crate ships one as a test
/// fixture, see `src/bin/supervise.rs`) can encode and decode frames using the same codec this
/// crate's own `Process` decodes with, instead of duplicating the byte layout.
pub mod protocol;
mod remap;
mod spawn;
mod which;

pub use error::{Error, Result};
pub use fdutil::{as_fd, is_open, FdSource};
pub use flags::SpawnFlags;
pub use handle::{Handle, Process};
pub use protocol::{ChildCode, ChildEvent};
pub use spawn::{dfork, SpawnRequest, SpawnRequestBuilder};
pub use which::{which, which_in};

use nix::sys::signal::{signal, SigHandler, Signal};

/// Set `SIGCHLD`'s disposition to `SIG_IGN` for the whole process.
///
/// This is a convenience wrapper, not something the crate itself relies on: a caller using only
/// [`Process::wait`]/[`Process::wait_tree`] never needs to touch `SIGCHLD`, since those reap
/// through the supervisor's own reporting rather than through `waitpid` on the command's pid
/// directly. It exists for callers who also launch unmanaged children with
/// [`std::process::Command`] and want to avoid accumulating zombies without polling them.
///
/// # Safety
///
/// Installing a signal disposition is process-global and races with anything else in the
/// process that reads or writes `SIGCHLD`'s disposition.
pub unsafe fn ignore_sigchld() -> nix::Result<SigHandler> {
    signal(Signal::SIGCHLD, SigHandler::SigIgn)
}
