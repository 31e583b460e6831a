// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Classifying and coercing the values the rest of the crate treats as file descriptors or
//! paths. Nothing in this module ever mutates kernel state.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg};

use crate::error::Error;

/// One entry of an fd-map value: either an existing descriptor, an owned descriptor the caller
/// is handing over, or an instruction to close the target.
#[derive(Debug)]
pub enum FdSource {
    /// Use this raw, borrowed descriptor as the source. The caller retains ownership.
    Fd(RawFd),
    /// Use this owned descriptor as the source; it is consumed by the remap.
    Owned(OwnedFd),
    /// Close the target instead of remapping it.
    Close,
}

impl FdSource {
    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            FdSource::Fd(fd) => Some(*fd),
            FdSource::Owned(fd) => Some(fd.as_raw_fd()),
            FdSource::Close => None,
        }
    }
}

impl From<RawFd> for FdSource {
    fn from(fd: RawFd) -> Self {
        FdSource::Fd(fd)
    }
}

impl From<OwnedFd> for FdSource {
    fn from(fd: OwnedFd) -> Self {
        FdSource::Owned(fd)
    }
}

/// Return the file descriptor represented by `fil`: an integer is returned unchanged, anything
/// implementing [`AsRawFd`] has its descriptor extracted.
pub fn as_fd<T: AsRawFd>(fil: &T) -> RawFd {
    fil.as_raw_fd()
}

pub(crate) fn source_raw_fd(source: &FdSource) -> Option<RawFd> {
    source.raw_fd()
}

/// Check whether `fd` is currently open, by probing its descriptor flags with a no-op
/// `fcntl(F_GETFD)`. Any error (including `EBADF`) classifies the descriptor as closed.
pub fn is_open(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Coerce a path-like value to the byte string `execvp`/`chdir` expect.
///
/// Accepts anything that can be viewed as a filesystem path; rejects anything else with
/// [`Error::TypeError`] (in Rust this is effectively unreachable given the `AsRef<Path>` bound,
/// but the conversion to a NUL-terminated `CString` can still fail on an embedded NUL byte,
/// which we report the same way the original API reports non-path inputs).
pub fn as_path_bytes<P: AsRef<Path>>(p: P) -> Result<CString, Error> {
    CString::new(p.as_ref().as_os_str().as_bytes())
        .map_err(|_| Error::TypeError("path contains an embedded NUL byte".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn as_fd_passthrough() {
        let f = File::open("/dev/null").unwrap();
        assert_eq!(as_fd(&f), f.as_raw_fd());
    }

    #[test]
    fn is_open_true_for_open_fd() {
        let f = File::open("/dev/null").unwrap();
        assert!(is_open(f.as_raw_fd()));
    }

    #[test]
    fn is_open_false_for_closed_fd() {
        let fd = {
            let f = File::open("/dev/null").unwrap();
            f.as_raw_fd()
        };
        // `f` has been dropped, closing `fd`. Race-free because nothing else in this
        // single-threaded test can have reused the slot yet.
        assert!(!is_open(fd));
    }

    #[test]
    fn path_bytes_rejects_embedded_nul() {
        assert!(as_path_bytes("bad\0path").is_err());
    }

    #[test]
    fn path_bytes_accepts_normal_path() {
        assert_eq!(as_path_bytes("/dev/null").unwrap().as_bytes(), b"/dev/null");
    }
}
