// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Flags applied to the control fd returned from [`crate::dfork`].

use nix::sys::socket::SockFlag;

bitflags::bitflags! {
    /// Flags recognized on the returned control fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpawnFlags: u32 {
        /// Set `FD_CLOEXEC` on the control fd.
        const CLOEXEC = 1 << 0;
        /// Set `O_NONBLOCK` on the control fd.
        const NONBLOCK = 1 << 1;
    }
}

impl Default for SpawnFlags {
    fn default() -> Self {
        SpawnFlags::CLOEXEC
    }
}

impl SpawnFlags {
    pub(crate) fn to_sock_flag(self) -> SockFlag {
        let mut flags = SockFlag::empty();
        if self.contains(SpawnFlags::CLOEXEC) {
            flags |= SockFlag::SOCK_CLOEXEC;
        }
        if self.contains(SpawnFlags::NONBLOCK) {
            flags |= SockFlag::SOCK_NONBLOCK;
        }
        flags
    }
}
