// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The long-lived process handle: owns the control fd, decodes the event stream into state
//! transitions, and exposes the wait/signal/close surface callers actually use.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use nix::unistd::Pid;

use crate::error::Error;
use crate::protocol::{self, ChildCode, ChildEvent};
use crate::spawn::{self, SpawnRequest};

/// A supervised command, reachable through its control fd.
///
/// Dropping a `Process` closes the control fd, which tells the supervisor to tear down the
/// command and every descendant it has accumulated - the same scoped-release guarantee the
/// original API got from a context manager.
pub struct Process {
    control_fd: Option<OwnedFd>,
    pid: Option<Pid>,
    final_event: Option<ChildEvent>,
    childfree: bool,
    hangup: bool,
    saw_primary_death: bool,
}

/// Alias kept for readers coming from the original API, where this type is named `Handle`.
pub type Handle = Process;

impl Process {
    /// Spawn `req` and return a handle to it. The command's pid is not yet known when this
    /// returns; it becomes known asynchronously, the first time a pid-bearing event is decoded
    /// (see [`crate::dfork`]).
    pub fn new(req: SpawnRequest) -> Result<Process, Error> {
        let (control_fd, supervisor_pid) = spawn::dfork(req)?;
        log::debug!(
            "supervisor pid {supervisor_pid}, control fd {}",
            control_fd.as_raw_fd()
        );
        Ok(Process {
            control_fd: Some(control_fd),
            pid: None,
            final_event: None,
            childfree: false,
            hangup: false,
            saw_primary_death: false,
        })
    }

    #[cfg(test)]
    fn from_control_fd(control_fd: OwnedFd) -> Process {
        Process {
            control_fd: Some(control_fd),
            pid: None,
            final_event: None,
            childfree: false,
            hangup: false,
            saw_primary_death: false,
        }
    }

    /// The command's pid, once known. `None` until the first event arrives.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The control fd, or `-1` if this handle is already closed.
    pub fn fileno(&self) -> RawFd {
        self.control_fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// `true` once the control fd has been closed, whether by us or by hangup.
    pub fn closed(&self) -> bool {
        self.control_fd.is_none()
    }

    /// `true` once the supervisor has reported it has no remaining descendants to track.
    pub fn childfree(&self) -> bool {
        self.childfree
    }

    /// `true` if the control fd was seen closed without the primary child having reported a
    /// final status first.
    pub fn hangup(&self) -> bool {
        self.hangup
    }

    /// Drain every event currently available without blocking, and return the final status if
    /// one has been observed (by this call or an earlier one).
    ///
    /// Intermediate events (a stop/continue/trap for the primary, or anything for a descendant
    /// other than the primary) are consumed here too but not individually reported; use
    /// [`Process::next_event`] in a loop instead of `poll` to observe each one.
    pub fn poll(&mut self) -> Option<ChildEvent> {
        loop {
            match self.get_event() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("discarding malformed control-socket event: {err}");
                    break;
                }
            }
        }
        self.final_event
    }

    /// Return the next currently-available event without blocking, or `None` if there isn't one
    /// right now. Unlike [`Process::poll`], every event is surfaced here, including stops,
    /// continues, and traps, and events for descendants other than the primary child - `poll`
    /// only ever reports the primary's final status.
    ///
    /// # Errors
    ///
    /// Returns an error if the next datagram on the control socket is malformed.
    pub fn next_event(&mut self) -> Result<Option<ChildEvent>, Error> {
        self.get_event()
    }

    /// Block until the primary command has died, and return its final event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AbruptClose`] if the socket is closed before a final event for the
    /// primary child ever arrives.
    pub fn wait(&mut self) -> Result<ChildEvent, Error> {
        loop {
            if let Some(event) = self.final_event {
                return Ok(event);
            }
            if self.closed() {
                return Err(Error::AbruptClose);
            }
            self.block_until_readable()?;
            self.get_event()?;
        }
    }

    /// Block until the supervisor reports the whole descendant tree is gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AbruptClose`] if the socket hangs up without ever reporting a final
    /// event for the primary child.
    pub fn wait_tree(&mut self) -> Result<ChildEvent, Error> {
        loop {
            if self.closed() {
                return self.final_event.ok_or(Error::AbruptClose);
            }
            self.block_until_readable()?;
            self.get_event()?;
        }
    }

    /// Ask the supervisor to deliver `signal` to the primary child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] if the control fd has already been closed.
    pub fn send_signal(&mut self, signal: i32) -> Result<(), Error> {
        let fd = self
            .control_fd
            .as_ref()
            .ok_or(Error::AlreadyClosed)?
            .as_raw_fd();
        let pid = self.pid.map_or(0, Pid::as_raw);
        let frame = protocol::encode_signal(pid, signal);
        send(fd, &frame, MsgFlags::empty())
            .map_err(|e| Error::io_errno("sending signal over control socket", e))?;
        Ok(())
    }

    /// `send_signal(SIGTERM)`.
    pub fn terminate(&mut self) -> Result<(), Error> {
        self.send_signal(libc::SIGTERM)
    }

    /// `send_signal(SIGKILL)`.
    pub fn kill(&mut self) -> Result<(), Error> {
        self.send_signal(libc::SIGKILL)
    }

    /// Release the control fd. Always succeeds; if no final event has been observed yet, one is
    /// synthesized as "killed by SIGKILL" so callers always have a status to inspect.
    pub fn close(&mut self) {
        if self.control_fd.is_none() {
            return;
        }
        if self.final_event.is_none() {
            let pid = self.pid.map_or(0, Pid::as_raw);
            self.final_event = Some(protocol::signaled(ChildCode::Killed, pid, 0, libc::SIGKILL));
        }
        self.control_fd = None;
    }

    fn get_event(&mut self) -> Result<Option<ChildEvent>, Error> {
        let fd = match &self.control_fd {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(None),
        };

        let mut buf = [0u8; protocol::INBOUND_LEN];
        match recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => {
                self.on_hangup();
                Ok(None)
            }
            Ok(n) => {
                let event = protocol::decode_event(&buf[..n])?;
                self.apply_event(event);
                Ok(Some(event))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(errno) => Err(Error::io_errno("reading control socket", errno)),
        }
    }

    fn apply_event(&mut self, event: ChildEvent) {
        if self.pid.is_none() {
            self.pid = Some(Pid::from_raw(event.pid));
        }

        let is_primary = self.pid == Some(Pid::from_raw(event.pid));
        if is_primary && event.died() {
            self.final_event = Some(event);
            self.saw_primary_death = true;
        }
    }

    /// The supervisor closing the socket *is* the `childfree` signal in this crate's binary
    /// dialect (see `§4.5`): a hangup after the primary has already died means a clean shutdown,
    /// one before means the tree went away (or never came up) without telling us why.
    fn on_hangup(&mut self) {
        if self.saw_primary_death {
            self.childfree = true;
        } else {
            self.hangup = true;
        }
        self.control_fd = None;
    }

    fn block_until_readable(&self) -> Result<(), Error> {
        let fd = match &self.control_fd {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(()),
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::io("polling control socket", err));
        }
    }
}

impl AsRawFd for Process {
    fn as_raw_fd(&self) -> RawFd {
        self.fileno()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}
