// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The binary wire dialect spoken over the control socket: fixed-size, `repr(C)` records
//! mirroring the relevant fields of `siginfo_t` inbound, and a `(pid, signal)` pair outbound.
//!
//! Each `SOCK_SEQPACKET` datagram carries exactly one message; this module never needs to
//! buffer partial frames.

use std::convert::TryInto;

use libc::{pid_t, uid_t};

use crate::error::Error;

/// One of the POSIX `si_code` values a `SIGCHLD` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCode {
    /// The child called `_exit(2)` (or returned from `main`).
    Exited,
    /// The child was killed by a signal.
    Killed,
    /// The child was killed by a signal and dumped core.
    Dumped,
    /// The child was stopped by a signal.
    Stopped,
    /// A traced child trapped.
    Trapped,
    /// The child was continued by `SIGCONT`.
    Continued,
}

impl ChildCode {
    fn from_raw(code: i32) -> Option<ChildCode> {
        match code {
            libc::CLD_EXITED => Some(ChildCode::Exited),
            libc::CLD_KILLED => Some(ChildCode::Killed),
            libc::CLD_DUMPED => Some(ChildCode::Dumped),
            libc::CLD_STOPPED => Some(ChildCode::Stopped),
            libc::CLD_TRAPPED => Some(ChildCode::Trapped),
            libc::CLD_CONTINUED => Some(ChildCode::Continued),
            _ => None,
        }
    }
}

/// A decoded record describing one transition of one descendant process, as reported by the
/// supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEvent {
    pub code: ChildCode,
    pub pid: pid_t,
    pub uid: uid_t,
    exit_status: Option<i32>,
    signal: Option<i32>,
}

impl ChildEvent {
    /// `true` if this event means the child is no longer alive.
    pub fn died(&self) -> bool {
        matches!(
            self.code,
            ChildCode::Exited | ChildCode::Killed | ChildCode::Dumped
        )
    }

    /// `true` if the child exited normally with status 0.
    pub fn clean(&self) -> bool {
        self.code == ChildCode::Exited && self.exit_status == Some(0)
    }

    /// The exit status, present iff `code == Exited`.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// The signal number, present iff `code` is one of the signal-carrying variants.
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// The signal the child was killed with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeError`] if `code` is not `Killed` or `Dumped`.
    pub fn killed_with(&self) -> Result<i32, Error> {
        match self.code {
            ChildCode::Killed | ChildCode::Dumped => Ok(self.signal.expect("invariant: signal present for Killed/Dumped")),
            _ => Err(Error::TypeError(
                "child wasn't killed with a signal".into(),
            )),
        }
    }
}

/// Size of the inbound wire record: `si_code`, `si_pid`, `si_uid`, `si_status`, each a 4-byte
/// field (matching the `cffi` struct definition this dialect was lifted from).
pub const INBOUND_LEN: usize = 16;
/// Size of the outbound `(pid, signal)` record.
pub const OUTBOUND_LEN: usize = 8;

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

/// Decode one inbound datagram. An empty `buf` means hangup/EOF and is represented as `Ok(None)`
/// by the caller (see [`crate::handle::Process`]'s internal event loop), not by this function -
/// decoding an actually-empty-but-present frame would be a protocol violation.
pub fn decode_event(buf: &[u8]) -> Result<ChildEvent, Error> {
    if buf.len() != INBOUND_LEN {
        return Err(Error::IoFailure {
            context: "decoding control-socket event",
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected a {INBOUND_LEN}-byte frame, got {}", buf.len()),
            ),
        });
    }

    let si_code = read_i32(buf, 0);
    let si_pid = read_i32(buf, 4) as pid_t;
    let si_uid = read_i32(buf, 8) as uid_t;
    let si_status = read_i32(buf, 12);

    let code = ChildCode::from_raw(si_code).ok_or_else(|| Error::IoFailure {
        context: "decoding control-socket event",
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown si_code {si_code}"),
        ),
    })?;

    let (exit_status, signal) = match code {
        ChildCode::Exited => (Some(si_status), None),
        _ => (None, Some(si_status)),
    };

    Ok(ChildEvent {
        code,
        pid: si_pid,
        uid: si_uid,
        exit_status,
        signal,
    })
}

/// Encode an outbound `send_signal` command.
pub fn encode_signal(pid: pid_t, signal: i32) -> [u8; OUTBOUND_LEN] {
    let mut buf = [0u8; OUTBOUND_LEN];
    write_i32(&mut buf, 0, pid);
    write_i32(&mut buf, 4, signal);
    buf
}

/// Decode an outbound `(pid, signal)` record. Used by the test-fixture supervisor, which is the
/// other end of this protocol.
pub fn decode_signal(buf: &[u8]) -> Result<(pid_t, i32), Error> {
    if buf.len() != OUTBOUND_LEN {
        return Err(Error::IoFailure {
            context: "decoding control-socket command",
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected an {OUTBOUND_LEN}-byte frame, got {}", buf.len()),
            ),
        });
    }
    Ok((read_i32(buf, 0) as pid_t, read_i32(buf, 4)))
}

/// Encode an inbound event. Used by the test-fixture supervisor to report status to a real
/// [`crate::Process`], and by this crate's own tests to synthesize events without forking.
pub fn encode_event(event: &ChildEvent) -> [u8; INBOUND_LEN] {
    let si_code = match event.code {
        ChildCode::Exited => libc::CLD_EXITED,
        ChildCode::Killed => libc::CLD_KILLED,
        ChildCode::Dumped => libc::CLD_DUMPED,
        ChildCode::Stopped => libc::CLD_STOPPED,
        ChildCode::Trapped => libc::CLD_TRAPPED,
        ChildCode::Continued => libc::CLD_CONTINUED,
    };
    let si_status = event.exit_status.or(event.signal).unwrap_or(0);
    let mut buf = [0u8; INBOUND_LEN];
    write_i32(&mut buf, 0, si_code);
    write_i32(&mut buf, 4, event.pid);
    write_i32(&mut buf, 8, event.uid as i32);
    write_i32(&mut buf, 12, si_status);
    buf
}

/// Construct an `Exited` event (exposed for the fixture binary and this crate's own tests).
pub fn exited(pid: pid_t, uid: uid_t, status: i32) -> ChildEvent {
    ChildEvent {
        code: ChildCode::Exited,
        pid,
        uid,
        exit_status: Some(status),
        signal: None,
    }
}

/// Construct a signal-carrying event (`Killed`/`Dumped`/`Stopped`/`Trapped`/`Continued`).
pub fn signaled(code: ChildCode, pid: pid_t, uid: uid_t, signal: i32) -> ChildEvent {
    debug_assert_ne!(code, ChildCode::Exited);
    ChildEvent {
        code,
        pid,
        uid,
        exit_status: None,
        signal: Some(signal),
    }
}
