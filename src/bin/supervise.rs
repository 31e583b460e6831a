// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A minimal `supervise` binary: the host side of the wire dialect in [`dfork::protocol`].
//!
//! This is a test fixture, not a production-grade process supervisor. It exists so this crate's
//! integration tests can exercise [`dfork::Process`] end-to-end without depending on an
//! externally installed `supervise` executable. `<statusfd>` and `<controlfd>` are always the
//! same descriptor in this crate's single-fork birth sequence; this binary doesn't distinguish
//! them.

use std::collections::HashSet;
use std::convert::TryFrom;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{recv, send, MsgFlags};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, pipe2, read, ForkResult, Pid};

use dfork::protocol::{self, ChildCode, ChildEvent};

static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = SELF_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8; 1];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn main() {
    let args: Vec<CString> = std::env::args_os()
        .map(|a| CString::new(a.as_bytes()).expect("argument contains an embedded NUL"))
        .collect();

    if args.len() < 4 {
        eprintln!("usage: supervise <statusfd> <controlfd> <argv...>");
        process::exit(2);
    }

    let control_fd: RawFd = args[2]
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .expect("controlfd argument must be an integer fd number");
    let command_argv = &args[3..];

    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }

    let (pipe_read, pipe_write) = pipe2(OFlag::O_NONBLOCK).expect("self-pipe for SIGCHLD");
    SELF_PIPE_WRITE.store(pipe_write.as_raw_fd(), Ordering::Relaxed);
    // Kept open for the life of the process; the static above is the only remaining reference.
    std::mem::forget(pipe_write);

    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.expect("install SIGCHLD handler");

    let primary_pid = match unsafe { fork() }.expect("fork primary command") {
        ForkResult::Child => {
            drop(pipe_read);
            let path = &command_argv[0];
            let argv_refs: Vec<&CStr> = command_argv.iter().map(CString::as_c_str).collect();
            let _ = execv(path, &argv_refs);
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => child,
    };

    run(control_fd, pipe_read.as_raw_fd(), primary_pid);
}

/// The supervisor's own event loop: wait for a `SIGCHLD` notification or a command from the
/// control socket, act on whichever is ready, repeat. Exits once `waitid` reports no
/// descendants remain at all - that loss of children is this crate's binary-dialect stand-in
/// for an explicit `no_children` message (see `dfork`'s module docs).
fn run(control_fd: RawFd, pipe_read: RawFd, primary_pid: Pid) -> ! {
    let uid = unsafe { libc::getuid() };
    let mut live: HashSet<Pid> = HashSet::new();
    live.insert(primary_pid);
    let mut control_open = true;

    loop {
        let mut pfds = vec![libc::pollfd {
            fd: pipe_read,
            events: libc::POLLIN,
            revents: 0,
        }];
        if control_open {
            pfds.push(libc::pollfd {
                fd: control_fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            panic!("poll on self-pipe/control socket failed: {err}");
        }

        if pfds[0].revents & libc::POLLIN != 0 {
            drain_self_pipe(pipe_read);
            reap_and_report(control_fd, uid, &mut live, control_open);
        }

        if control_open && pfds.len() > 1 && pfds[1].revents & libc::POLLIN != 0 {
            drain_commands(control_fd, primary_pid, &mut live, &mut control_open);
        }
    }
}

fn drain_self_pipe(pipe_read: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        match read(pipe_read, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) if n < buf.len() => break,
            Ok(_) => continue,
        }
    }
}

/// Drain every pending `waitid` status change, reporting each as an event; exit the process once
/// no descendants remain anywhere in the subreaper's tree.
fn reap_and_report(control_fd: RawFd, uid: libc::uid_t, live: &mut HashSet<Pid>, control_open: bool) {
    loop {
        let flags = WaitPidFlag::WEXITED
            | WaitPidFlag::WSTOPPED
            | WaitPidFlag::WCONTINUED
            | WaitPidFlag::WNOHANG;
        match waitid(Id::All, flags) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    match status {
                        WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                            live.remove(&pid);
                        }
                        _ => {
                            live.insert(pid);
                        }
                    }
                }
                if control_open {
                    if let Some(event) = to_event(status, uid) {
                        let frame = protocol::encode_event(&event);
                        let _ = send(control_fd, &frame, MsgFlags::empty());
                    }
                }
            }
            Err(nix::errno::Errno::ECHILD) => {
                let _ = nix::unistd::close(control_fd);
                process::exit(0);
            }
            Err(_) => break,
        }
    }
}

/// Drain every pending `send_signal` command from the control socket. A zero-length read means
/// the parent closed its end: kill everything we still believe is alive and stop polling the
/// socket (it keeps running only to finish reaping, then exits via [`reap_and_report`]).
fn drain_commands(control_fd: RawFd, primary_pid: Pid, live: &mut HashSet<Pid>, control_open: &mut bool) {
    let mut buf = [0u8; protocol::OUTBOUND_LEN];
    loop {
        match recv(control_fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => {
                *control_open = false;
                for pid in live.drain() {
                    let _ = kill(pid, Signal::SIGKILL);
                }
                let _ = kill(primary_pid, Signal::SIGKILL);
                break;
            }
            Ok(n) => {
                if let Ok((pid, signal)) = protocol::decode_signal(&buf[..n]) {
                    let target = if pid == 0 { primary_pid } else { Pid::from_raw(pid) };
                    if let Ok(sig) = Signal::try_from(signal) {
                        let _ = kill(target, sig);
                    }
                }
            }
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(_) => {
                *control_open = false;
                break;
            }
        }
    }
}

fn to_event(status: WaitStatus, uid: libc::uid_t) -> Option<ChildEvent> {
    match status {
        WaitStatus::Exited(pid, code) => Some(protocol::exited(pid.as_raw(), uid, code)),
        WaitStatus::Signaled(pid, signal, dumped) => {
            let code = if dumped { ChildCode::Dumped } else { ChildCode::Killed };
            Some(protocol::signaled(code, pid.as_raw(), uid, signal as i32))
        }
        WaitStatus::Stopped(pid, signal) => {
            Some(protocol::signaled(ChildCode::Stopped, pid.as_raw(), uid, signal as i32))
        }
        WaitStatus::Continued(pid) => Some(protocol::signaled(
            ChildCode::Continued,
            pid.as_raw(),
            uid,
            libc::SIGCONT,
        )),
        _ => None,
    }
}
