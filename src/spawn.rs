// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The spawn pipeline: validates a [`SpawnRequest`], creates the control socket, and forks off
//! the supervisor.

use std::collections::HashMap;
use std::env;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::OnceLock;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{chdir, execve, fork, setsid, ForkResult, Pid};

use crate::error::Error;
use crate::fdutil::{as_path_bytes, FdSource};
use crate::flags::SpawnFlags;
use crate::remap::{self, FdMapping};
use crate::which::which_in;

/// The name of the external supervisor binary this crate execs into after forking.
pub const SUPERVISOR_NAME: &str = "supervise";

fn supervisor_path() -> Result<&'static PathBuf, Error> {
    static SUPERVISOR_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
    SUPERVISOR_PATH
        .get_or_init(|| which_in(SUPERVISOR_NAME, &env::var_os("PATH").unwrap_or_default()))
        .as_ref()
        .ok_or_else(|| Error::NotFound(SUPERVISOR_NAME.to_string()))
}

/// A request to spawn a supervised command.
///
/// Build one directly, or via [`SpawnRequestBuilder`].
pub struct SpawnRequest {
    /// `argv[0]` is resolved against `PATH` at spawn time; it need not already be absolute.
    pub argv: Vec<Vec<u8>>,
    /// Updates applied onto the inherited environment; this is never a full replacement.
    pub env: HashMap<String, String>,
    /// `target -> source` fd updates applied in the command's process, post-fork, pre-exec.
    pub fds: HashMap<RawFd, FdSource>,
    /// Working directory for the command, if different from the caller's.
    pub cwd: Option<PathBuf>,
    /// Flags applied to the returned control fd.
    pub flags: SpawnFlags,
}

impl SpawnRequest {
    /// Start building a request for the given argument vector.
    pub fn new<I, A>(argv: I) -> SpawnRequestBuilder
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        SpawnRequestBuilder {
            argv: argv.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            fds: HashMap::new(),
            cwd: None,
            flags: SpawnFlags::default(),
        }
    }
}

/// Incrementally builds a [`SpawnRequest`], mirroring the ergonomics of
/// [`std::process::Command`].
pub struct SpawnRequestBuilder {
    argv: Vec<Vec<u8>>,
    env: HashMap<String, String>,
    fds: HashMap<RawFd, FdSource>,
    cwd: Option<PathBuf>,
    flags: SpawnFlags,
}

impl SpawnRequestBuilder {
    /// Append one argument.
    pub fn arg<A: Into<Vec<u8>>>(mut self, arg: A) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add (or overwrite) one environment variable update.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Map `target` to `source` in the command's fd table.
    pub fn fd<S: Into<FdSource>>(mut self, target: RawFd, source: S) -> Self {
        self.fds.insert(target, source.into());
        self
    }

    /// Close `target` in the command's fd table.
    pub fn close_fd(mut self, target: RawFd) -> Self {
        self.fds.insert(target, FdSource::Close);
        self
    }

    /// Set the command's working directory.
    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the flags applied to the returned control fd.
    pub fn flags(mut self, flags: SpawnFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Finish building.
    pub fn build(self) -> SpawnRequest {
        SpawnRequest {
            argv: self.argv,
            env: self.env,
            fds: self.fds,
            cwd: self.cwd,
            flags: self.flags,
        }
    }
}

/// Validated, fork-ready representation of a [`SpawnRequest`]. Everything in here is
/// precomputed before `fork()` so the post-fork child does no allocation beyond what was
/// already allocated here.
struct PreparedSpawn {
    supervisor_argv: Vec<CString>,
    fd_mappings: Vec<FdMapping>,
    cwd: Option<CString>,
    envp: Vec<CString>,
    sock_flags: SockFlag,
    cloexec_requested: bool,
}

fn effective_path(env: &HashMap<String, String>) -> std::ffi::OsString {
    match env.get("PATH") {
        Some(path) => path.into(),
        None => env::var_os("PATH").unwrap_or_default(),
    }
}

fn build_envp(updates: &HashMap<String, String>) -> Result<Vec<CString>, Error> {
    let mut merged: HashMap<std::ffi::OsString, std::ffi::OsString> = env::vars_os().collect();
    for (k, v) in updates {
        merged.insert(k.into(), v.into());
    }
    merged
        .into_iter()
        .map(|(k, v)| {
            let mut pair = k.as_bytes().to_vec();
            pair.push(b'=');
            pair.extend_from_slice(v.as_bytes());
            CString::new(pair)
                .map_err(|_| Error::TypeError("environment entry contains an embedded NUL".into()))
        })
        .collect()
}

fn prepare(req: SpawnRequest) -> Result<PreparedSpawn, Error> {
    if req.argv.is_empty() {
        return Err(Error::TypeError("argv must not be empty".into()));
    }

    let fd_mappings: Vec<FdMapping> = req
        .fds
        .into_iter()
        .map(|(target, source)| FdMapping { target, source })
        .collect();
    remap::validate_sources_open(&fd_mappings)?;

    let path = effective_path(&req.env);
    let argv0 = OsStr::from_bytes(&req.argv[0]);
    let resolved = which_in(argv0, &path)
        .ok_or_else(|| Error::NotFound(String::from_utf8_lossy(&req.argv[0]).into_owned()))?;

    let supervisor = supervisor_path()?.clone();

    let mut command_argv = Vec::with_capacity(req.argv.len());
    command_argv.push(
        CString::new(resolved.as_os_str().as_bytes())
            .map_err(|_| Error::TypeError("resolved path contains an embedded NUL".into()))?,
    );
    for arg in req.argv.iter().skip(1) {
        command_argv.push(
            CString::new(arg.clone())
                .map_err(|_| Error::TypeError("argument contains an embedded NUL".into()))?,
        );
    }

    let cwd = req
        .cwd
        .as_ref()
        .map(as_path_bytes)
        .transpose()?;

    let envp = build_envp(&req.env)?;

    let supervisor_cstr = CString::new(supervisor.as_os_str().as_bytes())
        .map_err(|_| Error::TypeError("supervisor path contains an embedded NUL".into()))?;

    let cloexec_requested = req.flags.contains(SpawnFlags::CLOEXEC);
    let sock_flags = req.flags.to_sock_flag();

    // statusfd/controlfd are filled in with the real fd number right before fork, once the
    // socket exists; reserve the slots here so the rest of supervisor_argv is already built.
    let mut supervisor_argv = Vec::with_capacity(3 + command_argv.len());
    supervisor_argv.push(supervisor_cstr);
    supervisor_argv.push(CString::new("0").unwrap()); // statusfd placeholder
    supervisor_argv.push(CString::new("0").unwrap()); // controlfd placeholder
    supervisor_argv.extend(command_argv);

    Ok(PreparedSpawn {
        supervisor_argv,
        fd_mappings,
        cwd,
        envp,
        sock_flags,
        cloexec_requested,
    })
}

/// Low-level entry point: create an fd-managed process and return the control fd and the pid
/// of the forked supervisor (not the command - see the crate docs on why the command's pid is
/// not known synchronously in the single-fork variant this crate implements).
///
/// Returning does not mean the command started successfully; the returned fd may immediately
/// report hangup without ever reporting a pid. [`crate::Process::new`] provides the stronger
/// guarantees most callers want.
pub fn dfork(req: SpawnRequest) -> Result<(OwnedFd, Pid), Error> {
    let mut prepared = prepare(req)?;

    let (parent_side, child_side) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        prepared.sock_flags,
    )
    .map_err(|e| Error::io_errno("creating control socket pair", e))?;

    if !prepared.cloexec_requested {
        // socketpair may default to CLOEXEC on some platforms; the caller asked us not to.
        let _ = fcntl(
            parent_side.as_raw_fd(),
            FcntlArg::F_SETFD(FdFlag::empty()),
        );
    }

    let child_side_raw = child_side.as_raw_fd();
    let statusfd = CString::new(child_side_raw.to_string()).unwrap();
    let controlfd = statusfd.clone();
    prepared.supervisor_argv[1] = statusfd;
    prepared.supervisor_argv[2] = controlfd;

    log::debug!(
        "forking supervisor {:?} with control fd {}",
        prepared.supervisor_argv[0],
        child_side_raw
    );

    // SAFETY: between fork() and exec() in the child branch, only async-signal-safe operations
    // (or operations on data prepared entirely before the fork) are performed.
    match unsafe { fork() }.map_err(|e| Error::io_errno("fork", e))? {
        ForkResult::Child => {
            drop(parent_side);
            run_child(&prepared, child_side_raw);
        }
        ForkResult::Parent { child } => {
            drop(child_side);
            Ok((parent_side, child))
        }
    }
}

/// Runs in the forked child. Never returns: either it execs the supervisor, or it calls
/// `_exit` on the first failure, matching the spec's "abort on any failure, don't roll back"
/// policy for the post-fork path.
fn run_child(prepared: &PreparedSpawn, child_side: RawFd) -> ! {
    if setsid().is_err() {
        unsafe { libc::_exit(127) };
    }

    if let Some(cwd) = &prepared.cwd {
        if chdir(cwd.as_c_str()).is_err() {
            unsafe { libc::_exit(127) };
        }
    }

    if remap::apply(&prepared.fd_mappings).is_err() {
        unsafe { libc::_exit(127) };
    }

    // Mark the control fd inheritable across exec.
    if fcntl(child_side, FcntlArg::F_SETFD(FdFlag::empty())).is_err() {
        unsafe { libc::_exit(127) };
    }

    let supervisor_argv_refs: Vec<&std::ffi::CStr> =
        prepared.supervisor_argv.iter().map(|c| c.as_c_str()).collect();
    let envp_refs: Vec<&std::ffi::CStr> = prepared.envp.iter().map(|c| c.as_c_str()).collect();

    let _ = execve(&prepared.supervisor_argv[0], &supervisor_argv_refs, &envp_refs);
    unsafe { libc::_exit(127) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_argv_and_env() {
        let req = SpawnRequest::new(["sh", "-c", "true"])
            .env("FOO", "bar")
            .fd(0, FdSource::Fd(0))
            .cwd("/tmp")
            .build();
        assert_eq!(req.argv, vec![b"sh".to_vec(), b"-c".to_vec(), b"true".to_vec()]);
        assert_eq!(req.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(req.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn prepare_rejects_empty_argv() {
        let req = SpawnRequest::new(Vec::<Vec<u8>>::new()).build();
        assert!(matches!(prepare(req), Err(Error::TypeError(_))));
    }

    #[test]
    fn prepare_rejects_missing_executable() {
        let req = SpawnRequest::new(["definitely_not_a_real_binary_xyz"]).build();
        assert!(matches!(prepare(req), Err(Error::NotFound(_))));
    }

    #[test]
    fn build_envp_applies_update_over_inherited() {
        std::env::set_var("DFORK_TEST_VAR", "original");
        let mut updates = HashMap::new();
        updates.insert("DFORK_TEST_VAR".to_string(), "updated".to_string());
        let envp = build_envp(&updates).unwrap();
        let found = envp
            .iter()
            .any(|entry| entry.to_str().unwrap() == "DFORK_TEST_VAR=updated");
        assert!(found);
    }
}
