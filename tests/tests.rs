use std::ffi::OsString;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};

use dfork::{Error, Process, SpawnRequest};
use serial_test::serial;

/// Prepend the freshly built `supervise` fixture's directory onto `PATH` for the duration of
/// `f`, so [`dfork::dfork`]'s own `which_in(SUPERVISOR_NAME, ...)` lookup finds it. Mutating
/// `PATH` is process-wide, hence `#[serial]` on every test that calls this.
fn with_supervisor_on_path<T>(f: impl FnOnce() -> T) -> T {
    let _ = env_logger::try_init();

    let bin_dir = Path::new(env!("CARGO_BIN_EXE_supervise"))
        .parent()
        .unwrap()
        .to_owned();
    let original = std::env::var_os("PATH").unwrap_or_default();
    let mut joined = OsString::from(bin_dir.as_os_str());
    joined.push(":");
    joined.push(&original);
    std::env::set_var("PATH", &joined);
    let result = f();
    std::env::set_var("PATH", original);
    result
}

fn drain_nonblocking(fd: std::os::unix::io::RawFd, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut buf = [0u8; 64];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => panic!("unexpected read error: {e}"),
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
#[serial]
fn basic_exit_reports_clean_status() {
    with_supervisor_on_path(|| {
        let mut process =
            Process::new(SpawnRequest::new(["sh", "-c", "echo hi"]).build()).unwrap();
        let status = process.wait().unwrap();
        assert!(status.clean());
        process.close();
    });
}

#[test]
#[serial]
fn absolute_path_kill_reports_killed_and_closes_inherited_pipe() {
    with_supervisor_on_path(|| {
        let sh = dfork::which("sh").unwrap().to_string_lossy().into_owned();
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        let mut process = Process::new(
            SpawnRequest::new([sh, "-c".to_string(), "sleep inf".to_string()])
                .fd(9, w)
                .build(),
        )
        .unwrap();
        nix::unistd::close(w).unwrap();

        process.kill().unwrap();
        let status = process.wait().unwrap();
        assert!(status.died());
        assert_eq!(status.killed_with().unwrap(), libc::SIGKILL);
        process.close();

        assert!(
            drain_nonblocking(r, Duration::from_secs(5)),
            "pipe held by the killed child never closed"
        );
        nix::unistd::close(r).unwrap();
    });
}

#[test]
#[serial]
fn fd_map_redirects_a_pipe_into_the_child() {
    with_supervisor_on_path(|| {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        let mut process = Process::new(
            SpawnRequest::new(["sh".to_string(), "-c".to_string(), "echo hi >&9".to_string()])
                .fd(9, w)
                .build(),
        )
        .unwrap();
        nix::unistd::close(w).unwrap();

        let status = process.wait().unwrap();
        assert!(status.clean());
        process.close();

        assert!(drain_nonblocking(r, Duration::from_secs(5)));
        nix::unistd::close(r).unwrap();
    });
}

#[test]
#[serial]
fn unopened_target_becomes_devnull_without_touching_parent_fd_table() {
    with_supervisor_on_path(|| {
        assert!(!dfork::is_open(42));

        let devnull = std::fs::File::open("/dev/null").unwrap();
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        let mut process = Process::new(
            SpawnRequest::new([
                "sh".to_string(),
                "-c".to_string(),
                "wc -c < /dev/fd/42 >&9".to_string(),
            ])
            .fd(42, devnull.as_raw_fd())
            .fd(9, w)
            .build(),
        )
        .unwrap();
        drop(devnull);
        nix::unistd::close(w).unwrap();

        let status = process.wait().unwrap();
        assert!(status.clean());
        process.close();

        assert!(!dfork::is_open(42));

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match nix::unistd::read(r, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(String::from_utf8_lossy(&out).trim(), "0");
        nix::unistd::close(r).unwrap();
    });
}

#[test]
#[serial]
fn cwd_is_honored_by_the_spawned_command() {
    with_supervisor_on_path(|| {
        let dir = tempfile::tempdir().unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        let mut process = Process::new(
            SpawnRequest::new(["sh".to_string(), "-c".to_string(), "pwd >&9".to_string()])
                .cwd(canonical.clone())
                .fd(9, w)
                .build(),
        )
        .unwrap();
        nix::unistd::close(w).unwrap();

        let status = process.wait().unwrap();
        assert!(status.clean());
        process.close();

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match nix::unistd::read(r, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(String::from_utf8_lossy(&out).trim(), canonical.to_str().unwrap());
        nix::unistd::close(r).unwrap();
    });
}

#[test]
fn missing_executable_fails_synchronously() {
    let err = Process::new(SpawnRequest::new(["definitely_not_a_real_binary_xyz"]).build())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
#[serial]
fn closing_control_fd_tears_down_the_whole_descendant_tree() {
    with_supervisor_on_path(|| {
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        let mut process = Process::new(
            SpawnRequest::new([
                "sh".to_string(),
                "-c".to_string(),
                "sleep inf & sleep inf & setsid sleep inf & nohup sleep inf & sleep inf"
                    .to_string(),
            ])
            .fd(9, w)
            .build(),
        )
        .unwrap();
        nix::unistd::close(w).unwrap();

        process.close();

        assert!(
            drain_nonblocking(r, Duration::from_secs(10)),
            "descendant tree was not fully torn down after close()"
        );
        nix::unistd::close(r).unwrap();
    });
}
