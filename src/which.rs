// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Resolving an executable name against `PATH`, the way `execvp` itself would.

use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Resolve `name` to an absolute executable path using the current process's `PATH`.
///
/// If `name` already contains a `/`, it is used as-is (after checking it is executable),
/// matching `execvp`'s own behavior of not consulting `PATH` for such names.
pub fn which<S: AsRef<OsStr>>(name: S) -> Option<PathBuf> {
    let path = env::var_os("PATH").unwrap_or_default();
    which_in(name, &path)
}

/// As [`which`], but search `path` (a `:`-separated list, `PATH`'s own format) instead of the
/// process environment's `PATH`.
pub fn which_in<S: AsRef<OsStr>>(name: S, path: &OsStr) -> Option<PathBuf> {
    let name = name.as_ref();
    if name.as_bytes().contains(&b'/') {
        let candidate = Path::new(name);
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }

    for dir in env::split_paths(path) {
        let candidate = dir.join(name);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh_on_path() {
        let resolved = which("sh").expect("sh should be on PATH in test environments");
        assert!(resolved.is_absolute());
    }

    #[test]
    fn rejects_nonexistent_binary() {
        assert!(which("definitely_not_a_real_binary_xyz").is_none());
    }

    #[test]
    fn absolute_path_is_returned_unchanged_if_executable() {
        let sh = which("sh").unwrap();
        let again = which(sh.as_os_str()).unwrap();
        assert_eq!(sh, again);
    }

    #[test]
    fn empty_path_finds_nothing_for_bare_name() {
        assert!(which_in("sh", OsStr::new("")).is_none());
    }
}
