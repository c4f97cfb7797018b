//! User-namespace identity mapping
//!
//! Runs in the parent, after the clone has produced a child pid and while
//! the child is still blocked at its identity rendezvous. Failures surface
//! the raw errno so the runner can forward it to the child as the
//! acknowledgment record.

use std::fmt::Write as _;
use std::fs;

use nix::errno::Errno;
use nix::unistd::Pid;

/// One `uid_map` / `gid_map` line: `inside outside count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// First id inside the namespace
    pub inside: u32,
    /// First id outside the namespace
    pub outside: u32,
    /// Length of the mapped range
    pub count: u32,
}

impl IdMap {
    #[must_use]
    pub const fn new(inside: u32, outside: u32, count: u32) -> Self {
        Self {
            inside,
            outside,
            count,
        }
    }
}

/// Write the identity-mapping files for `pid`'s new user namespace.
///
/// Order matters: `uid_map` first, then `setgroups` is denied (required
/// before an unprivileged process may write `gid_map`), then `gid_map`.
pub(crate) fn write_id_maps(
    pid: Pid,
    uid_maps: &[IdMap],
    gid_maps: &[IdMap],
) -> Result<(), Errno> {
    let uid_lines = render(uid_maps, nix::unistd::geteuid().as_raw());
    write_file(&proc_path(pid, "uid_map"), &uid_lines)?;

    let setgroups = proc_path(pid, "setgroups");
    if fs::metadata(&setgroups).is_ok() {
        write_file(&setgroups, "deny")?;
    }

    let gid_lines = render(gid_maps, nix::unistd::getegid().as_raw());
    write_file(&proc_path(pid, "gid_map"), &gid_lines)?;
    Ok(())
}

/// Render map lines; an empty slice becomes the minimal single-id mapping
/// of 0 inside to the caller's effective id outside.
fn render(maps: &[IdMap], default_outside: u32) -> String {
    if maps.is_empty() {
        return format!("0 {default_outside} 1\n");
    }
    let mut out = String::new();
    for map in maps {
        let _ = writeln!(out, "{} {} {}", map.inside, map.outside, map.count);
    }
    out
}

fn proc_path(pid: Pid, name: &str) -> String {
    format!("/proc/{}/{name}", pid.as_raw())
}

fn write_file(path: &str, contents: &str) -> Result<(), Errno> {
    fs::write(path, contents)
        .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_mapping()  {
        let lines = render(
            &[IdMap::new(0, 1000, 1), IdMap::new(1, 100_000, 65536)],
            0,
        );
        assert_eq!(lines, "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn empty_mapping_defaults_to_single_id() {
        assert_eq!(render(&[], 4242), "0 4242 1\n");
    }

    #[test]
    fn missing_proc_entry_surfaces_the_errno() {
        let err = write_file("/proc/0/uid_map", "0 0 1\n").unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }
}
