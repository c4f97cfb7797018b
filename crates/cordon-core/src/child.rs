//! Child-side bootstrap
//!
//! Everything here runs between clone and execve, where the child is a
//! single-threaded copy of a possibly multi-threaded parent: the allocator
//! and anything that takes a lock may be wedged mid-operation. The rules in
//! this module: direct libc calls only, every buffer and string converted
//! before the fork, `_exit` instead of unwinding. Each failing step writes
//! its stage-tagged report on the handshake channel and terminates the
//! child.

use std::ffi::{CString, OsStr};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use crate::config::SpawnConfig;
use crate::error::CordonError;
use crate::report::{self, ACK_SIZE, Stage};

/// Everything the bootstrap needs, converted and allocated before the fork.
///
/// The pointer tables index into the owned `CString` storage; moving the
/// context does not move the heap buffers they point at.
#[derive(Debug)]
pub(crate) struct ChildContext {
    exec: CString,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    _argv_storage: Vec<CString>,
    _envp_storage: Vec<CString>,
    work_dir: Option<CString>,
    hostname: Option<CString>,
    domainname: Option<CString>,
    pivot_root: Option<CString>,
    rlimits: Vec<(libc::__rlimit_resource_t, libc::rlimit)>,
    wait_id_map: bool,
    set_uts: bool,
    drop_groups: bool,
    ptrace: bool,
    stop_before_filter: bool,
    /// Parent's signal mask from before the clone, restored first thing in
    /// the child. Filled in by the runner under the fork lock.
    pub(crate) saved_sigmask: libc::sigset_t,
}

impl ChildContext {
    /// Validate and convert the configuration. An embedded NUL in any
    /// string aborts here, before any process is created.
    pub(crate) fn prepare(config: &SpawnConfig) -> Result<Self, CordonError> {
        let exec = cstring(config.exec_path.as_os_str())?;

        let mut argv_storage = Vec::with_capacity(config.args.len());
        for arg in &config.args {
            argv_storage.push(cstring(arg)?);
        }
        let mut envp_storage = Vec::with_capacity(config.envs.len());
        for entry in &config.envs {
            envp_storage.push(cstring(entry)?);
        }
        let argv = pointer_table(&argv_storage);
        let envp = pointer_table(&envp_storage);

        let rlimits = config
            .rlimits
            .iter()
            .map(|limit| {
                (
                    limit.resource.as_raw(),
                    libc::rlimit {
                        rlim_cur: limit.soft,
                        rlim_max: limit.hard,
                    },
                )
            })
            .collect();

        Ok(Self {
            exec,
            argv,
            envp,
            _argv_storage: argv_storage,
            _envp_storage: envp_storage,
            work_dir: convert_opt(config.work_dir.as_deref().map(Path::as_os_str))?,
            hostname: convert_opt(config.hostname.as_deref())?,
            domainname: convert_opt(config.domainname.as_deref())?,
            pivot_root: convert_opt(config.pivot_root.as_deref().map(Path::as_os_str))?,
            rlimits,
            wait_id_map: config.namespaces.user,
            set_uts: config.namespaces.uts,
            drop_groups: config.drop_groups,
            ptrace: config.ptrace,
            stop_before_filter: config.stop_before_filter,
            // SAFETY: all-zero is a valid (empty) signal set
            saved_sigmask: unsafe { std::mem::zeroed() },
        })
    }
}

fn cstring(s: &OsStr) -> Result<CString, CordonError> {
    CString::new(s.as_bytes())
        .map_err(|_| CordonError::Config(format!("embedded NUL byte in {s:?}")))
}

fn convert_opt(s: Option<&OsStr>) -> Result<Option<CString>, CordonError> {
    s.map(cstring).transpose()
}

/// NULL-terminated pointer table over owned C strings.
fn pointer_table(storage: &[CString]) -> Vec<*const libc::c_char> {
    storage
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Child-side entry point. Never returns.
///
/// `fd` is the child's handshake endpoint; the parent has already dropped
/// its copy of it.
pub(crate) fn bootstrap(ctx: &ChildContext, fd: RawFd) -> ! {
    // SAFETY: single-threaded child between clone and execve; every call
    // below is a direct syscall over pre-fork storage.
    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &ctx.saved_sigmask, ptr::null_mut());

        // Identity rendezvous: the parent writes the uid/gid maps and then
        // acks. Nothing may run as the unmapped overflow id past this point.
        if ctx.wait_id_map {
            let mut buf = [0u8; ACK_SIZE];
            let n = read_retry(fd, &mut buf);
            if n != ACK_SIZE as isize {
                fail(fd, Stage::IdMap, libc::EPIPE);
            }
            let errno = i32::from_ne_bytes(buf);
            if errno != 0 {
                fail(fd, Stage::IdMap, errno);
            }
        }

        if ctx.set_uts {
            if let Some(hostname) = &ctx.hostname {
                if libc::sethostname(hostname.as_ptr(), hostname.as_bytes().len()) != 0 {
                    fail(fd, Stage::SetHostname, errno());
                }
            }
            if let Some(domainname) = &ctx.domainname {
                if libc::setdomainname(domainname.as_ptr(), domainname.as_bytes().len()) != 0 {
                    fail(fd, Stage::SetDomainname, errno());
                }
            }
        }

        if let Some(root) = &ctx.pivot_root {
            // Nothing from the old mount table may propagate back out.
            if libc::mount(
                ptr::null(),
                c"/".as_ptr(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            ) != 0
            {
                fail(fd, Stage::MountRoot, errno());
            }
            // pivot_root requires the new root to be a mount point.
            if libc::mount(
                root.as_ptr(),
                root.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                ptr::null(),
            ) != 0
            {
                fail(fd, Stage::MountRoot, errno());
            }
            if libc::chdir(root.as_ptr()) != 0 {
                fail(fd, Stage::Chdir, errno());
            }
            // Stacking new root and old root on the same mount point spares
            // a scratch directory for put_old.
            if libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) != 0 {
                fail(fd, Stage::PivotRoot, errno());
            }
            if libc::umount2(c".".as_ptr(), libc::MNT_DETACH) != 0 {
                fail(fd, Stage::UmountOld, errno());
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                fail(fd, Stage::Chdir, errno());
            }
        }

        if let Some(dir) = &ctx.work_dir {
            if libc::chdir(dir.as_ptr()) != 0 {
                fail(fd, Stage::Chdir, errno());
            }
        }

        if ctx.drop_groups && libc::setgroups(0, ptr::null()) != 0 {
            fail(fd, Stage::SetGroups, errno());
        }

        for (resource, limit) in &ctx.rlimits {
            if libc::setrlimit(*resource, limit) != 0 {
                fail(fd, Stage::Rlimit, errno());
            }
        }

        // Checkpoint reached: report it, then block until the parent has
        // run the sync callback and releases us.
        let checkpoint = report::encode_ack(0);
        if write_retry(fd, &checkpoint) != checkpoint.len() as isize {
            fail(fd, Stage::SyncWrite, errno());
        }
        let mut ack = [0u8; ACK_SIZE];
        let n = read_retry(fd, &mut ack);
        if n != ACK_SIZE as isize {
            fail(fd, Stage::SyncRead, libc::EPIPE);
        }
        if i32::from_ne_bytes(ack) != 0 {
            // The parent is abandoning us and already holds the error; a
            // second report would race the incoming SIGKILL.
            libc::_exit(1);
        }

        if ctx.ptrace && libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) < 0 {
            fail(fd, Stage::Ptrace, errno());
        }
        if ctx.stop_before_filter && libc::kill(libc::getpid(), libc::SIGSTOP) != 0 {
            fail(fd, Stage::Stop, errno());
        }

        libc::execve(ctx.exec.as_ptr(), ctx.argv.as_ptr(), ctx.envp.as_ptr());
        fail(fd, Stage::Execve, errno());
    }
}

/// Write the stage-tagged report and terminate. Best effort: if the channel
/// is gone too, the parent will see the close instead.
unsafe fn fail(fd: RawFd, stage: Stage, errno: i32) -> ! {
    let buf = report::encode_report(stage, errno);
    // SAFETY: fd is the child's channel end, buf is on this stack
    unsafe {
        write_retry(fd, &buf);
        libc::_exit(1);
    }
}

unsafe fn errno() -> i32 {
    // SAFETY: errno location is valid in the calling thread
    unsafe { *libc::__errno_location() }
}

unsafe fn read_retry(fd: RawFd, buf: &mut [u8]) -> isize {
    loop {
        // SAFETY: reading into a stack buffer we own
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 || unsafe { errno() } != libc::EINTR {
            return n;
        }
    }
}

unsafe fn write_retry(fd: RawFd, buf: &[u8]) -> isize {
    loop {
        // SAFETY: writing from a live slice
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 || unsafe { errno() } != libc::EINTR {
            return n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnConfig;
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn prepare_converts_argv_and_envp() {
        let config = SpawnConfig::new("/bin/echo")
            .arg("/bin/echo")
            .arg("hello")
            .env("PATH=/usr/bin");
        let ctx = ChildContext::prepare(&config).unwrap();

        // Two args plus the NULL terminator; one env plus NULL.
        assert_eq!(ctx.argv.len(), 3);
        assert!(ctx.argv[2].is_null());
        assert_eq!(ctx.envp.len(), 2);
        assert!(ctx.envp[1].is_null());
        assert_eq!(ctx.exec.to_bytes(), b"/bin/echo");
    }

    #[test]
    fn embedded_nul_is_a_config_error() {
        let bad = OsString::from_vec(b"/bin/tr\0ue".to_vec());
        let config = SpawnConfig::new(bad);
        let err = ChildContext::prepare(&config).unwrap_err();
        assert!(matches!(err, CordonError::Config(_)));
    }

    #[test]
    fn embedded_nul_in_hostname_is_caught_too() {
        let config =
            SpawnConfig::new("/bin/true").hostname(OsString::from_vec(b"sand\0box".to_vec()));
        assert!(ChildContext::prepare(&config).is_err());
    }

    #[test]
    fn uts_names_only_carried_with_the_namespace() {
        let config = SpawnConfig::new("/bin/true").hostname("sandbox");
        let ctx = ChildContext::prepare(&config).unwrap();
        assert!(!ctx.set_uts);
        assert!(ctx.hostname.is_some());
    }
}
