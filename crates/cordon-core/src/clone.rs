//! Raw clone(2) wrapper
//!
//! The child is created directly inside the requested namespace set with a
//! fork-style clone: no new stack, SIGCHLD as the exit signal. Going
//! through the raw syscall keeps the child branch clear of libc's pthread
//! bookkeeping, which may be inconsistent in the fresh copy of a threaded
//! parent.

use nix::errno::Errno;
use nix::unistd::Pid;

/// Fork the calling process into the namespaces selected by `flags`.
///
/// Returns the child pid in the parent. The child branch runs `child_fn`,
/// which diverges; it never returns to the caller's frame.
pub(crate) fn spawn(namespace_flags: u64, child_fn: impl FnOnce()) -> Result<Pid, Errno> {
    let flags = namespace_flags | u64::from(libc::SIGCHLD as u32);

    // SAFETY: fork-style clone (no CLONE_VM, no new stack). The child
    // branch diverges into the bootstrap before touching any parent-held
    // lock or allocation.
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0u64, 0u64, 0u64, 0u64) };

    if ret < 0 {
        return Err(Errno::last());
    }
    if ret == 0 {
        child_fn();
    }
    Ok(Pid::from_raw(ret as libc::pid_t))
}
