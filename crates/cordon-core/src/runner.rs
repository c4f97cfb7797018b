//! Parent-side spawn orchestration
//!
//! `Runner::start` forks the configured child into its namespace set and
//! drives the handshake as a three-step barrier: reach-checkpoint, release,
//! confirm-exec. The identity-mapping write happens-before the child's
//! first read; the sync callback happens-before the release ack; the
//! release ack happens-before execve. On every failure path after a child
//! exists, the child is killed and reaped before the error is returned.

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::Result;
use crate::channel::{self, ParentEnd};
use crate::child::{self, ChildContext};
use crate::clone;
use crate::config::SpawnConfig;
use crate::error::CordonError;
use crate::idmap;
use crate::report::{ChildError, Record, Stage};

/// Serializes forks process-wide so no two clones interleave while signal
/// state and the descriptor table are in flux. Held from before the signal
/// block until after the mask is restored, on every path.
static FORK_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Callback invoked with the child's pid after it reaches the pre-execve
/// checkpoint and before it is released. External setup keyed by the pid
/// (cgroup placement and the like) goes here; an error fails the spawn and
/// the child never runs the target.
pub type SyncFunc = Box<dyn FnMut(Pid) -> std::io::Result<()> + Send>;

/// Spawns one child per [`Runner::start`] call and synchronizes with it up
/// to the moment it execs the target binary.
pub struct Runner {
    config: SpawnConfig,
    sync_fn: Option<SyncFunc>,
}

impl Runner {
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self {
            config,
            sync_fn: None,
        }
    }

    /// Install the post-checkpoint synchronization callback.
    #[must_use]
    pub fn sync_fn(mut self, sync_fn: SyncFunc) -> Self {
        self.sync_fn = Some(sync_fn);
        self
    }

    /// Fork the configured child and drive the handshake to completion.
    ///
    /// The calling OS thread must not migrate for the duration of the call:
    /// namespace and ptrace semantics bind to the thread that performed the
    /// clone. On success the returned pid belongs to the caller — alive and
    /// exactly at its release point, stopped if `ptrace` or
    /// `stop_before_filter` was set. On failure no process is left behind,
    /// running or zombie.
    pub fn start(&mut self) -> Result<Pid> {
        let mut ctx = ChildContext::prepare(&self.config)?;
        let (parent_end, child_end) = channel::pair()?;
        let flags = self.config.namespaces.to_clone_flags();
        tracing::debug!(exec = ?self.config.exec_path, ?flags, "handshake channel ready");

        let clone_result = {
            let _fork_guard = FORK_LOCK.lock();
            let saved = block_signals()?;
            ctx.saved_sigmask = *saved.as_ref();
            let child_fd = child_end.as_raw_fd();
            let result = clone::spawn(clone_bits(flags), || child::bootstrap(&ctx, child_fd));
            restore_signals(&saved);
            result
        };

        // The child's endpoint is a child-exclusive handle.
        drop(child_end);

        let pid = match clone_result {
            Ok(pid) => pid,
            Err(errno) => {
                // No child exists; nothing to reap.
                drop(parent_end);
                return Err(ChildError {
                    stage: Stage::Clone,
                    errno,
                }
                .into());
            }
        };
        tracing::debug!(pid = pid.as_raw(), "child cloned");

        self.sync_with_child(pid, parent_end)
    }

    fn sync_with_child(&mut self, pid: Pid, channel: ParentEnd) -> Result<Pid> {
        // Identity rendezvous: the child blocks until it reads this ack,
        // so the maps are always in place before anything runs under them.
        if self.config.namespaces.user {
            let ack = match idmap::write_id_maps(pid, &self.config.uid_maps, &self.config.gid_maps)
            {
                Ok(()) => 0,
                Err(errno) => errno as i32,
            };
            tracing::debug!(pid = pid.as_raw(), ack, "identity maps written");
            if channel.write_ack(ack).is_err() {
                return fail(pid, channel, CordonError::Handshake(Errno::EPIPE));
            }
        }

        // Checkpoint: the child reports it finished namespace, filesystem
        // and identity setup and is holding before execve.
        match channel.read_record() {
            Ok(Record::Ack(0) | Record::Report { errno: 0, .. }) => {}
            Ok(Record::Report { stage, errno }) => {
                return fail(
                    pid,
                    channel,
                    ChildError {
                        stage,
                        errno: Errno::from_raw(errno),
                    }
                    .into(),
                );
            }
            Ok(Record::Ack(errno)) => {
                return fail(pid, channel, CordonError::Handshake(Errno::from_raw(errno)));
            }
            Ok(Record::Closed | Record::Malformed(_)) => {
                return fail(pid, channel, CordonError::Handshake(Errno::EPIPE));
            }
            Err(errno) => return fail(pid, channel, CordonError::Handshake(errno)),
        }

        if let Some(sync_fn) = self.sync_fn.as_mut() {
            if let Err(err) = sync_fn(pid) {
                return fail(pid, channel, CordonError::Sync(err));
            }
        }

        // Release the child toward execve, or toward its self-stop.
        if channel.write_ack(0).is_err() {
            return fail(pid, channel, CordonError::Handshake(Errno::EPIPE));
        }
        tracing::debug!(pid = pid.as_raw(), "child released");

        if self.config.ptrace || self.config.stop_before_filter {
            // The child holds in a stopped state before execve; the caller
            // attaches its tracer instead of us waiting for the exec close.
            // The drain thread absorbs a late failure report so the child
            // never writes into a closed peer.
            std::thread::spawn(move || {
                let _ = channel.read_record();
            });
            return Ok(pid);
        }

        // Close-on-exec collapses the child's end on a successful execve; a
        // clean zero-byte read is the success signal.
        match channel.read_record() {
            Ok(Record::Closed) => Ok(pid),
            Ok(Record::Report { stage, errno }) => fail_reaped(
                pid,
                ChildError {
                    stage,
                    errno: Errno::from_raw(errno),
                }
                .into(),
            ),
            Ok(Record::Ack(_) | Record::Malformed(_)) => {
                fail_reaped(pid, CordonError::Handshake(Errno::EPIPE))
            }
            Err(errno) => fail_reaped(pid, CordonError::Handshake(errno)),
        }
    }
}

fn clone_bits(flags: CloneFlags) -> u64 {
    #[allow(clippy::cast_sign_loss)]
    {
        flags.bits() as u64
    }
}

fn block_signals() -> Result<SigSet> {
    let mut saved = SigSet::empty();
    signal::sigprocmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut saved),
    )?;
    Ok(saved)
}

fn restore_signals(saved: &SigSet) {
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(saved), None);
}

/// Failure with the channel still open: close it, then kill and reap.
fn fail(pid: Pid, channel: ParentEnd, err: CordonError) -> Result<Pid> {
    drop(channel);
    fail_reaped(pid, err)
}

fn fail_reaped(pid: Pid, err: CordonError) -> Result<Pid> {
    tracing::debug!(pid = pid.as_raw(), %err, "handshake failed, reaping child");
    kill_and_reap(pid);
    Err(err)
}

/// Forcibly terminate and synchronously reap a child.
///
/// Idempotent: reaping a child that already exited (or was already reaped)
/// completes without error, so failure paths may call this unconditionally.
pub fn kill_and_reap(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            _ => break,
        }
    }
}
