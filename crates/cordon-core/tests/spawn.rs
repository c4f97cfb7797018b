//! Fork/exec handshake tests.
//!
//! Everything here runs unprivileged: the namespaced scenarios skip
//! themselves when the kernel refuses unprivileged user namespaces, and
//! the rest exercise the handshake with an empty namespace set, which any
//! environment allows.

use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use cordon_core::{
    ChildError, CordonError, NamespaceConfig, Runner, SpawnConfig, Stage, kill_and_reap,
};

fn wait_for_exit(pid: Pid) -> WaitStatus {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            other => return other.expect("waitpid failed"),
        }
    }
}

#[test]
fn spawns_and_execs_without_namespaces() {
    let mut runner = Runner::new(SpawnConfig::new("/bin/true").arg("/bin/true"));
    let pid = runner.start().expect("spawn /bin/true");
    assert!(pid.as_raw() > 0);

    // Ownership of the pid transferred to us on success.
    assert_eq!(wait_for_exit(pid), WaitStatus::Exited(pid, 0));
}

#[test]
fn missing_target_reports_the_execve_stage() {
    let mut runner = Runner::new(SpawnConfig::new("/definitely/not/here").arg("x"));
    let err = runner.start().unwrap_err();

    match err {
        CordonError::Child(ChildError { stage, errno }) => {
            assert_eq!(stage, Stage::Execve);
            assert_eq!(errno, Errno::ENOENT);
        }
        other => panic!("expected an execve child error, got: {other}"),
    }
}

#[test]
fn bad_workdir_reports_the_chdir_stage() {
    let config = SpawnConfig::new("/bin/true")
        .arg("/bin/true")
        .work_dir("/definitely/not/a/directory");
    let err = Runner::new(config).start().unwrap_err();

    match err {
        CordonError::Child(ChildError { stage, errno }) => {
            assert_eq!(stage, Stage::Chdir);
            assert_eq!(errno, Errno::ENOENT);
        }
        other => panic!("expected a chdir child error, got: {other}"),
    }
}

#[test]
fn workdir_is_entered_before_exec() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SpawnConfig::new("/bin/true")
        .arg("/bin/true")
        .work_dir(dir.path());

    let pid = Runner::new(config).start().expect("spawn with workdir");
    assert_eq!(wait_for_exit(pid), WaitStatus::Exited(pid, 0));
}

#[test]
fn embedded_nul_fails_before_any_fork() {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    let bad = OsString::from_vec(b"/bin/tr\0ue".to_vec());
    let err = Runner::new(SpawnConfig::new(bad)).start().unwrap_err();
    assert!(matches!(err, CordonError::Config(_)), "got: {err}");
}

#[test]
fn failed_sync_callback_kills_and_reaps_the_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("ran");
    let seen_pid = Arc::new(Mutex::new(None));
    let seen_in_callback = Arc::clone(&seen_pid);

    // The target would drop a marker file if it ever ran.
    let config = SpawnConfig::new("/bin/sh")
        .arg("sh")
        .arg("-c")
        .arg(format!("echo > {}", marker.display()));

    let err = Runner::new(config)
        .sync_fn(Box::new(move |pid| {
            // The child exists and is parked at its checkpoint right now.
            assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());
            *seen_in_callback.lock().unwrap() = Some(pid);
            Err(std::io::Error::other("cgroup placement rejected"))
        }))
        .start()
        .unwrap_err();

    assert!(matches!(err, CordonError::Sync(_)), "got: {err}");
    assert!(!marker.exists(), "target ran despite the failed callback");

    // Killed and reaped exactly once: the pid is gone by the time we look.
    let pid = seen_pid.lock().unwrap().take().expect("callback saw a pid");
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
fn stop_before_filter_parks_the_child_in_sigstop() {
    let config = SpawnConfig::new("/bin/true")
        .arg("/bin/true")
        .stop_before_filter(true);

    let pid = Runner::new(config).start().expect("spawn self-stopping");

    // start() returned before execve; the child is sitting in its stop.
    let status = loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Err(Errno::EINTR) => {}
            other => break other.expect("waitpid failed"),
        }
    };
    assert_eq!(status, WaitStatus::Stopped(pid, Signal::SIGSTOP));

    kill_and_reap(pid);
    // Cleanup is idempotent on an already-reaped child.
    kill_and_reap(pid);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}

#[test]
fn user_and_uts_namespaces_apply_the_hostname() {
    let namespaces = NamespaceConfig {
        user: true,
        uts: true,
        ..Default::default()
    };
    let config = SpawnConfig::new("/bin/sh")
        .arg("sh")
        .arg("-c")
        .arg("test \"$(cat /proc/sys/kernel/hostname)\" = sandbox")
        .env("PATH=/usr/bin:/bin")
        .hostname("sandbox")
        .namespaces(namespaces);

    let pid = match Runner::new(config).start() {
        Ok(pid) => pid,
        Err(err) => {
            // Unprivileged user namespaces are disabled on some kernels;
            // nothing to verify here in that case.
            eprintln!("skipping: user namespace unavailable ({err})");
            return;
        }
    };

    assert_eq!(wait_for_exit(pid), WaitStatus::Exited(pid, 0));
}
