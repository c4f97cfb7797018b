//! Spawn configuration

use std::ffi::OsString;
use std::path::PathBuf;

use nix::sched::CloneFlags;

use crate::idmap::IdMap;

/// Which Linux namespaces the child is created in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Create new user namespace (enables the identity-mapping rendezvous)
    pub user: bool,
    /// Create new mount namespace
    pub mount: bool,
    /// Create new PID namespace
    pub pid: bool,
    /// Create new network namespace
    pub net: bool,
    /// Create new UTS namespace (hostname / domain name)
    pub uts: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new cgroup namespace
    pub cgroup: bool,
}

impl NamespaceConfig {
    /// Every namespace this crate knows how to create.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            user: true,
            mount: true,
            pid: true,
            net: true,
            uts: true,
            ipc: true,
            cgroup: true,
        }
    }

    /// Convert to the clone flag bitset.
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }

        flags
    }
}

/// Resources a ceiling can be applied to in the child, via setrlimit(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitResource {
    /// CPU time, seconds
    Cpu,
    /// Largest file the child may create, bytes
    Fsize,
    /// Data segment, bytes
    Data,
    /// Stack, bytes
    Stack,
    /// Core dump size, bytes
    Core,
    /// Open file descriptors
    NoFile,
    /// Address space, bytes
    AddressSpace,
}

impl RlimitResource {
    pub(crate) const fn as_raw(self) -> libc::__rlimit_resource_t {
        match self {
            Self::Cpu => libc::RLIMIT_CPU,
            Self::Fsize => libc::RLIMIT_FSIZE,
            Self::Data => libc::RLIMIT_DATA,
            Self::Stack => libc::RLIMIT_STACK,
            Self::Core => libc::RLIMIT_CORE,
            Self::NoFile => libc::RLIMIT_NOFILE,
            Self::AddressSpace => libc::RLIMIT_AS,
        }
    }
}

/// A resource ceiling applied in the child before execve.
///
/// Enforcement past the kernel's own rlimit semantics (wall-clock watchdogs,
/// usage accounting) belongs to the collaborator that receives the pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: RlimitResource,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    #[must_use]
    pub const fn new(resource: RlimitResource, soft: u64, hard: u64) -> Self {
        Self {
            resource,
            soft,
            hard,
        }
    }
}

/// Configuration for one spawn, immutable for the duration of the call.
#[derive(Debug, Default)]
pub struct SpawnConfig {
    /// Target executable path
    pub exec_path: PathBuf,
    /// Full argument vector, argv[0] included
    pub args: Vec<OsString>,
    /// Environment in `KEY=VALUE` form
    pub envs: Vec<OsString>,
    /// Working directory entered after the filesystem root is established
    pub work_dir: Option<PathBuf>,
    /// Hostname, applied only when a UTS namespace is requested
    pub hostname: Option<OsString>,
    /// Domain name, applied only when a UTS namespace is requested
    pub domainname: Option<OsString>,
    /// New filesystem root, entered via pivot_root (requires a mount
    /// namespace)
    pub pivot_root: Option<PathBuf>,
    /// Namespace set to create the child in
    pub namespaces: NamespaceConfig,
    /// Arrange for the child to be ptrace-traceable: PTRACE_TRACEME before
    /// execve, so the exec trap stops it for the tracer
    pub ptrace: bool,
    /// Have the child SIGSTOP itself after release, before any syscall
    /// filter would be installed
    pub stop_before_filter: bool,
    /// Skip destructive-syscall vetting. Carried for the tracing
    /// collaborator; this crate does not act on it.
    pub unsafe_mode: bool,
    /// uid_map lines for a new user namespace; empty means a default
    /// single-id mapping
    pub uid_maps: Vec<IdMap>,
    /// gid_map lines for a new user namespace; empty means a default
    /// single-id mapping
    pub gid_maps: Vec<IdMap>,
    /// Resource ceilings applied in the child before execve
    pub rlimits: Vec<Rlimit>,
    /// Drop supplementary groups once namespaces are set
    pub drop_groups: bool,
}

impl SpawnConfig {
    #[must_use]
    pub fn new(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one `KEY=VALUE` environment entry.
    #[must_use]
    pub fn env(mut self, entry: impl Into<OsString>) -> Self {
        self.envs.push(entry.into());
        self
    }

    #[must_use]
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn hostname(mut self, name: impl Into<OsString>) -> Self {
        self.hostname = Some(name.into());
        self
    }

    #[must_use]
    pub fn domainname(mut self, name: impl Into<OsString>) -> Self {
        self.domainname = Some(name.into());
        self
    }

    #[must_use]
    pub fn pivot_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.pivot_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }

    #[must_use]
    pub fn ptrace(mut self, ptrace: bool) -> Self {
        self.ptrace = ptrace;
        self
    }

    #[must_use]
    pub fn stop_before_filter(mut self, stop: bool) -> Self {
        self.stop_before_filter = stop;
        self
    }

    #[must_use]
    pub fn unsafe_mode(mut self, unsafe_mode: bool) -> Self {
        self.unsafe_mode = unsafe_mode;
        self
    }

    #[must_use]
    pub fn uid_map(mut self, map: IdMap) -> Self {
        self.uid_maps.push(map);
        self
    }

    #[must_use]
    pub fn gid_map(mut self, map: IdMap) -> Self {
        self.gid_maps.push(map);
        self
    }

    #[must_use]
    pub fn rlimit(mut self, limit: Rlimit) -> Self {
        self.rlimits.push(limit);
        self
    }

    #[must_use]
    pub fn drop_groups(mut self, drop: bool) -> Self {
        self.drop_groups = drop;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_set_maps_to_no_flags() {
        assert!(NamespaceConfig::default().to_clone_flags().is_empty());
    }

    #[test]
    fn each_namespace_sets_its_flag() {
        let flags = NamespaceConfig {
            mount: true,
            uts: true,
            pid: true,
            ..Default::default()
        }
        .to_clone_flags();

        assert_eq!(
            flags,
            CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWPID
        );
    }

    #[test]
    fn all_covers_every_namespace() {
        let flags = NamespaceConfig::all().to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWCGROUP));
    }

    #[test]
    fn builder_accumulates() {
        let config = SpawnConfig::new("/bin/true")
            .arg("/bin/true")
            .env("PATH=/usr/bin")
            .hostname("sandbox")
            .stop_before_filter(true);

        assert_eq!(config.exec_path, PathBuf::from("/bin/true"));
        assert_eq!(config.args.len(), 1);
        assert_eq!(config.envs.len(), 1);
        assert_eq!(config.hostname.as_deref(), Some("sandbox".as_ref()));
        assert!(config.stop_before_filter);
        assert!(!config.ptrace);
    }
}
