//! cordon CLI - run one untrusted program inside restricted namespaces

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;

use cordon_core::{NamespaceConfig, Rlimit, RlimitResource, Runner, SpawnConfig};

const MB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "cordon")]
#[command(author, version, about = "Run an untrusted program inside restricted Linux namespaces")]
struct Cli {
    /// Program to execute inside the sandbox
    command: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Working directory inside the sandbox
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// New filesystem root, entered via pivot_root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Hostname inside the UTS namespace
    #[arg(long, default_value = "cordon")]
    hostname: String,

    /// Domain name inside the UTS namespace
    #[arg(long)]
    domainname: Option<String>,

    /// Environment entries (KEY=VALUE), repeatable
    #[arg(short, long)]
    env: Vec<String>,

    /// Keep the host network (skip the network namespace)
    #[arg(long)]
    network: bool,

    /// Skip the user namespace (the rest then requires privileges)
    #[arg(long)]
    no_user_ns: bool,

    /// CPU time limit in seconds
    #[arg(long)]
    cpu: Option<u64>,

    /// Address-space limit in MB
    #[arg(long)]
    memory: Option<u64>,

    /// Output (file size) limit in MB
    #[arg(long)]
    output: Option<u64>,

    /// Stack limit in MB
    #[arg(long)]
    stack: Option<u64>,

    /// Don't vet dangerous syscalls (passed through to the tracer)
    #[arg(long = "unsafe")]
    unsafe_mode: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunReport {
    exit_code: Option<i32>,
    signal: Option<i32>,
    wall_time_ms: u128,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cordon_core=info".parse()?)
                .add_directive("cordon_cli=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let namespaces = NamespaceConfig {
        user: !cli.no_user_ns,
        mount: true,
        pid: true,
        net: !cli.network,
        uts: true,
        ipc: true,
        cgroup: false,
    };

    let mut config = SpawnConfig::new(&cli.command)
        .arg(&cli.command)
        .args(&cli.args)
        .namespaces(namespaces)
        .hostname(&cli.hostname)
        .unsafe_mode(cli.unsafe_mode);

    for entry in &cli.env {
        config = config.env(entry);
    }
    if let Some(domainname) = &cli.domainname {
        config = config.domainname(domainname);
    }
    if let Some(workdir) = &cli.workdir {
        config = config.work_dir(workdir);
    }
    if let Some(root) = &cli.root {
        config = config.pivot_root(root);
    }
    if let Some(secs) = cli.cpu {
        config = config.rlimit(Rlimit::new(RlimitResource::Cpu, secs, secs + 1));
    }
    if let Some(mb) = cli.memory {
        config = config.rlimit(Rlimit::new(RlimitResource::AddressSpace, mb * MB, mb * MB));
    }
    if let Some(mb) = cli.output {
        config = config.rlimit(Rlimit::new(RlimitResource::Fsize, mb * MB, mb * MB));
    }
    if let Some(mb) = cli.stack {
        config = config.rlimit(Rlimit::new(RlimitResource::Stack, mb * MB, mb * MB));
    }

    let started = Instant::now();
    let pid = Runner::new(config).start()?;
    tracing::info!(pid = pid.as_raw(), command = %cli.command, "sandbox child started");

    let status = wait_for_exit(pid)?;
    let report = RunReport {
        exit_code: match status {
            WaitStatus::Exited(_, code) => Some(code),
            _ => None,
        },
        signal: match status {
            WaitStatus::Signaled(_, signal, _) => Some(signal as i32),
            _ => None,
        },
        wall_time_ms: started.elapsed().as_millis(),
    };

    if let Some(path) = &cli.json {
        std::fs::write(path, serde_json::to_vec_pretty(&report)?)?;
    }

    match (report.exit_code, report.signal) {
        (Some(code), _) => {
            tracing::info!(code, wall_time_ms = report.wall_time_ms, "child exited");
            std::process::exit(code);
        }
        (None, Some(signal)) => {
            tracing::warn!(signal, wall_time_ms = report.wall_time_ms, "child killed by signal");
            std::process::exit(128 + signal);
        }
        (None, None) => Ok(()),
    }
}

fn wait_for_exit(pid: Pid) -> Result<WaitStatus, Errno> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}
