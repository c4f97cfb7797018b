//! # cordon-core
//!
//! Namespaced fork/exec primitives for sandboxing untrusted programs.
//!
//! The crate owns process creation and nothing after it: it clones a child
//! into a requested set of Linux namespaces, establishes its filesystem
//! root and identity, and synchronizes with it over a socketpair up to a
//! well-defined checkpoint just before the target binary executes. Syscall
//! tracing and resource-limit enforcement are external collaborators that
//! receive the pid this crate hands back.
//!
//! The handshake is a three-step barrier over one channel:
//! reach-checkpoint / release / confirm-exec, with close-on-exec doubling
//! as the success signal for the final step. Every failure after the fork
//! kills and reaps the child before returning, so the caller never
//! inherits a zombie.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod channel;
mod child;
mod clone;
pub mod config;
pub mod error;
pub mod idmap;
pub mod report;
pub mod runner;

pub use config::{NamespaceConfig, Rlimit, RlimitResource, SpawnConfig};
pub use error::CordonError;
pub use idmap::IdMap;
pub use report::{ChildError, Stage};
pub use runner::{Runner, SyncFunc, kill_and_reap};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, CordonError>;
