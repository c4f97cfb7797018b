//! Error types for cordon-core

use nix::errno::Errno;
use thiserror::Error;

use crate::report::ChildError;

#[derive(Error, Debug)]
pub enum CordonError {
    /// Invalid configuration, detected before any process was created
    #[error("configuration error: {0}")]
    Config(String),

    /// The child (or the clone itself) failed at a known stage
    #[error(transparent)]
    Child(#[from] ChildError),

    /// The handshake channel closed early, short-read, or carried an
    /// unexpected record
    #[error("handshake channel fault: {0}")]
    Handshake(Errno),

    /// The synchronization callback rejected the child
    #[error("sync callback failed: {0}")]
    Sync(std::io::Error),

    /// A parent-side syscall failed outside the handshake protocol
    #[error("system error: {0}")]
    Sys(#[from] Errno),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
