//! Child error model and its wire encoding
//!
//! The child reports failures to the parent as a fixed-size record: a
//! platform error code followed by a stage tag, native endianness. The
//! acknowledgment records exchanged mid-handshake reuse the leading
//! error-code field alone, so the decoder disambiguates by length:
//! 0 bytes is a clean close (the channel collapsed on a successful execve),
//! 4 bytes is an acknowledgment, 8 bytes is a full report. Every other
//! length is a protocol fault, never decoded as content.

use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

/// Size of an error-code-only acknowledgment record.
pub(crate) const ACK_SIZE: usize = 4;

/// Size of a full stage-tagged report.
pub(crate) const REPORT_SIZE: usize = 8;

/// Bootstrap stage at which the child (or the clone itself) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Stage {
    /// The clone syscall, before any child existed
    Clone = 1,
    /// Waiting for the uid/gid map acknowledgment
    IdMap = 2,
    SetHostname = 3,
    SetDomainname = 4,
    /// Adjusting mount propagation or binding the new root
    MountRoot = 5,
    PivotRoot = 6,
    /// Detaching the old root after the pivot
    UmountOld = 7,
    Chdir = 8,
    SetGroups = 9,
    Rlimit = 10,
    /// Writing the checkpoint record
    SyncWrite = 11,
    /// Reading the release acknowledgment
    SyncRead = 12,
    Ptrace = 13,
    /// Raising the pre-exec stop signal
    Stop = 14,
    Execve = 15,
}

impl Stage {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Clone,
            2 => Self::IdMap,
            3 => Self::SetHostname,
            4 => Self::SetDomainname,
            5 => Self::MountRoot,
            6 => Self::PivotRoot,
            7 => Self::UmountOld,
            8 => Self::Chdir,
            9 => Self::SetGroups,
            10 => Self::Rlimit,
            11 => Self::SyncWrite,
            12 => Self::SyncRead,
            13 => Self::Ptrace,
            14 => Self::Stop,
            15 => Self::Execve,
            _ => return None,
        })
    }

    /// Stable name of the stage, as rendered in errors and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::IdMap => "id_map",
            Self::SetHostname => "sethostname",
            Self::SetDomainname => "setdomainname",
            Self::MountRoot => "mount_root",
            Self::PivotRoot => "pivot_root",
            Self::UmountOld => "umount_old",
            Self::Chdir => "chdir",
            Self::SetGroups => "setgroups",
            Self::Rlimit => "setrlimit",
            Self::SyncWrite => "sync_write",
            Self::SyncRead => "sync_read",
            Self::Ptrace => "ptrace",
            Self::Stop => "stop",
            Self::Execve => "execve",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure reported across the fork boundary, tagged with the stage it
/// occurred at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("child failed at {stage}: {errno}")]
pub struct ChildError {
    pub stage: Stage,
    pub errno: Errno,
}

/// One read from the handshake channel, classified by byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record {
    /// Zero-byte read: the peer end closed
    Closed,
    /// Error-code-only acknowledgment
    Ack(i32),
    /// Full stage-tagged report
    Report { stage: Stage, errno: i32 },
    /// Byte count (or stage tag) matching no known record
    Malformed(usize),
}

pub(crate) fn encode_ack(errno: i32) -> [u8; ACK_SIZE] {
    errno.to_ne_bytes()
}

pub(crate) fn encode_report(stage: Stage, errno: i32) -> [u8; REPORT_SIZE] {
    let mut buf = [0u8; REPORT_SIZE];
    buf[..ACK_SIZE].copy_from_slice(&errno.to_ne_bytes());
    buf[ACK_SIZE..].copy_from_slice(&(stage as u32).to_ne_bytes());
    buf
}

pub(crate) fn decode(buf: &[u8; REPORT_SIZE], n: usize) -> Record {
    match n {
        0 => Record::Closed,
        ACK_SIZE => {
            let mut errno = [0u8; ACK_SIZE];
            errno.copy_from_slice(&buf[..ACK_SIZE]);
            Record::Ack(i32::from_ne_bytes(errno))
        }
        REPORT_SIZE => {
            let mut errno = [0u8; ACK_SIZE];
            errno.copy_from_slice(&buf[..ACK_SIZE]);
            let mut stage = [0u8; 4];
            stage.copy_from_slice(&buf[ACK_SIZE..]);
            match Stage::from_raw(u32::from_ne_bytes(stage)) {
                Some(stage) => Record::Report {
                    stage,
                    errno: i32::from_ne_bytes(errno),
                },
                None => Record::Malformed(n),
            }
        }
        other => Record::Malformed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_round_trips() {
        let buf = encode_report(Stage::PivotRoot, libc::EACCES);
        assert_eq!(
            decode(&buf, REPORT_SIZE),
            Record::Report {
                stage: Stage::PivotRoot,
                errno: libc::EACCES,
            }
        );
    }

    #[test]
    fn ack_decodes_from_its_own_length() {
        let mut buf = [0u8; REPORT_SIZE];
        buf[..ACK_SIZE].copy_from_slice(&encode_ack(libc::EPERM));
        assert_eq!(decode(&buf, ACK_SIZE), Record::Ack(libc::EPERM));
    }

    #[test]
    fn zero_length_read_is_a_clean_close() {
        let buf = [0u8; REPORT_SIZE];
        assert_eq!(decode(&buf, 0), Record::Closed);
    }

    #[test]
    fn odd_lengths_are_protocol_faults() {
        let buf = encode_report(Stage::Execve, libc::ENOENT);
        for n in [1, 2, 3, 5, 6, 7] {
            assert_eq!(decode(&buf, n), Record::Malformed(n));
        }
    }

    #[test]
    fn unknown_stage_tag_is_a_protocol_fault() {
        let mut buf = [0u8; REPORT_SIZE];
        buf[ACK_SIZE..].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(decode(&buf, REPORT_SIZE), Record::Malformed(REPORT_SIZE));
    }

    #[test]
    fn child_error_names_the_stage() {
        let err = ChildError {
            stage: Stage::Execve,
            errno: nix::errno::Errno::ENOENT,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("execve"), "got: {rendered}");
    }
}
