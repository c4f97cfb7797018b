//! Handshake channel across the fork boundary
//!
//! A connected socketpair carrying the fixed-size records of the child
//! error model. Both ends are close-on-exec, so a successful execve in the
//! child collapses its end and the parent observes a zero-byte read as the
//! success signal. The parent end closes exactly once on every runner exit
//! path (RAII); the child end is handed to the bootstrap as a raw
//! descriptor, usable between fork and exec.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use crate::report::{self, REPORT_SIZE, Record};

/// Parent-held endpoint of the handshake channel.
#[derive(Debug)]
pub(crate) struct ParentEnd {
    fd: OwnedFd,
}

/// Child-held endpoint. The parent drops its copy immediately after the
/// fork; the child reads and writes through the raw descriptor only.
#[derive(Debug)]
pub(crate) struct ChildEnd {
    fd: OwnedFd,
}

/// Create a connected channel pair, both ends close-on-exec.
pub(crate) fn pair() -> Result<(ParentEnd, ChildEnd), Errno> {
    let (parent, child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((ParentEnd { fd: parent }, ChildEnd { fd: child }))
}

impl ParentEnd {
    /// Read one record, classified by byte count. Retries on EINTR.
    pub fn read_record(&self) -> Result<Record, Errno> {
        let mut buf = [0u8; REPORT_SIZE];
        let n = read_retry(self.fd.as_raw_fd(), &mut buf)?;
        Ok(report::decode(&buf, n))
    }

    /// Write an error-code-only acknowledgment.
    pub fn write_ack(&self, errno: i32) -> Result<(), Errno> {
        write_full(self.fd.as_raw_fd(), &report::encode_ack(errno))
    }
}

impl ChildEnd {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn read_retry(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        // SAFETY: reading into a stack buffer we own
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(usize::try_from(n).unwrap_or(0));
        }
        let err = Errno::last();
        if err != Errno::EINTR {
            return Err(err);
        }
    }
}

fn write_full(fd: RawFd, buf: &[u8]) -> Result<(), Errno> {
    let mut written = 0;
    while written < buf.len() {
        // SAFETY: writing from a live slice
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr().cast(),
                buf.len() - written,
            )
        };
        if n >= 0 {
            written += usize::try_from(n).unwrap_or(0);
            continue;
        }
        let err = Errno::last();
        if err != Errno::EINTR {
            return Err(err);
        }
    }
    Ok(())
}
