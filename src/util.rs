//! Small helpers shared across the stdio, attach and logging paths.

use anyhow::{Context, Result};
use nix::{errno::Errno, unistd::write};
use std::os::unix::io::RawFd;

/// Write the whole buffer to `fd`, retrying on short writes and `EINTR`.
///
/// Used anywhere the monitor must not silently drop bytes it has already
/// accepted responsibility for: the CRI log file, the sync pipe, and the
/// container's stdin master. Attach client writes use this too, but a
/// failure there only tears down that one client (spec §4.2/§7).
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => break,
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(e) => return Err(e).context("write"),
        }
    }
    Ok(())
}
