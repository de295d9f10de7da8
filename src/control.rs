//! Control channel (C4): the `<bundle>/ctl` FIFO.

use anyhow::{Context, Result};
use log::warn;
use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{close, mkfifo, read},
};
use std::{
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Partial-message scratch buffer size, matching the historical 199-byte
/// static buffer conmon parses `"<type> <a> <b>\n"` triples out of.
const CTL_BUF_SIZE: usize = 199;

/// A parsed control message.
#[derive(Debug, Eq, PartialEq)]
pub enum ControlMessage {
    /// `1 rows cols`: resize the pty.
    Resize { rows: u16, cols: u16 },

    /// `2 _ _`: reopen log files.
    ReopenLogs,

    /// Any other message type; operands are discarded.
    Unknown(u8),
}

/// The control FIFO: a read-nonblock end the event loop polls, plus a write
/// end the monitor holds open itself so a `POLLHUP` storm never occurs while
/// no external writer is attached.
pub struct ControlChannel {
    path: PathBuf,
    read_fd: RawFd,
    write_fd: RawFd,
    pending: Vec<u8>,
}

impl ControlChannel {
    /// Create `<bundle>/ctl` as a FIFO mode 0666 and open both ends.
    pub fn create(bundle_path: &Path) -> Result<Self> {
        let path = bundle_path.join("ctl");
        match mkfifo(&path, Mode::from_bits_truncate(0o666)) {
            Ok(()) => {}
            Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => {}
            Err(e) => return Err(e).context("create control fifo"),
        }

        let read_fd = open(&path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
            .context("open control fifo for reading")?;
        let write_fd = open(&path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty())
            .context("open control fifo for writing (keep-alive)")?;

        Ok(Self {
            path,
            read_fd,
            write_fd,
            pending: Vec::with_capacity(CTL_BUF_SIZE),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Read whatever is available and return any complete messages found.
    ///
    /// A read that fills the 199-byte buffer without producing a newline
    /// resets the buffer and logs a warning, matching the historical
    /// behavior rather than growing unboundedly.
    pub fn poll_messages(&mut self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        let mut buf = [0u8; CTL_BUF_SIZE];
        loop {
            match read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if self.pending.len() >= CTL_BUF_SIZE && !self.pending.contains(&b'\n') {
                        warn!("control message exceeded buffer without a newline, discarding");
                        self.pending.clear();
                    }
                }
                Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => break,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    warn!("control fifo read failed: {}", e);
                    break;
                }
            }
        }

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if let Ok(text) = std::str::from_utf8(line) {
                if let Some(msg) = parse_message(text) {
                    out.push(msg);
                }
            }
        }

        out
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        close(self.read_fd).ok();
        close(self.write_fd).ok();
    }
}

/// Parse a single `"<type> <a> <b>"` triple (scanf-style, whitespace
/// separated, trailing fields optional).
fn parse_message(line: &str) -> Option<ControlMessage> {
    let mut parts = line.split_whitespace();
    let kind: u8 = parts.next()?.parse().ok()?;
    match kind {
        1 => {
            let rows: u16 = parts.next()?.parse().ok()?;
            let cols: u16 = parts.next()?.parse().ok()?;
            Some(ControlMessage::Resize { rows, cols })
        }
        2 => Some(ControlMessage::ReopenLogs),
        other => Some(ControlMessage::Unknown(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize_message() {
        assert_eq!(
            parse_message("1 24 80"),
            Some(ControlMessage::Resize { rows: 24, cols: 80 })
        );
    }

    #[test]
    fn parses_reopen_message() {
        assert_eq!(parse_message("2 0 0"), Some(ControlMessage::ReopenLogs));
    }

    #[test]
    fn parses_unknown_message() {
        assert_eq!(parse_message("9 1 2"), Some(ControlMessage::Unknown(9)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_message("not a message"), None);
    }

    #[test]
    fn create_makes_fifo_with_expected_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctl = ControlChannel::create(dir.path())?;
        let meta = std::fs::metadata(dir.path().join("ctl"))?;
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
        drop(ctl);
        Ok(())
    }
}
