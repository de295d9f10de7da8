//! Stdio plumbing (C2): pty-or-pipe master descriptors for the container.
//!
//! Mirrors `setup_console_socket`/`setup_pipes` in the historical C `conmon`
//! (`examples/original_source/conmon/conmon.c` in its oldest revisions grew
//! this out of a plain `pipe()`; the console-socket handshake is the part the
//! teacher's stub left as `unimplemented!()`).

use crate::util::write_all;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    sys::socket::{
        accept, bind, listen, recvmsg, socket, AddressFamily, ControlMessageOwned, MsgFlags,
        SockAddr, SockFlag, SockType, UnixAddr,
    },
    sys::stat::Mode,
    sys::termios::{self, SetArg},
    sys::uio::IoVec,
    unistd::{close, pipe2, read, unlink},
};
use std::{
    io::Write,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Size of a single stdio read, matching the historical `BUF_SIZE`/`STDIO_BUF_SIZE`.
pub const BUF_SIZE: usize = 8192;

/// The master side of the container's stdio, owned exclusively by the event
/// loop for its lifetime (spec §9, "Cyclic descriptor ownership").
pub enum StdioEndpoint {
    /// A pty master fd received from the runtime via `SCM_RIGHTS`. Used for
    /// both stdin and stdout; stderr is folded into stdout by the terminal.
    PtyBacked { master: RawFd },

    /// Three independent pipes. `stdin` is present only if `--stdin` was given.
    PipeBacked {
        stdin: Option<RawFd>,
        stdout: RawFd,
        stderr: RawFd,
    },
}

impl StdioEndpoint {
    /// The fd to read container stdout from (also the fd to write stdin to,
    /// in the pty case).
    pub fn stdout_fd(&self) -> RawFd {
        match self {
            StdioEndpoint::PtyBacked { master } => *master,
            StdioEndpoint::PipeBacked { stdout, .. } => *stdout,
        }
    }

    /// The fd to read container stderr from, if the shape has one.
    pub fn stderr_fd(&self) -> Option<RawFd> {
        match self {
            StdioEndpoint::PtyBacked { .. } => None,
            StdioEndpoint::PipeBacked { stderr, .. } => Some(*stderr),
        }
    }

    /// The fd to write bytes destined for the container's stdin, if any.
    pub fn stdin_fd(&self) -> Option<RawFd> {
        match self {
            StdioEndpoint::PtyBacked { master } => Some(*master),
            StdioEndpoint::PipeBacked { stdin, .. } => *stdin,
        }
    }

    /// Whether this endpoint is pty-backed (affects `TIOCSWINSZ` routing and
    /// HUP-polling behavior in the event loop).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StdioEndpoint::PtyBacked { .. })
    }

    /// The readable master fds (stdout, and stderr if the shape has one),
    /// tagged by stream, for tail-draining once the event loop stops polling
    /// them (spec §4.1 item 10).
    pub fn readable_fds(&self) -> Vec<(crate::stream::StreamTag, RawFd)> {
        let mut out = vec![(crate::stream::StreamTag::Stdout, self.stdout_fd())];
        if let Some(fd) = self.stderr_fd() {
            out.push((crate::stream::StreamTag::Stderr, fd));
        }
        out
    }

    /// Set the stdin-to-container fd to non-blocking. No-op for pty backed
    /// endpoints, whose master is already set non-blocking at creation time.
    pub fn set_nonblocking(fd: RawFd) -> Result<()> {
        let flags = fcntl(fd, FcntlArg::F_GETFL).context("get fd flags")?;
        let mut flags = OFlag::from_bits_truncate(flags);
        flags.insert(OFlag::O_NONBLOCK);
        fcntl(fd, FcntlArg::F_SETFL(flags)).context("set fd non-blocking")?;
        Ok(())
    }
}

/// A one-shot path under a securely-created temp directory for the console
/// socket, removed once no longer needed per spec §6.
pub struct ConsoleSocket {
    listener: RawFd,
    path: PathBuf,
}

impl ConsoleSocket {
    /// Create the console socket: a `chmod 0700` Unix stream socket bound to
    /// a throwaway path, the name unlinked immediately after bind (the
    /// runtime connects using the fd, not a lingering directory entry).
    pub fn create() -> Result<Self> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("conmon-term.{}", std::process::id()));

        let listener = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create console socket")?;

        let addr = SockAddr::new_unix(&path).context("build console socket address")?;
        bind(listener, &addr).context("bind console socket")?;

        nix::unistd::fchmod(listener, Mode::from_bits_truncate(0o700))
            .or_else(|_| chmod_path(&path, 0o700))
            .ok();

        listen(listener, 10).context("listen on console socket")?;

        // The runtime only needs the pathname to connect; once bound, remove
        // the directory entry so it can't be reused or discovered by anyone
        // else racing on the same temp directory.
        unlink(&path).ok();

        Ok(Self { listener, path })
    }

    /// The path to hand the runtime as `--console-socket`.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the runtime connects and sends the pty master fd over
    /// `SCM_RIGHTS`, returning it with `ONLCR` enabled.
    pub fn recv_pty_master(&self) -> Result<RawFd> {
        let client = accept(self.listener).context("accept console socket connection")?;
        let master = recv_fd(client).context("receive pty master via SCM_RIGHTS")?;
        close(client).ok();

        if let Ok(mut attrs) = termios::tcgetattr(master) {
            attrs.output_flags.insert(termios::OutputFlags::ONLCR);
            termios::tcsetattr(master, SetArg::TCSANOW, &attrs).ok();
        }

        Ok(master)
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        close(self.listener).ok();
    }
}

fn chmod_path(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .context("chmod console socket path")
}

/// Receive a single fd sent over `SCM_RIGHTS` on `sock`.
fn recv_fd(sock: RawFd) -> Result<RawFd> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut iobuf = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut iobuf)];

    let msg = recvmsg(sock, &iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .context("recvmsg for pty master")?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(fd);
            }
        }
    }
    bail!("runtime did not send a pty master fd over the console socket")
}

/// A pipe pair plus which end the monitor keeps (`main`) versus which end
/// is dup'd into the runtime child (`worker`).
pub struct PipePair {
    pub main_fd: RawFd,
    pub worker_fd: RawFd,
}

/// Create the stdout/stderr pipes (always) and the stdin pipe (if
/// requested), all close-on-exec.
pub fn create_pipes(want_stdin: bool) -> Result<(Option<PipePair>, PipePair, PipePair)> {
    let stdin_pair = if want_stdin {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).context("create stdin pipe")?;
        // main keeps the write end (it pushes bytes toward the container);
        // the worker (container) side reads from read_end.
        let pair = PipePair {
            main_fd: write_end,
            worker_fd: read_end,
        };
        StdioEndpoint::set_nonblocking(pair.main_fd).ok();
        Some(pair)
    } else {
        None
    };

    let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).context("create stdout pipe")?;
    let stdout_pair = PipePair {
        main_fd: stdout_read,
        worker_fd: stdout_write,
    };

    let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).context("create stderr pipe")?;
    let stderr_pair = PipePair {
        main_fd: stderr_read,
        worker_fd: stderr_write,
    };

    Ok((stdin_pair, stdout_pair, stderr_pair))
}

/// A single chunk read off a master fd: the tag it belongs to and its bytes.
///
/// The buffer carries a spare leading byte so a framed attach datagram can be
/// produced by writing the tag byte directly in front of the payload without
/// a second allocation, and a spare trailing byte so a line can be NUL
/// terminated in place for the journald backend.
pub struct ReadChunk {
    storage: Vec<u8>,
    len: usize,
}

impl ReadChunk {
    fn new() -> Self {
        // 1 prefix byte + BUF_SIZE payload + 1 trailing byte.
        Self {
            storage: vec![0u8; 1 + BUF_SIZE + 1],
            len: 0,
        }
    }

    /// The payload bytes read this call.
    pub fn bytes(&self) -> &[u8] {
        &self.storage[1..1 + self.len]
    }

    /// The payload plus the one leading tag byte, for attach framing. Caller
    /// must have already written the tag byte into `storage[0]`.
    pub fn framed(&self) -> &[u8] {
        &self.storage[0..1 + self.len]
    }

    /// Slot for the attach frame tag byte.
    pub fn set_tag_byte(&mut self, b: u8) {
        self.storage[0] = b;
    }

    /// NUL-terminated view of the payload, for journald's `sd_journal_send`-style APIs.
    pub fn nul_terminated(&mut self) -> &[u8] {
        self.storage[1 + self.len] = 0;
        &self.storage[1..1 + self.len + 1]
    }
}

/// The result of a single `read_chunk` call: either a chunk of data, a
/// genuine EOF (`read() == 0`), or a spurious wakeup with nothing to read
/// yet. Callers must not treat the latter as EOF.
pub enum ReadOutcome {
    /// Bytes were read.
    Data(ReadChunk),

    /// `read()` returned 0: the stream is at EOF.
    Eof,

    /// `read()` failed with `EAGAIN`/`EWOULDBLOCK`: no data is available
    /// right now, but the stream is not at EOF.
    WouldBlock,
}

/// Read one chunk from `fd`.
pub fn read_chunk(fd: RawFd) -> Result<ReadOutcome> {
    let mut chunk = ReadChunk::new();
    loop {
        match read(fd, &mut chunk.storage[1..1 + BUF_SIZE]) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => {
                chunk.len = n;
                return Ok(ReadOutcome::Data(chunk));
            }
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => return Ok(ReadOutcome::WouldBlock),
            Err(e) => return Err(e).context("read from stdio master"),
        }
    }
}

/// Write bytes to the container's stdin master, warning (not failing) on
/// short reads or transient errors, consistent with spec §7 item 5.
pub fn write_stdin(fd: RawFd, buf: &[u8]) {
    if let Err(e) = write_all(fd, buf) {
        warn!("failed to write to container stdin: {:#}", e);
    } else {
        debug!("wrote {} bytes to container stdin", buf.len());
    }
}

/// Best-effort flush of stderr output for diagnostics (used only in the
/// runtime-failure path, which does its own bounded read rather than this
/// helper. Kept here since both call sites share the "ignore write
/// failures, never block" discipline).
pub fn flush_stderr_snippet(snippet: &[u8]) {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(snippet);
}
