//! Single-threaded event loop (C7): the readiness multiplexer that owns
//! C2 through C6 for the lifetime of the container.

use crate::{
    attach::AttachHub,
    container_logging::ContainerLogging,
    control::{ControlChannel, ControlMessage},
    oom::OomWatcher,
    reaper::ChildReaper,
    stdio::{self, StdioEndpoint},
    stream::StreamTag,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags};
use std::time::{Duration, Instant};

/// How the container's lifetime ended, as observed by the loop (spec §3).
#[derive(Debug, Clone, Copy)]
pub enum ExitOutcome {
    /// The container exited normally with this code.
    NormalExit(i32),

    /// The container was killed by this signal.
    Signaled(i32),

    /// The timeout fired before the container exited.
    TimedOut,
}

/// Re-arm interval for pty stdout once it reports `HUP` with no open slave
/// (spec §4.2/§9, "pty HUP flapping", a required element of the design, not
/// an implementation detail).
const PTY_HUP_REPOLL: Duration = Duration::from_millis(100);

/// Owns every event source for one container's lifetime and drives the
/// cooperative readiness loop. All I/O inside a callback must be
/// non-blocking or bounded (spec §5).
pub struct EventLoop {
    stdio: StdioEndpoint,
    attach: Option<AttachHub>,
    control: ControlChannel,
    oom: Option<OomWatcher>,
    reaper: ChildReaper,
    logging: ContainerLogging,
    leave_stdin_open: bool,
    stdin_open: bool,
    timeout: Option<Duration>,
    stdout_hup_since: Option<Instant>,
    stderr_hup: bool,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stdio: StdioEndpoint,
        attach: Option<AttachHub>,
        control: ControlChannel,
        oom: Option<OomWatcher>,
        reaper: ChildReaper,
        logging: ContainerLogging,
        leave_stdin_open: bool,
        timeout_secs: u32,
    ) -> Self {
        let stdin_open = stdio.stdin_fd().is_some();
        Self {
            stdio,
            attach,
            control,
            oom,
            reaper,
            logging,
            leave_stdin_open,
            stdin_open,
            timeout: if timeout_secs > 0 {
                Some(Duration::from_secs(timeout_secs as u64))
            } else {
                None
            },
            stdout_hup_since: None,
            stderr_hup: false,
        }
    }

    /// Run until the container exits, the runtime/container is reaped, or
    /// the timeout fires. Leaves `self` intact so the caller can retrieve the
    /// owned subsystems afterward via [`EventLoop::into_parts`] for tail-drain.
    pub fn run(&mut self) -> Result<ExitOutcome> {
        let start = Instant::now();

        loop {
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    debug!("event loop timeout reached");
                    return Ok(ExitOutcome::TimedOut);
                }
            }

            let mut fds: Vec<PollFd> = Vec::new();
            let mut kinds: Vec<Source> = Vec::new();

            // pty stdout is polled on a 100ms timer instead of readiness
            // once it has been hung up with no slave attached.
            let waiting_out_hup =
                matches!(self.stdout_hup_since, Some(t) if t.elapsed() < PTY_HUP_REPOLL);
            if !waiting_out_hup {
                fds.push(PollFd::new(self.stdio.stdout_fd(), PollFlags::POLLIN));
                kinds.push(Source::Stdout);
            }

            if let Some(stderr_fd) = self.stdio.stderr_fd() {
                if !self.stderr_hup {
                    fds.push(PollFd::new(stderr_fd, PollFlags::POLLIN));
                    kinds.push(Source::Stderr);
                }
            }

            if let Some(attach) = &self.attach {
                fds.push(PollFd::new(attach.listener_fd(), PollFlags::POLLIN));
                kinds.push(Source::AttachListener);
                for client in attach.clients() {
                    // Once a client's send half is closed there is nothing
                    // left to read; keep polling would just busy-loop on a
                    // recv-returns-0 fd every iteration.
                    if client.is_readable() {
                        fds.push(PollFd::new(client.fd(), PollFlags::POLLIN));
                        kinds.push(Source::AttachClient(client.fd()));
                    }
                }
            }

            fds.push(PollFd::new(self.control.read_fd(), PollFlags::POLLIN));
            kinds.push(Source::Control);

            if let Some(oom) = &self.oom {
                fds.push(PollFd::new(oom.fd(), PollFlags::POLLIN));
                kinds.push(Source::Oom);
            }

            fds.push(PollFd::new(self.reaper.self_pipe_fd(), PollFlags::POLLIN));
            kinds.push(Source::Reaper);

            let poll_timeout_ms = if self.stdout_hup_since.is_some() {
                PTY_HUP_REPOLL.as_millis() as i32
            } else if let Some(timeout) = self.timeout {
                let remaining = timeout.saturating_sub(start.elapsed());
                remaining.as_millis().min(i32::MAX as u128) as i32
            } else {
                -1
            };

            let n = match poll(&mut fds, poll_timeout_ms) {
                Ok(n) => n,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("poll event sources"),
            };
            if n == 0 {
                // Either the HUP re-poll timer or the overall timeout fired;
                // the top of the loop re-checks both.
                continue;
            }

            for (pfd, kind) in fds.iter().zip(kinds.iter()) {
                let revents = match pfd.revents() {
                    Some(r) => r,
                    None => continue,
                };
                if revents.is_empty() {
                    continue;
                }

                match kind {
                    Source::Stdout => {
                        if revents.contains(PollFlags::POLLIN) {
                            self.stdout_hup_since = None;
                            if !self.handle_master_read(StreamTag::Stdout)? {
                                return self.drain_on_exit();
                            }
                        } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                            if self.stdio.is_terminal() {
                                if self.stdout_hup_since.is_none() {
                                    debug!("pty stdout HUP, degrading to 100ms repoll");
                                }
                                self.stdout_hup_since = Some(Instant::now());
                            } else {
                                return self.drain_on_exit();
                            }
                        }
                    }
                    Source::Stderr => {
                        if revents.contains(PollFlags::POLLIN) {
                            if !self.handle_master_read(StreamTag::Stderr)? {
                                self.stderr_hup = true;
                            }
                        } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                            self.stderr_hup = true;
                        }
                    }
                    Source::AttachListener => {
                        if let Some(attach) = &mut self.attach {
                            attach.accept_one();
                        }
                    }
                    Source::AttachClient(fd) => {
                        if let Some(attach) = &mut self.attach {
                            if let Some(idx) = attach.clients().iter().position(|c| c.fd() == *fd)
                            {
                                let closed_write =
                                    attach.read_from_client(idx, self.stdio.stdin_fd());
                                if closed_write && self.stdin_open && !self.leave_stdin_open {
                                    if let Some(stdin_fd) = self.stdio.stdin_fd() {
                                        nix::unistd::close(stdin_fd).ok();
                                        self.stdin_open = false;
                                    }
                                }
                            }
                        }
                    }
                    Source::Control => {
                        for msg in self.control.poll_messages() {
                            self.handle_control_message(msg);
                        }
                    }
                    Source::Oom => {
                        if let Some(oom) = &self.oom {
                            oom.handle_event();
                        }
                    }
                    Source::Reaper => {
                        if self.reaper.drain_and_reap() {
                            return self.finish_from_reaper();
                        }
                    }
                }
            }
        }
    }

    fn handle_master_read(&mut self, tag: StreamTag) -> Result<bool> {
        let fd = match tag {
            StreamTag::Stdout => self.stdio.stdout_fd(),
            StreamTag::Stderr => self.stdio.stderr_fd().expect("stderr fd present"),
            StreamTag::Stdin => unreachable!("stdin is never read from the master side"),
        };

        match stdio::read_chunk(fd)? {
            stdio::ReadOutcome::Data(mut chunk) => {
                if let Err(e) = self.logging.write_chunk(tag, chunk.bytes()) {
                    warn!("log write failed: {:#}", e);
                }
                if let Some(attach) = &mut self.attach {
                    attach.broadcast(tag, &mut chunk);
                }
                Ok(true)
            }
            // A spurious wakeup with nothing to read yet; not EOF, so keep
            // the fd registered for the next iteration.
            stdio::ReadOutcome::WouldBlock => Ok(true),
            stdio::ReadOutcome::Eof => Ok(false),
        }
    }

    fn handle_control_message(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::Resize { rows, cols } => {
                if self.stdio.is_terminal() {
                    if let Ok(mut ws) = Self::get_winsize(self.stdio.stdout_fd()) {
                        ws.ws_row = rows;
                        ws.ws_col = cols;
                        Self::set_winsize(self.stdio.stdout_fd(), &ws);
                    }
                }
            }
            ControlMessage::ReopenLogs => {
                if let Err(e) = self.logging.reopen() {
                    warn!("failed to reopen log files: {:#}", e);
                }
            }
            ControlMessage::Unknown(kind) => {
                warn!("ignoring unknown control message type {}", kind);
            }
        }
    }

    fn get_winsize(fd: std::os::unix::io::RawFd) -> Result<libc::winsize> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let res = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
        if res != 0 {
            anyhow::bail!("TIOCGWINSZ failed: {}", std::io::Error::last_os_error());
        }
        Ok(ws)
    }

    fn set_winsize(fd: std::os::unix::io::RawFd, ws: &libc::winsize) {
        unsafe {
            libc::ioctl(fd, libc::TIOCSWINSZ, ws);
        }
    }

    /// EOF on stdout (pipe shape) or definitive HUP (pty shape without
    /// further grace). The monitor has nothing left to read, so tail-drain
    /// into the log and wait for the reaper to confirm the exit.
    fn drain_on_exit(&mut self) -> Result<ExitOutcome> {
        loop {
            if self.reaper.drain_and_reap() {
                return self.finish_from_reaper();
            }
            let mut fds = [PollFd::new(self.reaper.self_pipe_fd(), PollFlags::POLLIN)];
            poll(&mut fds, 100).context("poll while waiting for final reap")?;
        }
    }

    fn finish_from_reaper(&self) -> Result<ExitOutcome> {
        use crate::reaper::ReapOutcome;
        let outcome = self.reaper.container_status.or(self.reaper.runtime_status);
        Ok(match outcome {
            Some(ReapOutcome::Exited(code)) => ExitOutcome::NormalExit(code),
            Some(ReapOutcome::Signaled(sig)) => ExitOutcome::Signaled(sig),
            None => ExitOutcome::NormalExit(0),
        })
    }

    /// Consume the loop, handing back its owned subsystems so C8 can
    /// perform tail-drain, logging sync, and teardown.
    pub fn into_parts(
        self,
    ) -> (
        StdioEndpoint,
        Option<AttachHub>,
        ContainerLogging,
        ChildReaper,
    ) {
        (self.stdio, self.attach, self.logging, self.reaper)
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Stdout,
    Stderr,
    AttachListener,
    AttachClient(std::os::unix::io::RawFd),
    Control,
    Oom,
    Reaper,
}
