//! Child reaper (C6) and the signal-to-loop bridge (spec §9).
//!
//! The event loop never calls `waitpid` inline from a signal handler. The
//! handler only has to be async-signal-safe, so it writes a single byte to a
//! self-pipe and the loop does the actual `WNOHANG` reap-all once it observes
//! that fd readable. This is the "self-pipe" option the design notes
//! explicitly allow in place of the historical SIGCHLD-to-SIGUSR1 hop through
//! a glib main loop, which this crate does not use.

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::{
    fcntl::OFlag,
    sys::signal::{self, SigHandler, Signal},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{close, pipe2, write, Pid},
};
use std::{
    collections::HashMap,
    convert::TryFrom,
    os::unix::io::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Relays the signal number itself (not just a wakeup byte), so the loop can
/// tell a termination-class signal apart from `SIGCHLD` once it drains the
/// pipe and forward it to the container (spec §4.6).
extern "C" fn relay_to_self_pipe(signum: libc::c_int) {
    let fd = SELF_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let buf = [signum as u8];
        unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The result of a reaped pid, as classified by its `ChildEntry` handler.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReapOutcome {
    /// Normal exit with the given status code.
    Exited(i32),

    /// Killed by a signal.
    Signaled(i32),
}

impl ReapOutcome {
    fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, ReapOutcome::Exited(code))),
            WaitStatus::Signaled(pid, sig, _core) => {
                Some((pid, ReapOutcome::Signaled(sig as i32)))
            }
            _ => None,
        }
    }
}

/// Which role a tracked pid plays; dispatch differs accordingly (spec §4.6).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChildRole {
    /// The transient OCI runtime `create`/`exec`/`restore` invocation.
    Runtime,

    /// The persistent container (or exec) init process.
    Container,
}

/// Tracks the two pids the monitor cares about and the self-pipe bridge that
/// wakes the event loop on `SIGCHLD`.
pub struct ChildReaper {
    self_pipe_read: RawFd,
    self_pipe_write: RawFd,
    entries: HashMap<i32, ChildRole>,
    pub runtime_status: Option<ReapOutcome>,
    pub container_status: Option<ReapOutcome>,
}

impl ChildReaper {
    /// Install the `SIGCHLD` handler and the forwarding handlers for
    /// `SIGTERM`/`SIGINT`/`SIGQUIT`, wiring them all to the same self-pipe.
    pub fn install() -> Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .context("create child-reaper self-pipe")?;
        SELF_PIPE_WRITE.store(write_fd, Ordering::Relaxed);

        for sig in [
            Signal::SIGCHLD,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGQUIT,
        ] {
            unsafe {
                signal::signal(sig, SigHandler::Handler(relay_to_self_pipe))
                    .with_context(|| format!("install handler for {:?}", sig))?;
            }
        }

        Ok(Self {
            self_pipe_read: read_fd,
            self_pipe_write: write_fd,
            entries: HashMap::new(),
            runtime_status: None,
            container_status: None,
        })
    }

    pub fn self_pipe_fd(&self) -> RawFd {
        self.self_pipe_read
    }

    pub fn track(&mut self, pid: Pid, role: ChildRole) {
        self.entries.insert(pid.as_raw(), role);
    }

    pub fn untrack(&mut self, pid: Pid) {
        self.entries.remove(&pid.as_raw());
    }

    pub fn is_tracking(&self, role: ChildRole) -> bool {
        self.entries.values().any(|r| *r == role)
    }

    fn pid_for_role(&self, role: ChildRole) -> Option<Pid> {
        self.entries
            .iter()
            .find(|(_, r)| **r == role)
            .map(|(pid, _)| Pid::from_raw(*pid))
    }

    /// Drain the self-pipe (there may be several coalesced wakeups), forward
    /// any termination-class signals it carried to the tracked child, and
    /// reap every exited child with `WNOHANG`, dispatching through the role
    /// table. Returns `true` if the event loop should quit (the container or
    /// the transient runtime has exited).
    pub fn drain_and_reap(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        let mut signums: Vec<u8> = Vec::new();
        loop {
            match nix::unistd::read(self.self_pipe_read, &mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    signums.extend_from_slice(&scratch[..n]);
                    continue;
                }
                Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => break,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    warn!("failed to drain child-reaper self-pipe: {}", e);
                    break;
                }
            }
        }

        let sigchld_raw = Signal::SIGCHLD as i32;
        for &b in &signums {
            let raw = b as i32;
            if raw == sigchld_raw {
                continue;
            }
            if let Ok(sig) = Signal::try_from(raw) {
                self.forward_signal(sig);
            }
        }

        let mut should_quit = false;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some((pid, outcome)) = ReapOutcome::from_wait_status(status) {
                        if let Some(role) = self.entries.remove(&pid.as_raw()) {
                            debug!("reaped {:?} pid {} with {:?}", role, pid, outcome);
                            match role {
                                ChildRole::Runtime => self.runtime_status = Some(outcome),
                                ChildRole::Container => self.container_status = Some(outcome),
                            }
                            should_quit = true;
                        }
                    }
                }
                Err(nix::Error::Sys(nix::errno::Errno::ECHILD)) => break,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => {
                    warn!("waitpid failed: {}", e);
                    break;
                }
            }
        }
        should_quit
    }

    /// Forward a termination-class signal to the container if known, else to
    /// the transient runtime pid, else just force a reap pass (spec §4.6 and
    /// the exec-mode Open Question in §9: prefer the exec child when the
    /// container's own pid is unknowable).
    pub fn forward_signal(&self, signal: Signal) {
        if let Some(pid) = self.pid_for_role(ChildRole::Container) {
            debug!("forwarding {:?} to container pid {}", signal, pid);
            let _ = signal::kill(pid, signal);
        } else if let Some(pid) = self.pid_for_role(ChildRole::Runtime) {
            debug!("forwarding {:?} to runtime pid {}", signal, pid);
            let _ = signal::kill(pid, signal);
        } else {
            let fd = self.self_pipe_write;
            let buf = [0u8; 1];
            let _ = write(fd, &buf);
        }
    }
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        SELF_PIPE_WRITE.store(-1, Ordering::Relaxed);
        close(self.self_pipe_read).ok();
        close(self.self_pipe_write).ok();
    }
}

/// Block SIGTERM/SIGQUIT/SIGINT around the second fork (spec §4.1 step 6),
/// returning the previous mask so the parent can restore it.
pub fn block_term_signals() -> Result<signal::SigSet> {
    let mut set = signal::SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    set.add(Signal::SIGINT);
    let mut old = signal::SigSet::empty();
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old))
        .context("block term signals")?;
    Ok(old)
}

/// Restore a previously-saved signal mask (the parent side of
/// [`block_term_signals`], called once the second fork has completed).
pub fn restore_signal_mask(mask: &signal::SigSet) -> Result<()> {
    signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(mask), None)
        .context("restore signal mask")
}
