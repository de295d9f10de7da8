//! Lifecycle driver helpers (C8): daemonization, fd plumbing around the two
//! forks, pidfiles, the exit file, and the exit-command `atexit` hook.
//!
//! `lib.rs` owns the overall sequencing (spec §4.1); this module holds the
//! primitives that sequence calls into, so each one can be reasoned about
//! (and tested, where it doesn't require an actual fork) independently.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::{
    sys::signal::Signal,
    unistd::{dup2, fork, setsid, ForkResult, Pid},
};
use std::{
    env,
    fs::{self, File, OpenOptions},
    io::Write,
    os::unix::io::AsRawFd,
    path::Path,
    process::exit,
    sync::Mutex,
};

/// Adjust this process's OOM score. A failure here is a warning, not fatal
/// (the monitor would rather run un-adjusted than not run).
pub fn adjust_oom_score(score: &str) -> Result<()> {
    File::open("/proc/self/oom_score_adj")
        .context("open oom score file")?
        .write_all(score.as_bytes())
        .context("write oom score")
}

/// Clear the process locale, matching the historical `setlocale(LC_ALL, "")`
/// call done once at startup so runtime-invoked subprocesses don't inherit a
/// surprising locale from the orchestrator's environment.
pub fn unset_locale() {
    unsafe { libc::setlocale(libc::LC_ALL, "".as_ptr() as *const i8) };
}

/// Double-fork to disconnect from the parent and continue daemon-like. The
/// grandparent writes `monitor_pidfile`/`legacy_pidfile` (if set) with the
/// child's pid, then exits. Returns `Ok(())` only in the surviving child.
///
/// Skipped entirely when `sync` is set (spec's `--sync` mode, added per
/// SPEC_FULL.md §C: the orchestrator wants to keep the monitor as its direct
/// child rather than see it re-parented to init).
pub fn daemonize(
    sync: bool,
    monitor_pidfile: Option<&Path>,
    legacy_pidfile: Option<&Path>,
) -> Result<()> {
    if sync {
        let pid = Pid::this();
        write_pidfiles(pid, monitor_pidfile, legacy_pidfile)?;
        return Ok(());
    }

    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            write_pidfiles(child, monitor_pidfile, legacy_pidfile)?;
            exit(0);
        }
        ForkResult::Child => Ok(()),
    }
}

fn write_pidfiles(
    pid: Pid,
    monitor_pidfile: Option<&Path>,
    legacy_pidfile: Option<&Path>,
) -> Result<()> {
    if let Some(path) = monitor_pidfile {
        fs::write(path, pid.to_string()).context("write monitor pidfile")?;
    }
    if let Some(path) = legacy_pidfile {
        fs::write(path, pid.to_string()).context("write legacy pidfile")?;
    }
    Ok(())
}

/// Redirect stdin/stdout/stderr to `/dev/null`. Needed because the
/// grandparent is waiting for the daemon's stdout to close before it
/// considers the double-fork handshake complete.
pub fn redirect_stdio_to_dev_null() -> Result<()> {
    const DEV_NULL: &str = "/dev/null";
    let dev_null_r = OpenOptions::new().read(true).open(DEV_NULL)?;
    let dev_null_w = OpenOptions::new().write(true).open(DEV_NULL)?;

    dup2(dev_null_r.as_raw_fd(), libc::STDIN_FILENO)?;
    dup2(dev_null_w.as_raw_fd(), libc::STDOUT_FILENO)?;
    dup2(dev_null_w.as_raw_fd(), libc::STDERR_FILENO)?;
    Ok(())
}

/// Start a new session and mark this process a child subreaper, so orphaned
/// runtime/container descendants land on us instead of pid 1.
pub fn become_session_leader_and_subreaper() -> Result<()> {
    setsid().context("setsid")?;
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        bail!("failed to set as subreaper")
    }
    Ok(())
}

/// If `LISTEN_PID` is set and either matches our own pid or `force` is set,
/// rewrite it to `child`'s pid before the runtime exec (spec §6). This lets
/// systemd socket activation hand descriptors to the runtime child rather
/// than to the monitor itself.
pub fn maybe_rewrite_listen_pid(child: Pid, force: bool) -> Result<()> {
    let current = match env::var("LISTEN_PID") {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(()),
        Err(e) => return Err(e).context("read LISTEN_PID"),
    };

    let matches_self = current
        .parse::<i32>()
        .map(|p| p == std::process::id() as i32)
        .unwrap_or(false);

    if matches_self || force {
        env::set_var("LISTEN_PID", child.to_string());
    }
    Ok(())
}

/// Write the container's exit code to `<exit-dir>/<cid>`, decimal, no
/// trailing newline, written once on exit (spec §6).
pub fn write_exit_file(exit_dir: &Path, cid: &str, code: i32) -> Result<()> {
    fs::create_dir_all(exit_dir).context("create exit dir")?;
    let path = exit_dir.join(cid);
    fs::write(&path, code.to_string()).context("write exit file")
}

struct ExitCommand {
    path: std::path::PathBuf,
    args: Vec<String>,
    delay: u32,
}

static EXIT_COMMAND: Mutex<Option<ExitCommand>> = Mutex::new(None);

/// Register the orchestrator's exit command so it still runs even if a
/// fatal error strikes immediately after this call (spec §9, "Exit-command
/// as atexit", a behavioral requirement, not an implementation nicety).
/// Must be called before the runtime fork.
pub fn register_exit_command(path: Option<&Path>, args: &[String], delay: u32) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => return Ok(()),
    };
    let mut slot = EXIT_COMMAND.lock().expect("exit command mutex poisoned");
    *slot = Some(ExitCommand {
        path: path.to_path_buf(),
        args: args.to_vec(),
        delay,
    });
    drop(slot);
    unsafe { libc::atexit(run_exit_command_hook) };
    Ok(())
}

extern "C" fn run_exit_command_hook() {
    let cmd = {
        let mut slot = match EXIT_COMMAND.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        slot.take()
    };
    let cmd = match cmd {
        Some(c) => c,
        None => return,
    };

    if cmd.delay > 0 {
        std::thread::sleep(std::time::Duration::from_secs(cmd.delay as u64));
    }

    match std::process::Command::new(&cmd.path).args(&cmd.args).spawn() {
        Ok(mut child) => {
            let _ = child.wait();
        }
        Err(e) => warn!("failed to run exit command {}: {}", cmd.path.display(), e),
    }
}

/// Fallback reaper installed via `atexit` as a last line of defense for any
/// zombie left over from an OCI runtime that errored out before the
/// self-pipe-driven reaper (`reaper.rs`) was installed.
pub extern "C" fn reap_stragglers() {
    unsafe { while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {} }
}

/// Signal used by C6 to terminate the container on timeout (spec §4.7).
pub const TIMEOUT_KILL_SIGNAL: Signal = Signal::SIGKILL;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_exit_file_writes_decimal_code_without_newline() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_exit_file(dir.path(), "ctr1", 137)?;
        let contents = fs::read_to_string(dir.path().join("ctr1"))?;
        assert_eq!(contents, "137");
        Ok(())
    }

    #[test]
    fn maybe_rewrite_listen_pid_noop_when_unset() -> Result<()> {
        env::remove_var("LISTEN_PID");
        maybe_rewrite_listen_pid(Pid::from_raw(42), false)?;
        Ok(())
    }
}
