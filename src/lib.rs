#![deny(missing_docs)]

//! This is the main library interface for this project

mod attach;
mod config;
mod container_logging;
mod control;
mod daemonize;
mod event_loop;
mod oom;
/// Namespace pinner (C9), shared between this library and the `pinns` binary.
pub mod pinns;
mod reaper;
mod stdio;
mod stream;
mod sync_pipe;
mod util;

use crate::{
    attach::AttachHub,
    config::Config,
    container_logging::ContainerLogging,
    control::ControlChannel,
    event_loop::{EventLoop, ExitOutcome},
    oom,
    reaper::{ChildReaper, ChildRole},
    stdio::{ConsoleSocket, StdioEndpoint},
    sync_pipe::SyncMessage,
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use env_logger::fmt::Color;
use getset::{Getters, MutGetters};
use log::{debug, warn, LevelFilter};
use nix::{
    sys::signal::{signal, SigHandler, Signal},
    sys::wait::{waitpid, WaitStatus},
    unistd::{close, dup2, fork, read, ForkResult, Pid},
};
use std::{
    env,
    fs,
    io::Write,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{exit, Command},
};

/// A stdin(optional)/stdout/stderr pipe triple, as handed from [`stdio::create_pipes`]
/// through the second fork to the runtime child.
type PipeTriple = (Option<stdio::PipePair>, stdio::PipePair, stdio::PipePair);

const START_PIPE_ENV_KEY: &str = "_OCI_STARTPIPE";
const SYNC_PIPE_ENV_KEY: &str = "_OCI_SYNCPIPE";
const ATTACH_PIPE_ENV_KEY: &str = "_OCI_ATTACHPIPE";

/// Bytes read from the runtime's stderr pipe to build the diagnostic
/// snippet attached to a create/restore failure's sync message (spec §8,
/// scenario 4).
const STDERR_SNIPPET_MAX: usize = 8191;

#[derive(Builder, Debug, Default, Getters, MutGetters)]
#[builder(default, pattern = "owned", setter(into))]
/// Conmon is the main structure to run the OCI container monitor.
pub struct Conmon {
    #[doc = "The main conmon configuration."]
    #[getset(get, get_mut)]
    config: Config,
}

impl Conmon {
    /// Call `run` to start a new conmon instance.
    pub fn run(&mut self) -> Result<()> {
        self.init_logging().context("init logging")?;
        debug!("Set log level to {}", self.config().log_level());

        self.config_mut().validate().context("validate config")?;
        daemonize::unset_locale();

        let mut container_logging = ContainerLogging::new(
            self.config().log_path(),
            self.config().log_size_max(),
            self.config().cuuid().as_ref(),
            self.config().name().as_ref(),
        )
        .context("configure container logging")?;

        if let Err(e) = daemonize::adjust_oom_score("-1000") {
            warn!("Unable to adjust oom score: {}", e)
        }

        unsafe {
            signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignore SIGPIPE")?;
        }
        let mut reaper = ChildReaper::install().context("install signal bridge")?;

        let start_pipe_fd =
            sync_pipe::fd_from_env(START_PIPE_ENV_KEY).context("get start pipe")?;
        if let Some(fd) = start_pipe_fd {
            // Block for an initial write to the start pipe before spawning any children or
            // exiting, so the orchestrator can put us in the right cgroup first.
            sync_pipe::wait_for_start_pipe(fd)?;
            if !self.config().exec_attach() {
                close(fd).context("close start pipe")?;
            }
        }

        daemonize::daemonize(
            self.config().sync(),
            self.config().conmon_pidfile().as_deref(),
            self.config().pidfile().as_deref(),
        )
        .context("daemonize")?;

        // Only reached in the surviving monitor process: the short-lived
        // grandparent already called `exit(0)` above and must never run the
        // exit command itself. Registered before the runtime fork so an
        // early fatal error still invokes the orchestrator's cleanup hook
        // (spec §9, "Exit-command as atexit").
        daemonize::register_exit_command(
            self.config().exit_command().as_deref(),
            self.config().exit_command_arg(),
            self.config().exit_delay(),
        )
        .context("register exit command")?;

        unsafe { libc::atexit(daemonize::reap_stragglers) };

        if self.config().sdnotify_socket().is_some() {
            warn!("sd-notify socket relaying is not supported; ignoring --sdnotify-socket");
        }

        let sync_pipe_fd = sync_pipe::fd_from_env(SYNC_PIPE_ENV_KEY).context("get sync pipe")?;
        let _attach_pipe_fd = if self.config().exec_attach() {
            sync_pipe::fd_from_env(ATTACH_PIPE_ENV_KEY).context("get attach pipe")?
        } else {
            None
        };

        // Disconnect stdio from parent: the grandparent is waiting for our stdout to close
        // before it considers the double-fork handshake complete.
        daemonize::redirect_stdio_to_dev_null().context("redirect stdio")?;
        daemonize::become_session_leader_and_subreaper().context("become subreaper")?;

        let console_socket = if self.config().terminal() {
            Some(ConsoleSocket::create().context("create console socket")?)
        } else {
            None
        };
        let pipes = if console_socket.is_none() {
            Some(stdio::create_pipes(self.config().stdin()).context("create stdio pipes")?)
        } else {
            None
        };

        let argv = self.build_runtime_argv(console_socket.as_ref().map(ConsoleSocket::path));

        let saved_mask = reaper::block_term_signals().context("block term signals")?;
        let runtime_pid = match unsafe { fork()? } {
            ForkResult::Child => {
                self.exec_runtime_child(&argv, pipes.as_ref(), &saved_mask);
                unreachable!("exec_runtime_child never returns")
            }
            ForkResult::Parent { child } => child,
        };
        reaper::restore_signal_mask(&saved_mask).context("restore signal mask")?;

        // Parent: close the worker ends of the pipes now that the runtime child holds its own
        // dup'd copies.
        if let Some((stdin_pair, stdout_pair, stderr_pair)) = &pipes {
            if let Some(pair) = stdin_pair {
                close(pair.worker_fd).ok();
            }
            close(stdout_pair.worker_fd).ok();
            close(stderr_pair.worker_fd).ok();
        }

        // The console-socket handshake completes while the runtime is still running (the
        // runtime blocks on it internally), so accepting here before waiting on the runtime
        // is sequential but race-free.
        let pty_master = match &console_socket {
            Some(console) => Some(console.recv_pty_master().context("receive pty master")?),
            None => None,
        };

        let runtime_wait = loop {
            match waitpid(runtime_pid, None) {
                Ok(status) => break status,
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("wait for runtime process"),
            }
        };

        let runtime_exit_code = match runtime_wait {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
            _ => 0,
        };

        if runtime_exit_code != 0 {
            let snippet = pipes
                .as_ref()
                .map(|(_, _, stderr_pair)| Self::read_stderr_snippet(stderr_pair.main_fd))
                .unwrap_or_default();
            warn!("runtime invocation failed: {}", snippet);
            if let Some(fd) = sync_pipe_fd {
                sync_pipe::write_sync_message(fd, &SyncMessage::Error(snippet))
                    .context("write failure sync message")?;
            }
            exit(1);
        }

        let container_pid = self
            .read_container_pid()
            .context("read container pid file")?;

        if !self.config().exec() {
            if let Some(fd) = sync_pipe_fd {
                sync_pipe::write_sync_message(fd, &SyncMessage::Pid(container_pid.as_raw()))
                    .context("write pid sync message")?;
            }
        }

        reaper.track(container_pid, ChildRole::Container);

        let bundle_path = self
            .config()
            .bundle()
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let attach = match self.config().cuuid() {
            Some(cuuid) => Some(
                AttachHub::create(
                    self.config().socket_dir_path(),
                    cuuid,
                    &bundle_path,
                    self.config().full_attach(),
                )
                .context("create attach hub")?,
            ),
            None => {
                debug!("no container UUID, skipping attach socket creation");
                None
            }
        };

        let control = ControlChannel::create(&bundle_path).context("create control channel")?;
        let oom_watcher = oom::try_subscribe(container_pid.as_raw());

        let stdio_endpoint = match pty_master {
            Some(master) => {
                StdioEndpoint::set_nonblocking(master).ok();
                StdioEndpoint::PtyBacked { master }
            }
            None => {
                let (stdin_pair, stdout_pair, stderr_pair) =
                    pipes.expect("pipe-backed stdio present when not terminal");
                let stdin_fd = stdin_pair.map(|p| p.main_fd);
                if let Some(fd) = stdin_fd {
                    StdioEndpoint::set_nonblocking(fd).ok();
                }
                StdioEndpoint::set_nonblocking(stdout_pair.main_fd).ok();
                StdioEndpoint::set_nonblocking(stderr_pair.main_fd).ok();
                StdioEndpoint::PipeBacked {
                    stdin: stdin_fd,
                    stdout: stdout_pair.main_fd,
                    stderr: stderr_pair.main_fd,
                }
            }
        };

        let mut event_loop = EventLoop::new(
            stdio_endpoint,
            attach,
            control,
            oom_watcher,
            reaper,
            container_logging,
            self.config().leave_stdin_open(),
            self.config().timeout(),
        );

        let outcome = event_loop.run().context("run event loop")?;

        if let ExitOutcome::TimedOut = outcome {
            warn!("timeout reached, killing container {}", container_pid);
            nix::sys::signal::kill(container_pid, daemonize::TIMEOUT_KILL_SIGNAL).ok();
        }

        // Tail-drain: pull anything still buffered in the stdio fds into the
        // log/attach sinks before tearing down (spec §4.1 item 10). Skipped
        // for a timed-out container, which may still be wedged.
        let (stdio_endpoint, mut attach, mut container_logging, _reaper) = event_loop.into_parts();
        if !matches!(outcome, ExitOutcome::TimedOut) {
            Self::tail_drain(&stdio_endpoint, attach.as_mut(), &mut container_logging);
        }
        if !self.config().no_sync_log() {
            container_logging.sync();
        }
        drop(attach); // unlinks the attach socket symlink (AttachHub::drop)

        let exit_code = match outcome {
            ExitOutcome::NormalExit(code) => code,
            ExitOutcome::Signaled(sig) => 128 + sig,
            ExitOutcome::TimedOut => -1,
        };

        if let Some(dir) = self.config().exit_dir() {
            daemonize::write_exit_file(dir, self.config().cid(), exit_code)
                .context("write exit file")?;
        }

        if self.config().exec() {
            if let Some(fd) = sync_pipe_fd {
                let msg = if matches!(outcome, ExitOutcome::TimedOut) {
                    SyncMessage::ExitCodeError(exit_code, "command timed out".into())
                } else {
                    SyncMessage::ExitCode(exit_code)
                };
                sync_pipe::write_sync_message(fd, &msg)
                    .context("write exec exit sync message")?;
            }
        }

        Self::close_inherited_fds();
        exit(0);
    }

    /// Drain whatever is left in the stdio fds (set non-blocking first) into
    /// the log and attach sinks once the loop has stopped reading them
    /// (spec §4.1 item 10).
    fn tail_drain(
        stdio: &StdioEndpoint,
        mut attach: Option<&mut AttachHub>,
        logging: &mut ContainerLogging,
    ) {
        for (tag, fd) in stdio.readable_fds() {
            StdioEndpoint::set_nonblocking(fd).ok();
            while let Ok(stdio::ReadOutcome::Data(mut chunk)) = stdio::read_chunk(fd) {
                if let Err(e) = logging.write_chunk(tag, chunk.bytes()) {
                    warn!("log write failed during tail drain: {:#}", e);
                }
                if let Some(attach) = attach.as_deref_mut() {
                    attach.broadcast(tag, &mut chunk);
                }
            }
        }
    }

    /// Close every fd >= 3 still open in this process, so the orchestrator
    /// sees them released before it's notified of exit (spec §4.1 item 11).
    fn close_inherited_fds() {
        let dir = match fs::read_dir("/proc/self/fd") {
            Ok(d) => d,
            Err(_) => return,
        };
        for entry in dir.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() {
                if fd >= 3 {
                    close(fd).ok();
                }
            }
        }
    }

    /// Assemble the OCI runtime's argv (everything after the runtime path
    /// itself), covering create/exec/restore subcommands and the flags that
    /// pass straight through from configuration (spec §4.1 option table).
    fn build_runtime_argv(&self, console_socket_path: Option<&Path>) -> Vec<String> {
        let config = self.config();
        let mut argv: Vec<String> = config.runtime_arg().to_vec();

        let bundle = config
            .bundle()
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let container_pidfile = config
            .container_pidfile()
            .as_ref()
            .expect("container pidfile defaulted by Config::validate");

        if let Some(restore) = config.restore() {
            argv.push("restore".into());
            argv.extend(config.restore_arg().iter().cloned());
            argv.push("--bundle".into());
            argv.push(bundle.display().to_string());
            argv.push("--image-path".into());
            argv.push(restore.display().to_string());
            argv.push("--pid-file".into());
            argv.push(container_pidfile.display().to_string());
        } else if config.exec() {
            argv.push("exec".into());
            argv.extend(config.runtime_opt().iter().cloned());
            argv.push("-d".into());
            argv.push("--pid-file".into());
            argv.push(container_pidfile.display().to_string());
            if let Some(spec) = config.exec_process_spec() {
                argv.push("--process".into());
                argv.push(spec.display().to_string());
            }
        } else {
            argv.push("create".into());
            argv.push("--bundle".into());
            argv.push(bundle.display().to_string());
            argv.push("--pid-file".into());
            argv.push(container_pidfile.display().to_string());
        }

        if config.systemd_cgroup() {
            argv.push("--systemd-cgroup".into());
        }
        if config.no_pivot() && config.restore().is_none() && !config.exec() {
            argv.push("--no-pivot".into());
        }
        if config.no_new_keyring() && !config.exec() {
            argv.push("--no-new-keyring".into());
        }
        if let Some(console) = console_socket_path {
            argv.push("--console-socket".into());
            argv.push(console.display().to_string());
        }

        argv.push(config.cid().to_string());
        argv
    }

    /// Runs only in the forked runtime child; never returns.
    fn exec_runtime_child(
        &self,
        argv: &[String],
        pipes: Option<&PipeTriple>,
        saved_mask: &nix::sys::signal::SigSet,
    ) -> ! {
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
        }
        reaper::restore_signal_mask(saved_mask).ok();

        if let Some((stdin_pair, stdout_pair, stderr_pair)) = pipes {
            if let Some(pair) = stdin_pair {
                dup2(pair.worker_fd, libc::STDIN_FILENO).ok();
            }
            dup2(stdout_pair.worker_fd, libc::STDOUT_FILENO).ok();
            dup2(stderr_pair.worker_fd, libc::STDERR_FILENO).ok();
        }

        if daemonize::maybe_rewrite_listen_pid(Pid::this(), self.config().replace_listen_pid())
            .is_err()
        {
            warn!("failed to rewrite LISTEN_PID");
        }

        let err = Command::new(self.config().runtime()).args(argv).exec();
        eprintln!("failed to exec runtime: {}", err);
        exit(127);
    }

    fn read_container_pid(&self) -> Result<Pid> {
        let path = self
            .config()
            .container_pidfile()
            .as_ref()
            .expect("container pidfile defaulted by Config::validate");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read container pidfile {}", path.display()))?;
        let raw: i32 = contents.trim().parse().context("parse container pid")?;
        Ok(Pid::from_raw(raw))
    }

    fn read_stderr_snippet(fd: std::os::unix::io::RawFd) -> String {
        let mut buf = vec![0u8; STDERR_SNIPPET_MAX];
        let mut total = 0;
        loop {
            match read(fd, &mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total >= buf.len() {
                        break;
                    }
                }
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(_) => break,
            }
        }
        buf.truncate(total);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Initialize the logger and set the verbosity to the provided level.
    fn init_logging(&self) -> Result<()> {
        // Set the logging verbosity via the env
        let level = self.config().log_level().to_string();
        env::set_var("RUST_LOG", level);

        // Initialize the logger with the format:
        // [YYYY-MM-DDTHH:MM:SS:MMMZ LEVEL crate::module file:LINE] MSG…
        // The file and line will be only printed when running with debug or trace level.
        let log_level = self.config.log_level();
        env_logger::builder()
            .format(move |buf, r| {
                let mut style = buf.style();
                style.set_color(Color::Black).set_intense(true);
                writeln!(
                    buf,
                    "{}{} {:<5} {}{}{} {}",
                    style.value("["),
                    buf.timestamp_millis(),
                    buf.default_styled_level(r.level()),
                    r.target(),
                    match (log_level >= LevelFilter::Debug, r.file(), r.line()) {
                        (true, Some(file), Some(line)) => format!(" {}:{}", file, line),
                        _ => "".into(),
                    },
                    style.value("]"),
                    r.args()
                )
            })
            .try_init()
            .context("init env logger")
    }
}
