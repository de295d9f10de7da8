//! `_OCI_STARTPIPE`, `_OCI_SYNCPIPE` and `_OCI_ATTACHPIPE` handling (spec §6).
//!
//! These are anonymous pipes the orchestrator hands the monitor by putting
//! their read/write fd number into an environment variable. The monitor uses
//! them to synchronize the daemonization handshake and to report the
//! container pid, or a fatal error, back to the process that invoked it.

use crate::util::write_all;
use anyhow::{Context, Result};
use log::debug;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::{close, read},
};
use std::{env, os::unix::io::RawFd};

/// Fetch a raw fd from an environment variable and mark it close-on-exec.
///
/// Returns `None` if the variable is unset; this is the normal case when the
/// orchestrator did not wire up that particular pipe (e.g. no sync pipe in
/// `--sync` mode, no attach pipe outside of `--exec-attach`).
pub fn fd_from_env(key: &str) -> Result<Option<RawFd>> {
    match env::var(key) {
        Ok(value) => {
            let fd = value
                .parse::<RawFd>()
                .with_context(|| format!("parse {} as fd", key))?;
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("mark pipe fd CLOEXEC")?;
            Ok(Some(fd))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {} from environment", key)),
    }
}

/// Block until one byte arrives on the start pipe.
///
/// The orchestrator uses this as a gate so it can place the monitor into the
/// correct cgroup before it forks or execs anything further (spec §4.1 step 2).
pub fn wait_for_start_pipe(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    read(fd, &mut buf).context("read from start pipe")?;
    Ok(())
}

/// A sync message sent as one JSON object per line on `_OCI_SYNCPIPE`.
#[derive(Debug)]
pub enum SyncMessage {
    /// Non-exec success: the container's pid.
    Pid(i32),

    /// Any create/restore failure, or an exec failure before the container
    /// produced an exit code.
    Error(String),

    /// Exec success: the exit code of the exec'd process.
    ExitCode(i32),

    /// Exec failure with a diagnostic message attached.
    ExitCodeError(i32, String),
}

impl SyncMessage {
    fn to_json(&self) -> String {
        match self {
            SyncMessage::Pid(pid) => format!(r#"{{"pid": {}}}"#, pid),
            SyncMessage::Error(msg) => {
                format!(r#"{{"pid": -1, "message": "{}"}}"#, escape_json(msg))
            }
            SyncMessage::ExitCode(code) => format!(r#"{{"exit_code": {}}}"#, code),
            SyncMessage::ExitCodeError(code, msg) => format!(
                r#"{{"exit_code": {}, "message": "{}"}}"#,
                code,
                escape_json(msg)
            ),
        }
    }
}

/// Write a sync message, terminated by a newline, to the sync pipe.
///
/// `fd` is consumed: on most paths the caller never writes to the pipe again,
/// so closing it here both flushes and frees the descriptor.
pub fn write_sync_message(fd: RawFd, message: &SyncMessage) -> Result<()> {
    let line = message.to_json();
    debug!("Writing sync message: {}", line);
    write_all(fd, line.as_bytes()).context("write sync message")?;
    write_all(fd, b"\n").context("write sync message newline")?;
    close(fd).context("close sync pipe")?;
    Ok(())
}

/// Escape a string for embedding in a JSON string literal.
///
/// Implements exactly the rule set in spec §6: `"` and `\` are
/// backslash-escaped, `\n`/`\t` map to the two-character escapes, and all
/// other control bytes (0x01-0x1f, 0x7f) are emitted as `\u00XX`. This is a
/// bijection on the escaped set: `escape` followed by the obvious inverse
/// reconstructs the original bytes for any valid UTF-8 input.
pub fn escape_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\u{:04x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_json_handles_quotes_and_backslashes() {
        assert_eq!(escape_json(r#"a"b\c"#), r#"a\"b\\c"#);
    }

    #[test]
    fn escape_json_handles_newline_and_tab() {
        assert_eq!(escape_json("a\nb\tc"), "a\\nb\\tc");
    }

    #[test]
    fn escape_json_handles_control_bytes() {
        assert_eq!(escape_json("a\x01b\x7fc"), "a\\u0001b\\u007fc");
    }

    #[test]
    fn escape_json_is_noop_for_plain_text() {
        assert_eq!(escape_json("boom: exit status 1"), "boom: exit status 1");
    }

    #[test]
    fn pid_message_format() {
        let msg = SyncMessage::Pid(1234);
        assert_eq!(msg.to_json(), r#"{"pid": 1234}"#);
    }

    #[test]
    fn error_message_escapes_payload() {
        let msg = SyncMessage::Error("boom\n".into());
        assert_eq!(msg.to_json(), r#"{"pid": -1, "message": "boom\n"}"#);
    }

    #[test]
    fn exit_code_message_format() {
        let msg = SyncMessage::ExitCode(0);
        assert_eq!(msg.to_json(), r#"{"exit_code": 0}"#);
    }

    #[test]
    fn exit_code_error_message_format() {
        let msg = SyncMessage::ExitCodeError(-1, "command timed out".into());
        assert_eq!(
            msg.to_json(),
            r#"{"exit_code": -1, "message": "command timed out"}"#
        );
    }
}
