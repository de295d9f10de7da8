//! Namespace pinner (C9): shared logic for the `pinns` binary.
//!
//! Grounded in `examples/original_source/pinns/src/pinns.c`'s `bind_ns` /
//! sysctl-application shape, generalized per spec §4.9 to cover the fuller
//! fork-based user/mount-namespace protocol and the `host`-passthrough and
//! uid/gid-map handling the plain C `unshare()`-in-place version didn't need.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::{
    fcntl::{open, OFlag},
    mount::{mount, MsFlags},
    sched::{unshare, CloneFlags},
    sys::signal::{self, Signal},
    sys::stat::Mode,
    sys::wait::waitpid,
    unistd::{close, fork, mkdir, pipe, read, write, ForkResult, Pid},
};
use std::{
    fs,
    os::unix::{fs::PermissionsExt, io::RawFd},
    path::{Path, PathBuf},
};

/// One namespace kind pinns can unshare and bind-mount.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NsKind {
    /// UTS namespace (hostname/domainname).
    Uts,
    /// IPC namespace (SysV IPC, POSIX message queues).
    Ipc,
    /// Network namespace.
    Net,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
    /// Mount namespace.
    Mnt,
}

impl NsKind {
    fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }

    fn proc_name(self) -> &'static str {
        match self {
            NsKind::Uts => "uts",
            NsKind::Ipc => "ipc",
            NsKind::Net => "net",
            NsKind::User => "user",
            NsKind::Cgroup => "cgroup",
            NsKind::Mnt => "mnt",
        }
    }

    fn pin_dir_name(self) -> String {
        format!("{}ns", self.proc_name())
    }
}

/// One requested namespace: either pinned fresh (unshared) or passed through
/// from an existing host namespace named by path (spec §4.9 item 2).
pub struct NsRequest {
    /// Which namespace kind this entry is for.
    pub kind: NsKind,
    /// If true, bind the host's existing namespace instead of a fresh one.
    pub host_passthrough: bool,
}

/// Full set of pinning work to do, parsed from argv by `src/bin/pinns.rs`.
pub struct PinRequest {
    /// Directory under which `<kind>ns/<file_name>` pin files are created.
    pub pin_dir: PathBuf,
    /// File name used for every pinned namespace kind.
    pub file_name: String,
    /// The namespaces to pin.
    pub namespaces: Vec<NsRequest>,
    /// `key=value` sysctls to apply after unsharing.
    pub sysctls: Vec<(String, String)>,
    /// Optional uid map string for a pinned user namespace.
    pub uid_map: Option<String>,
    /// Optional gid map string for a pinned user namespace.
    pub gid_map: Option<String>,
}

/// Run the full pin sequence; on any individual namespace failure, warn and
/// continue so partial mounts are left in place and reported, matching the
/// historical "best effort, exit 0 only on full success" contract.
pub fn run(req: &PinRequest) -> Result<()> {
    ensure_pin_dir(&req.pin_dir)?;

    let needs_fork = req
        .namespaces
        .iter()
        .any(|n| !n.host_passthrough && matches!(n.kind, NsKind::User | NsKind::Mnt));

    let mut any_failed = false;

    // The mount namespace pin target must be self-bind-mounted and marked
    // MS_UNBINDABLE before /proc/<pid>/ns/mnt is bound onto it below,
    // whether that bind happens via the helper or in this process.
    if req.namespaces.iter().any(|n| n.kind == NsKind::Mnt) {
        if let Err(e) = prepare_mnt_pin_target(&req.pin_dir) {
            warn!("failed to prepare mount namespace pin target: {:#}", e);
            any_failed = true;
        }
    }

    if needs_fork {
        if let Err(e) = run_via_helper(req) {
            warn!("namespace helper failed: {:#}", e);
            any_failed = true;
        }
    } else {
        for ns in req.namespaces.iter().filter(|n| !n.host_passthrough) {
            if let Err(e) = unshare(ns.kind.clone_flag()) {
                warn!("failed to unshare {:?}: {}", ns.kind, e);
                any_failed = true;
                continue;
            }
        }
    }

    if !req.sysctls.is_empty() {
        if let Err(e) = apply_sysctls(&req.sysctls) {
            warn!("failed to apply sysctls: {:#}", e);
            any_failed = true;
        }
    }

    // User/mount namespaces were already bound to the helper's
    // /proc/<pid>/ns/* entries by `bind_helper_namespaces` above; binding
    // them again here from /proc/self/ns would bind this process's
    // (unchanged) namespace over the correct one.
    let already_bound_via_helper =
        |kind: NsKind| needs_fork && matches!(kind, NsKind::User | NsKind::Mnt);

    for ns in req
        .namespaces
        .iter()
        .filter(|n| !already_bound_via_helper(n.kind))
    {
        let bind_path = req.pin_dir.join(ns.kind.pin_dir_name()).join(&req.file_name);
        let proc_ns_path = if ns.host_passthrough {
            PathBuf::from(format!("/proc/1/ns/{}", ns.kind.proc_name()))
        } else {
            PathBuf::from(format!("/proc/self/ns/{}", ns.kind.proc_name()))
        };

        if let Err(e) = bind_ns(&proc_ns_path, &bind_path) {
            warn!("failed to bind mount {:?}: {:#}", ns.kind, e);
            any_failed = true;
        }
    }

    if any_failed {
        bail!("one or more namespaces failed to pin; partial mounts left in place")
    }
    Ok(())
}

fn ensure_pin_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).context("create pin dir")?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).ok();
    }
    Ok(())
}

/// Create `<pin>/<kind>ns/<filename>` (tolerating `EEXIST` on the file, not
/// on the mount), then bind-mount the proc namespace path onto it.
fn bind_ns(proc_ns_path: &Path, bind_path: &Path) -> Result<()> {
    if let Some(parent) = bind_path.parent() {
        fs::create_dir_all(parent).context("create namespace pin subdir")?;
    }

    match open(
        bind_path,
        OFlag::O_RDONLY | OFlag::O_CREAT | OFlag::O_EXCL,
        Mode::empty(),
    ) {
        Ok(fd) => {
            close(fd).ok();
        }
        Err(nix::Error::Sys(nix::errno::Errno::EEXIST)) => {}
        Err(e) => return Err(e).context("create ns pin file"),
    }

    mount(
        Some(proc_ns_path),
        bind_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind mount {} onto {}", proc_ns_path.display(), bind_path.display()))
}

/// Make `<pin>/mntns` a self-bind-mount and mark it `MS_UNBINDABLE`, which
/// the kernel requires of the target before it will accept a mount
/// namespace bind-mount onto it (spec §4.9 item 5).
fn prepare_mnt_pin_target(pin_dir: &Path) -> Result<()> {
    let mntns_dir = pin_dir.join(NsKind::Mnt.pin_dir_name());
    fs::create_dir_all(&mntns_dir).context("create mntns pin dir")?;

    mount(
        Some(&mntns_dir),
        &mntns_dir,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .context("self-bind-mount mntns pin dir")?;

    mount(
        None::<&str>,
        &mntns_dir,
        None::<&str>,
        MsFlags::MS_UNBINDABLE,
        None::<&str>,
    )
    .context("mark mntns pin dir MS_UNBINDABLE")
}

/// Apply `key=value` sysctls by writing `value` to `/proc/sys/<key with . -> />`.
fn apply_sysctls(sysctls: &[(String, String)]) -> Result<()> {
    for (key, value) in sysctls {
        let path = PathBuf::from("/proc/sys").join(key.replace('.', "/"));
        fs::write(&path, value)
            .with_context(|| format!("write sysctl {}={}", key, value))?;
        debug!("applied sysctl {}={}", key, value);
    }
    Ok(())
}

/// Fork a helper that unshares the user namespace (and, if requested, the
/// mount namespace) while the parent writes the uid/gid maps, per the
/// protocol in spec §4.9 item 3:
///
/// 1. Child unshares the user namespace first, then signals the parent via
///    a pipe.
/// 2. Parent writes `uid_map`/`gid_map` (substituting `@` -> newline and
///    `-` -> space) to `/proc/<pid>/{uid,gid}_map`.
/// 3. Child unshares any remaining requested kinds and pauses.
/// 4. Parent does its own (non-forked) unshares for any kinds that don't
///    require the helper, then SIGKILLs the helper and reaps it. The
///    bind-mounts in `run` target `/proc/<pid>/ns/<kind>` on the helper
///    before it is killed.
fn run_via_helper(req: &PinRequest) -> Result<()> {
    let (signal_read, signal_write) = pipe().context("create helper signal pipe")?;

    match unsafe { fork()? } {
        ForkResult::Child => {
            close(signal_read).ok();
            if let Err(e) = unshare(CloneFlags::CLONE_NEWUSER) {
                warn!("helper failed to unshare user ns: {}", e);
            }
            write(signal_write, &[1u8]).ok();
            close(signal_write).ok();

            let remaining: CloneFlags = req
                .namespaces
                .iter()
                .filter(|n| !n.host_passthrough && n.kind != NsKind::User)
                .fold(CloneFlags::empty(), |acc, n| acc | n.kind.clone_flag());
            if !remaining.is_empty() {
                if let Err(e) = unshare(remaining) {
                    warn!("helper failed to unshare remaining namespaces: {}", e);
                }
            }

            // Pause until killed by the parent once it has finished
            // bind-mounting our /proc/<pid>/ns/* entries.
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }
        ForkResult::Parent { child } => {
            close(signal_write).ok();
            wait_for_signal(signal_read)?;
            close(signal_read).ok();

            if let Some(uid_map) = &req.uid_map {
                write_id_map(child, "uid_map", uid_map)?;
            }
            if let Some(gid_map) = &req.gid_map {
                write_id_map(child, "gid_map", gid_map)?;
            }

            // Give the helper a moment to finish its own remaining unshares
            // before we bind-mount its /proc/<pid>/ns/* entries.
            std::thread::sleep(std::time::Duration::from_millis(50));

            let result = bind_helper_namespaces(child, req);

            signal::kill(child, Signal::SIGKILL).ok();
            waitpid(child, None).ok();

            result
        }
    }
}

fn wait_for_signal(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    read(fd, &mut buf).context("read helper ready signal")?;
    Ok(())
}

fn write_id_map(pid: Pid, file_name: &str, spec: &str) -> Result<()> {
    let translated = spec.replace('@', "\n").replace('-', " ");
    let path = format!("/proc/{}/{}", pid, file_name);
    fs::write(&path, translated).with_context(|| format!("write {}", path))
}

/// Bind-mount the helper's `/proc/<pid>/ns/<kind>` entries for the
/// user/mount-namespace kinds that were unshared inside the helper, rather
/// than in this process.
fn bind_helper_namespaces(pid: Pid, req: &PinRequest) -> Result<()> {
    for ns in req
        .namespaces
        .iter()
        .filter(|n| !n.host_passthrough && matches!(n.kind, NsKind::User | NsKind::Mnt))
    {
        let bind_path = req.pin_dir.join(ns.kind.pin_dir_name()).join(&req.file_name);
        let proc_ns_path = PathBuf::from(format!("/proc/{}/ns/{}", pid, ns.kind.proc_name()));
        bind_ns(&proc_ns_path, &bind_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_map_translates_placeholders() {
        let translated = "0 0 1@1000 1000 1".replace('@', "\n").replace('-', " ");
        assert_eq!(translated, "0 0 1\n1000 1000 1");
    }

    #[test]
    fn pin_dir_names_match_kind() {
        assert_eq!(NsKind::Uts.pin_dir_name(), "utsns");
        assert_eq!(NsKind::Mnt.pin_dir_name(), "mntns");
    }
}
