//! Attach hub (C3): the seqpacket socket that mirrors container stdio to
//! zero or more connected clients.

use crate::{stdio::ReadChunk, stream::StreamTag, util::write_all};
use anyhow::{Context, Result};
use log::{debug, warn};
use nix::{
    sys::socket::{
        accept4, bind, listen, recv, send, socket, AddressFamily, MsgFlags, SockAddr, SockFlag,
        SockType,
    },
    sys::stat::Mode,
    unistd::{close, symlinkat, unlink},
};
use std::{
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Max bytes read from a client in one go before writing to the container's
/// stdin master (spec §4.3).
const CLIENT_READ_MAX: usize = 32 * 1024;

/// A connected attach peer. Half-close is tracked independently per
/// direction; the client is dropped from the set once both are closed.
pub struct AttachClient {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

impl AttachClient {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: true,
            writable: true,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_done(&self) -> bool {
        !self.readable && !self.writable
    }

    fn shutdown_write(&mut self) {
        self.writable = false;
    }

    fn shutdown_read(&mut self) {
        self.readable = false;
    }

    /// Whether the client's sending direction is still open. Once false the
    /// event loop must stop polling this fd for `POLLIN`, or a disconnected
    /// client's `recv`-returns-0 re-fires every iteration.
    pub fn is_readable(&self) -> bool {
        self.readable
    }
}

impl Drop for AttachClient {
    fn drop(&mut self) {
        close(self.fd).ok();
    }
}

/// The listening socket plus the set of connected clients, and the bits of
/// filesystem state (symlink, socket path) created to expose it.
pub struct AttachHub {
    listener: RawFd,
    clients: Vec<AttachClient>,
    symlink_path: Option<PathBuf>,
    socket_path: PathBuf,
}

impl AttachHub {
    /// Unix socket pathname length limit (`sizeof(sun_path)` on Linux,
    /// sans NUL).
    const SUN_PATH_MAX: usize = 107;

    /// Build the `<socket-dir>/<cuuid>` symlink to `bundle_path` (worked
    /// around because bundle paths routinely exceed the ~108 byte socket
    /// pathname limit), then listen on `<socket-dir>/<cuuid>/attach`.
    ///
    /// If `full_attach` is set, the symlink indirection is skipped and the
    /// socket is created directly under `bundle_path` instead.
    pub fn create(
        socket_dir: &Path,
        cuuid: &str,
        bundle_path: &Path,
        full_attach: bool,
    ) -> Result<Self> {
        let (socket_dir_for_cuuid, symlink_path) = if full_attach {
            (bundle_path.to_path_buf(), None)
        } else {
            let mut link_path = socket_dir.join(cuuid);
            let mut link_path_str = link_path.to_string_lossy().into_owned();

            // Best-effort single-character shortening if the composed path
            // hits the pathname limit exactly (spec §4.3, Open Question:
            // collisions from shortening are tolerated).
            if link_path_str.len() == Self::SUN_PATH_MAX {
                link_path_str.pop();
                link_path = PathBuf::from(link_path_str);
            }

            symlinkat(bundle_path, None, &link_path).context("create attach socket symlink")?;
            (link_path.clone(), Some(link_path))
        };

        let socket_path = socket_dir_for_cuuid.join("attach");

        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create attach socket")?;

        let addr = SockAddr::new_unix(&socket_path).context("build attach socket address")?;
        bind(listener, &addr).context("bind attach socket")?;
        nix::unistd::fchmod(listener, Mode::from_bits_truncate(0o700)).ok();
        listen(listener, 10).context("listen on attach socket")?;

        debug!("Attach socket listening at {}", socket_path.display());

        Ok(Self {
            listener,
            clients: Vec::new(),
            symlink_path,
            socket_path,
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn clients(&self) -> &[AttachClient] {
        &self.clients
    }

    /// Accept one new connection. Call when the listener fd is readable.
    pub fn accept_one(&mut self) {
        match accept4(self.listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => {
                debug!("Accepted new attach client, fd {}", fd);
                self.clients.push(AttachClient::new(fd));
            }
            Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => {}
            Err(e) => warn!("failed to accept attach client: {}", e),
        }
    }

    /// Forward one chunk of container output to every connected client as a
    /// framed datagram: `[tag_byte, ...payload]`.
    ///
    /// Iterates in reverse so a client can be removed mid-iteration safely.
    pub fn broadcast(&mut self, tag: StreamTag, chunk: &mut ReadChunk) {
        chunk.set_tag_byte(tag.attach_byte());
        let frame = chunk.framed();

        for i in (0..self.clients.len()).rev() {
            let client = &mut self.clients[i];
            if !client.writable {
                continue;
            }
            match send(client.fd, frame, MsgFlags::MSG_NOSIGNAL) {
                Ok(_) => {}
                Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => {
                    // Best-effort: a slow client may simply lose this frame.
                }
                Err(e) => {
                    warn!("attach client write failed, disconnecting: {}", e);
                    client.shutdown_write();
                }
            }
            if client.is_done() {
                self.clients.remove(i);
            }
        }
    }

    /// Read one datagram from `client_idx` and write it to the container's
    /// stdin master, if any. Returns `true` if the client's write-half (its
    /// sending direction) has now closed.
    pub fn read_from_client(&mut self, client_idx: usize, stdin_fd: Option<RawFd>) -> bool {
        let client = &mut self.clients[client_idx];
        let mut buf = [0u8; CLIENT_READ_MAX];
        let mut closed_write = false;
        match recv(client.fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                // The client closed its sending half; there is nothing left
                // to read from it, so stop polling it too.
                client.shutdown_read();
                closed_write = true;
            }
            Ok(n) => {
                if let Some(fd) = stdin_fd {
                    if let Err(e) = write_all(fd, &buf[..n]) {
                        warn!("failed to forward attach input to container: {:#}", e);
                    }
                }
            }
            Err(nix::Error::Sys(nix::errno::Errno::EWOULDBLOCK)) => {}
            Err(e) => {
                warn!("attach client read failed: {}", e);
                client.shutdown_read();
                closed_write = true;
            }
        }
        if self.clients[client_idx].is_done() {
            self.clients.remove(client_idx);
        }
        closed_write
    }
}

impl Drop for AttachHub {
    fn drop(&mut self) {
        close(self.listener).ok();
        if let Some(path) = &self.symlink_path {
            unlink(path).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_builds_symlink_and_socket() -> Result<()> {
        let socket_dir = tempdir()?;
        let bundle = tempdir()?;

        let hub = AttachHub::create(socket_dir.path(), "cuuid1", bundle.path(), false)?;
        assert!(hub.socket_path().starts_with(socket_dir.path()));
        assert!(socket_dir.path().join("cuuid1").exists());
        Ok(())
    }

    #[test]
    fn full_attach_skips_symlink() -> Result<()> {
        let socket_dir = tempdir()?;
        let bundle = tempdir()?;

        let hub = AttachHub::create(socket_dir.path(), "cuuid2", bundle.path(), true)?;
        assert_eq!(hub.socket_path(), bundle.path().join("attach"));
        assert!(!socket_dir.path().join("cuuid2").exists());
        Ok(())
    }
}
