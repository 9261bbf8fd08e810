//! The spawner handshake: socket setup, helper launch, fd reception.
//!
//! The controller binds a Unix-domain socket at a random path in the
//! configured temp directory, launches `leash-spawner` pointed at that path,
//! and waits for the helper to connect and send the rights message with the
//! child's pipe fds. Both the accept and the receive run under a 2-second
//! deadline. On success the socket path is unlinked before the child handle
//! becomes observable; on any failure the helper is killed and reaped and the
//! path is unlinked before the error is returned.

use crate::error::HandshakeError;
use crate::reactor::{Interest, Reactor, Token};
use crate::rights;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use rand::RngCore;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Deadline for each handshake step (accept, recvmsg).
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Poller token for the listening socket during accept.
const TOKEN_LISTENER: Token = Token(0);

/// What the controller needs to launch the helper.
pub(crate) struct SpawnerLaunch<'a> {
    /// Path to the `leash-spawner` executable.
    pub spawner: &'a Path,
    /// Absolute path of the target command.
    pub program: &'a Path,
    /// Arguments for the target command (not including the program itself).
    pub args: &'a [OsString],
    /// Working directory applied to the helper (inherited by the target).
    pub cwd: Option<&'a Path>,
    /// Environment overrides applied to the helper (inherited by the target).
    pub env: &'a [(OsString, OsString)],
}

/// Result of a successful handshake.
pub(crate) struct Pipes {
    /// Write end of the child's stdin pipe, non-blocking.
    pub stdin: OwnedFd,
    /// Read end of the child's stdout pipe, non-blocking.
    pub stdout: OwnedFd,
    /// OS pid of the spawner helper (the group leader to signal and reap).
    pub pid: u32,
    /// Socket path used for the handshake; already unlinked, retained for
    /// the watcher's final best-effort cleanup.
    pub socket_path: PathBuf,
}

/// Runs the full handshake: bind, launch, accept, receive, unlink.
pub(crate) fn run(
    launch: &SpawnerLaunch<'_>,
    temp_dir: &Path,
    reactor: &Reactor,
) -> Result<Pipes, HandshakeError> {
    let socket_path = socket_path_in(temp_dir);
    // Tolerate a leftover path from a previous crash.
    let _ = fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(HandshakeError::Socket)?;
    if let Err(err) = listener.set_nonblocking(true) {
        let _ = fs::remove_file(&socket_path);
        return Err(HandshakeError::Socket(err));
    }

    let mut cmd = Command::new(launch.spawner);
    cmd.arg(&socket_path)
        .arg(launch.program)
        .args(launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .process_group(0);
    if let Some(dir) = launch.cwd {
        cmd.current_dir(dir);
    }
    cmd.envs(launch.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));

    let helper = match cmd.spawn() {
        Ok(helper) => helper,
        Err(err) => {
            let _ = fs::remove_file(&socket_path);
            return Err(HandshakeError::Spawn(err));
        }
    };
    let pid = helper.id();
    // Reaping is done through waitpid by the reaper thread (or abort below),
    // never through the std handle.
    drop(helper);
    debug!(pid, socket = %socket_path.display(), "spawner launched");

    match exchange(&listener, reactor) {
        Ok((stdin, stdout)) => {
            // The path must be gone before any caller can observe the handle.
            let _ = fs::remove_file(&socket_path);
            trace!(pid, "handshake complete");
            Ok(Pipes {
                stdin,
                stdout,
                pid,
                socket_path,
            })
        }
        Err(err) => {
            warn!(pid, error = %err, "handshake failed, aborting spawner");
            abort_helper(pid);
            let _ = fs::remove_file(&socket_path);
            Err(err)
        }
    }
}

/// Accepts the helper's connection and receives the rights message.
fn exchange(
    listener: &UnixListener,
    reactor: &Reactor,
) -> Result<(OwnedFd, OwnedFd), HandshakeError> {
    let stream = accept_deadline(listener, reactor, HANDSHAKE_TIMEOUT)?;
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(HandshakeError::Socket)?;

    let (stdin, stdout) = rights::recv_fds(stream.as_raw_fd())?;
    set_nonblocking(&stdin)?;
    set_nonblocking(&stdout)?;
    Ok((stdin, stdout))
}

/// Accepts one connection within `timeout`, polling through the reactor.
fn accept_deadline(
    listener: &UnixListener,
    reactor: &Reactor,
    timeout: Duration,
) -> Result<UnixStream, HandshakeError> {
    let fd = listener.as_raw_fd();
    reactor.add(fd, TOKEN_LISTENER).map_err(HandshakeError::Socket)?;
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();

    let result = loop {
        match listener.accept() {
            Ok((stream, _addr)) => break Ok(stream),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => break Err(HandshakeError::Socket(err)),
        }

        let now = Instant::now();
        if now >= deadline {
            break Err(HandshakeError::AcceptTimeout(timeout));
        }
        if let Err(err) = reactor.arm(fd, TOKEN_LISTENER, Interest::READABLE) {
            break Err(HandshakeError::Socket(err));
        }
        if let Err(err) = reactor.wait(&mut events, Some(deadline - now)) {
            break Err(HandshakeError::Socket(err));
        }
    };

    let _ = reactor.delete(fd);
    result
}

/// Kills and reaps a helper whose handshake did not complete.
fn abort_helper(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    let _ = killpg(pid, Signal::SIGKILL);
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Derives a fresh socket path: 16 random bytes, URL-safe encoded.
fn socket_path_in(temp_dir: &Path) -> PathBuf {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    let name = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw);
    temp_dir.join(format!("{name}.sock"))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), HandshakeError> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL)
        .map_err(|errno| HandshakeError::Socket(io::Error::from(errno)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags))
        .map_err(|errno| HandshakeError::Socket(io::Error::from(errno)))?;
    Ok(())
}
