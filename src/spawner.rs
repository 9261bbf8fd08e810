//! The spawner helper: fork/exec the target and hand its pipe fds back.
//!
//! This module uses unsafe code for the fork/exec sequence; everything the
//! child does between `fork` and `execv` is async-signal-safe (dup2, close,
//! `_exit`).
//!
//! The helper is invoked by the controller as
//! `leash-spawner <socket-path> <cmd-abs-path> [arg …]`, in a dedicated
//! process group and with cwd/env already applied. It connects to the
//! controller's socket, creates the two stdio pipes, forks and execs the
//! target, sends the controller-side pipe ends over the socket as one rights
//! message, and then waits on the target: the helper's own exit code is the
//! target's exit code, or `128 + signo` if the target was signalled. Because
//! the helper is the target's parent and stays in the same process group, a
//! group signal from the controller reaches both.

#![allow(unsafe_code)]

use crate::rights;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, pipe, ForkResult};
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Error type for the spawner helper.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SpawnerError {
    /// Connecting to the controller's socket failed.
    #[error("cannot connect to controller socket: {0}")]
    Connect(#[source] io::Error),

    /// Creating a stdio pipe failed.
    #[error("cannot create pipe: {0}")]
    Pipe(#[source] Errno),

    /// The command path or an argument contains an interior NUL byte.
    #[error("argument contains an interior nul byte")]
    NulByte,

    /// No command was given to exec.
    #[error("no command given")]
    EmptyArgv,

    /// Forking the target failed.
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),

    /// Sending the rights message failed.
    #[error("cannot send pipe fds: {0}")]
    Send(#[source] Errno),

    /// Waiting on the target failed.
    #[error("waitpid failed: {0}")]
    Wait(#[source] Errno),
}

/// Runs the helper: exec the target described by `argv` and return its exit
/// code once it terminates.
///
/// `argv[0]` is the absolute path of the target command; the remaining
/// entries are its arguments.
///
/// # Errors
///
/// Fails if the socket, pipes, fork or fd hand-off fail. An exec failure is
/// reported through the child's exit code (`127`), not through this function.
pub fn run(socket_path: &Path, argv: &[OsString]) -> Result<i32, SpawnerError> {
    let program = argv.first().ok_or(SpawnerError::EmptyArgv)?;
    let program = cstring(program.as_os_str().as_bytes())?;
    let args: Vec<CString> = argv
        .iter()
        .map(|arg| cstring(arg.as_os_str().as_bytes()))
        .collect::<Result<_, _>>()?;

    let stream = UnixStream::connect(socket_path).map_err(SpawnerError::Connect)?;

    // Pipe 1 carries the child's stdin, pipe 2 its stdout.
    let (stdin_r, stdin_w) = pipe().map_err(SpawnerError::Pipe)?;
    let (stdout_r, stdout_w) = pipe().map_err(SpawnerError::Pipe)?;

    // SAFETY: the child performs only async-signal-safe operations (dup2,
    // close, execv, _exit) before its address space is replaced.
    match unsafe { fork() }.map_err(SpawnerError::Fork)? {
        ForkResult::Child => {
            // All child-side failures must _exit; returning would let the
            // fork keep running the helper's code.
            unsafe {
                if libc::dup2(stdin_r.as_raw_fd(), libc::STDIN_FILENO) < 0 {
                    libc::_exit(1);
                }
                if libc::dup2(stdout_w.as_raw_fd(), libc::STDOUT_FILENO) < 0 {
                    libc::_exit(1);
                }
            }
            drop(stdin_r);
            drop(stdin_w);
            drop(stdout_r);
            drop(stdout_w);
            drop(stream);

            let _ = execv(&program, &args);
            // 127: command-not-found convention.
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            // The child-side ends belong to the child now.
            drop(stdin_r);
            drop(stdout_w);

            rights::send_fds(
                stream.as_raw_fd(),
                &[stdin_w.as_raw_fd(), stdout_r.as_raw_fd()],
            )
            .map_err(SpawnerError::Send)?;

            // Hand-off complete: the controller holds duplicates, ours close
            // so the controller is the sole owner of the parent-side ends.
            drop(stdin_w);
            drop(stdout_r);
            drop(stream);

            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(SpawnerError::Wait(errno)),
                }
            }
        }
    }
}

fn cstring(bytes: &[u8]) -> Result<CString, SpawnerError> {
    CString::new(bytes).map_err(|_| SpawnerError::NulByte)
}
