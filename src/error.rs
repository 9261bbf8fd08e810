//! Error types for child process control.
//!
//! Errors fall into the categories the controller distinguishes:
//!
//! - **Validation**: rejected before any child exists (`CommandNotFound`,
//!   `CwdNotFound`, `NulByte`, `InvalidReadSize`).
//! - **OS**: a raw errno from a pipe syscall, surfaced to the one caller
//!   whose operation failed; the controller itself stays alive.
//! - **Protocol state**: `PendingRead`, `PendingWrite`, `StdinClosed` —
//!   synchronous rejections that never touch the child.
//! - **Terminal**: `Exited`, `ProcessNotAlive`, `WaitTimeout`.
//! - **Handshake**: fatal at construction; no controller is created and all
//!   resources are released.
//!
//! `EAGAIN` is never surfaced through any of these — it only re-arms a
//! readiness notification inside the controller.

use crate::process::ExitStatus;
use nix::errno::Errno;
use std::io;
use std::path::PathBuf;

/// Error type for all child process operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The program could not be resolved to an executable (ENOENT at spawn).
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The requested working directory does not exist.
    #[error("working directory does not exist: {}", .0.display())]
    CwdNotFound(PathBuf),

    /// The program path or an argument contains an interior NUL byte.
    #[error("argument contains an interior nul byte")]
    NulByte,

    /// `read` was called with a size of zero.
    #[error("read size must be a positive number of bytes")]
    InvalidReadSize,

    /// The fd hand-off with the spawner helper failed; no child handle exists.
    #[error("handshake with spawner failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// A read is already in flight on this child.
    #[error("another read is already in flight")]
    PendingRead,

    /// A write is already in flight on this child.
    #[error("another write is already in flight")]
    PendingWrite,

    /// The child's stdin has been closed; no further writes are possible.
    #[error("child stdin is closed")]
    StdinClosed,

    /// The child has terminated; the captured status is attached.
    #[error("child has exited: {0}")]
    Exited(ExitStatus),

    /// No OS process is known for this child any more.
    #[error("process is not alive")]
    ProcessNotAlive,

    /// `wait` gave up because its deadline fired before the child exited.
    #[error("timed out waiting for child exit")]
    WaitTimeout,

    /// A pipe syscall failed; carries the raw OS errno.
    #[error("os error: {0}")]
    Os(#[source] Errno),

    /// A local resource could not be set up (thread spawn, poller creation).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The controller terminated while the caller was still waiting.
    #[error("controller is gone")]
    ControllerGone,
}

impl Error {
    /// Maps an `io::Error` from a pipe syscall to the raw-errno variant.
    pub(crate) fn os(err: &io::Error) -> Self {
        Self::Os(err.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw))
    }
}

/// Fatal error during the spawner handshake.
///
/// Any of these aborts construction: the helper (if launched) is killed and
/// reaped, and the socket path is unlinked before the error is returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// No `leash-spawner` executable could be located.
    #[error("spawner helper not found (set LEASH_SPAWNER or Command::spawner_path)")]
    SpawnerNotFound,

    /// Binding or accepting on the handshake socket failed.
    #[error("handshake socket error: {0}")]
    Socket(#[source] io::Error),

    /// Launching the spawner helper process failed.
    #[error("failed to launch spawner: {0}")]
    Spawn(#[source] io::Error),

    /// The spawner did not connect within the handshake deadline.
    #[error("spawner did not connect within {0:?}")]
    AcceptTimeout(std::time::Duration),

    /// The spawner connected but no rights message arrived in time.
    #[error("no rights message within {0:?}")]
    RecvTimeout(std::time::Duration),

    /// Receiving the rights message failed at the socket level.
    #[error("receiving rights message failed: {0}")]
    Recv(#[source] Errno),

    /// The rights message did not have the expected shape.
    #[error("malformed rights message: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn os_error_carries_errno() {
        init_test("os_error_carries_errno");
        let io = io::Error::from_raw_os_error(libc::EPIPE);
        let err = Error::os(&io);
        let is_epipe = matches!(err, Error::Os(Errno::EPIPE));
        crate::assert_with_log!(is_epipe, "errno mapped", "EPIPE", err);
        crate::test_complete!("os_error_carries_errno");
    }

    #[test]
    fn display_is_nonempty() {
        init_test("display_is_nonempty");
        let errs: Vec<Error> = vec![
            Error::CommandNotFound("frobnicate".into()),
            Error::PendingRead,
            Error::PendingWrite,
            Error::StdinClosed,
            Error::WaitTimeout,
            Error::ControllerGone,
            Error::Handshake(HandshakeError::Malformed("expected two fds")),
        ];
        for err in errs {
            let text = err.to_string();
            crate::assert_with_log!(!text.is_empty(), "display", "non-empty", text);
        }
        crate::test_complete!("display_is_nonempty");
    }

    #[test]
    fn command_not_found_names_the_command() {
        init_test("command_not_found_names_the_command");
        let err = Error::CommandNotFound("doesnotexist".into());
        let text = err.to_string();
        crate::assert_with_log!(
            text.contains("doesnotexist"),
            "message names command",
            "command not found: doesnotexist",
            text
        );
        crate::test_complete!("command_not_found_names_the_command");
    }
}
