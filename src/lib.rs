//! Demand-driven child process supervision.
//!
//! `leash` spawns an external OS process and exposes its stdin/stdout as
//! explicit pull/push endpoints: the controlling program reads bytes only when
//! it wants them and writes bytes only when it has capacity, with
//! back-pressure flowing through the OS pipe buffers in both directions.
//! Nothing is buffered in memory beyond the single in-flight read or write.
//!
//! Three pieces cooperate per child:
//!
//! - the `leash-spawner` helper executable, which execs the target command and
//!   hands the pipe file descriptors back over a Unix-domain socket using an
//!   `SCM_RIGHTS` rights message;
//! - a per-child controller thread, a cooperative state machine that owns the
//!   child's lifecycle and serialises one outstanding read and one
//!   outstanding write over non-blocking I/O with readiness notifications;
//! - a watcher that guarantees the OS process is signalled and reaped, and
//!   the handshake socket unlinked, even if the controller dies abnormally.
//!
//! # Example
//!
//! ```ignore
//! use leash::{Command, ReadResult};
//!
//! let child = Command::new("cat").spawn()?;
//! child.write(b"hello")?;
//! child.close_stdin()?;
//! assert_eq!(child.read(5)?, ReadResult::Complete(b"hello".to_vec()));
//! assert!(matches!(child.read(1)?, ReadResult::Eof(_)));
//! let status = child.wait(None)?;
//! assert!(status.success());
//! # Ok::<(), leash::Error>(())
//! ```
//!
//! # Back-pressure
//!
//! `write` blocks the calling thread until the kernel pipe has accepted every
//! byte; `read` blocks until the requested count has been gathered or the
//! child closes its stdout. At most one read and one write may be in flight
//! per child; a second concurrent call fails immediately with
//! [`Error::PendingRead`] or [`Error::PendingWrite`] rather than queueing.
//!
//! # Platform support
//!
//! Unix only: the fd hand-off protocol and process-group signalling have no
//! Windows equivalent.

#![deny(unsafe_code)]
#![warn(missing_docs)]

#[cfg(windows)]
compile_error!("leash relies on Unix pipes, SCM_RIGHTS and process groups");

pub mod error;
pub mod process;
pub mod signal;
pub mod spawner;

mod controller;
mod handshake;
mod reactor;
mod rights;
mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, HandshakeError};
pub use process::{Child, Command, ExitStatus, ReadResult};
pub use signal::SignalKind;
