//! Cleanup guarantee for the OS-level child.
//!
//! Two background threads are registered per child at handshake completion:
//!
//! - the **reaper** blocks in `waitpid` on the spawner pid, records the exit
//!   status, and pushes the child-exit event into the controller mailbox.
//!   Keeping the child un-reaped until this point is also the guard against
//!   pid reuse between `os_pid` and `kill`.
//! - the **watcher** parks until the controller thread terminates — normally
//!   via `stop`, or abnormally via panic — and then makes sure the OS process
//!   is gone: SIGTERM to the process group, a grace period, SIGKILL, wait for
//!   the reaper to confirm, and finally unlink the handshake socket path.
//!
//! The watcher holds only the pid and the socket path; the pipe fds stay with
//! the controller.

use crate::controller::{Mailbox, Msg};
use crate::process::ExitStatus;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How long a SIGTERM gets before escalating to SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the reaper after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

const REAP_POLL: Duration = Duration::from_millis(10);

/// Shared per-child state between reaper, watcher and controller.
#[derive(Debug)]
pub(crate) struct WatchState {
    /// Spawner pid; also its process group id.
    pub pid: u32,
    /// Handshake socket path, unlinked (again) at teardown.
    pub socket_path: PathBuf,
    /// Set once `waitpid` has collected the child.
    reaped: AtomicBool,
}

impl WatchState {
    pub fn new(pid: u32, socket_path: PathBuf) -> Self {
        Self {
            pid,
            socket_path,
            reaped: AtomicBool::new(false),
        }
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }
}

/// Held by the controller thread; dropping it (normal exit or panic) releases
/// the watcher to run cleanup.
#[derive(Debug)]
pub(crate) struct WatcherGuard {
    _alive: mpsc::Sender<()>,
}

/// Spawns the reaper thread: blocking `waitpid` on the spawner pid, then the
/// exit event into the mailbox.
pub(crate) fn spawn_reaper(state: Arc<WatchState>, mailbox: Arc<Mailbox>) -> std::io::Result<()> {
    let pid = Pid::from_raw(state.pid as i32);
    std::thread::Builder::new()
        .name(format!("leash-reap-{}", state.pid))
        .spawn(move || {
            let status = loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => break ExitStatus::exited(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        break ExitStatus::signaled(signal as i32)
                    }
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        // ECHILD here means somebody else reaped our child;
                        // nothing further to collect.
                        error!(pid = state.pid, %errno, "waitpid failed");
                        break ExitStatus::unknown();
                    }
                }
            };
            state.reaped.store(true, Ordering::Release);
            debug!(pid = state.pid, %status, "child reaped");
            let _ = mailbox.push(Msg::Exited(status));
        })?;
    Ok(())
}

/// Spawns the watcher thread and returns the guard the controller must hold.
pub(crate) fn register(state: Arc<WatchState>) -> std::io::Result<WatcherGuard> {
    let (alive, released) = mpsc::channel::<()>();
    std::thread::Builder::new()
        .name(format!("leash-watch-{}", state.pid))
        .spawn(move || {
            // Blocks until every sender is gone, i.e. the controller thread
            // has terminated for any reason.
            let _ = released.recv();
            cleanup(&state);
        })?;
    Ok(WatcherGuard { _alive: alive })
}

fn cleanup(state: &WatchState) {
    if !state.is_reaped() {
        let group = Pid::from_raw(state.pid as i32);
        debug!(pid = state.pid, "controller gone, terminating child group");
        let _ = killpg(group, Signal::SIGTERM);
        if !wait_reaped(state, TERM_GRACE) {
            warn!(pid = state.pid, "child survived SIGTERM, escalating");
            let _ = killpg(group, Signal::SIGKILL);
            if !wait_reaped(state, KILL_WAIT) {
                error!(pid = state.pid, "child not reaped after SIGKILL");
            }
        }
    }
    // Normally unlinked right after the handshake; this covers crashes in
    // between.
    let _ = fs::remove_file(&state.socket_path);
    debug!(pid = state.pid, "watcher cleanup done");
}

fn wait_reaped(state: &WatchState, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if state.is_reaped() {
            return true;
        }
        std::thread::sleep(REAP_POLL);
    }
    state.is_reaped()
}
