//! Public API: the [`Command`] builder and the [`Child`] handle.
//!
//! # Example
//!
//! ```ignore
//! use leash::{Command, ReadResult, SignalKind};
//!
//! let child = Command::new("sh")
//!     .arg("-c")
//!     .arg("tr a-z A-Z")
//!     .current_dir("/tmp")
//!     .env("LANG", "C")
//!     .spawn()?;
//!
//! child.write(b"hello")?;
//! child.close_stdin()?;
//! let out = child.read(5)?;
//! let status = child.wait(None)?;
//! # Ok::<(), leash::Error>(())
//! ```
//!
//! Every operation on [`Child`] goes through the child's controller and
//! blocks the calling thread until the controller replies; that blocking is
//! the back-pressure. The handle can be shared across threads (`&Child` is
//! enough for every operation), but only one read and one write may be in
//! flight at a time.

use crate::controller::{Controller, Mailbox, Msg, ReadSize, Reply, Request};
use crate::error::{Error, HandshakeError};
use crate::handshake::{self, SpawnerLaunch};
use crate::reactor::Reactor;
use crate::signal::SignalKind;
use crate::watcher::{self, WatchState};
use std::env;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Name of the helper binary the controller launches.
const SPAWNER_BIN: &str = "leash-spawner";

/// Environment variable overriding spawner discovery.
const SPAWNER_ENV: &str = "LEASH_SPAWNER";

/// Builder for supervised child processes.
///
/// The option set is closed: a program, its arguments, environment overrides
/// and a working directory — plus the ambient configuration (`temp_dir` for
/// the handshake socket, `spawner_path` for the helper).
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    spawner_path: Option<PathBuf>,
}

impl Command {
    /// Creates a new command for the given program.
    ///
    /// The program may be an absolute path, a relative path, or a bare name
    /// resolved through `$PATH` at spawn time.
    #[must_use]
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            temp_dir: None,
            spawner_path: None,
        }
    }

    /// Adds an argument.
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Sets an environment variable for the child.
    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    /// Sets multiple environment variables for the child.
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, val) in vars {
            self.env
                .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        }
        self
    }

    /// Sets the working directory for the child. Must exist at spawn time.
    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Directory for the handshake socket. Defaults to [`std::env::temp_dir`].
    pub fn temp_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.temp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Explicit path to the `leash-spawner` helper, bypassing discovery.
    pub fn spawner_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.spawner_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Spawns the child and completes the fd hand-off.
    ///
    /// Validation happens before anything touches the filesystem: the program
    /// is resolved to an absolute executable, the working directory (if any)
    /// must exist, and no argument may contain a NUL byte. Only then is the
    /// handshake socket created, so a failed validation leaves no trace.
    ///
    /// # Errors
    ///
    /// [`Error::CommandNotFound`], [`Error::CwdNotFound`], [`Error::NulByte`]
    /// on validation; [`Error::Handshake`] if the helper cannot be found,
    /// does not connect in time, or sends a malformed rights message.
    pub fn spawn(&mut self) -> Result<Child, Error> {
        // NUL checks come first: a NUL-bearing program can never resolve, and
        // letting it reach resolution would misreport it as "not found".
        check_nul(&self.program)?;
        for arg in &self.args {
            check_nul(arg)?;
        }
        for (key, val) in &self.env {
            check_nul(key)?;
            check_nul(val)?;
        }
        let program = resolve_program(&self.program)?;
        if let Some(cwd) = &self.cwd {
            if !cwd.is_dir() {
                return Err(Error::CwdNotFound(cwd.clone()));
            }
        }
        let spawner = match &self.spawner_path {
            Some(path) => path.clone(),
            None => locate_spawner()?,
        };
        let temp_dir = self
            .temp_dir
            .clone()
            .unwrap_or_else(env::temp_dir);

        let reactor = Arc::new(Reactor::new()?);
        let launch = SpawnerLaunch {
            spawner: &spawner,
            program: &program,
            args: &self.args,
            cwd: self.cwd.as_deref(),
            env: &self.env,
        };
        let pipes = handshake::run(&launch, &temp_dir, &reactor)?;
        let pid = pipes.pid;

        let watch = Arc::new(WatchState::new(pid, pipes.socket_path.clone()));
        let mailbox = Arc::new(Mailbox::new(reactor.clone()));
        watcher::spawn_reaper(watch.clone(), mailbox.clone())?;
        let guard = watcher::register(watch.clone())?;

        // From here on the watcher guard guarantees cleanup: if anything
        // below fails, dropping it signals, reaps and unlinks.
        let controller = Controller::new(reactor, mailbox.clone(), pipes, watch)?;
        std::thread::Builder::new()
            .name(format!("leash-ctl-{pid}"))
            .spawn(move || controller.run(guard))?;

        info!(program = %program.display(), pid, "child started");
        Ok(Child { mailbox })
    }
}

/// Handle to a supervised child process.
///
/// All methods take `&self`; the handle may be shared between threads. When
/// the handle is dropped the controller is released and the watcher ensures
/// the OS process is terminated and reaped.
pub struct Child {
    mailbox: Arc<Mailbox>,
}

impl Child {
    /// Writes all of `data` to the child's stdin.
    ///
    /// Blocks until the kernel pipe has accepted every byte; this is where
    /// back-pressure from a slow child reaches the caller.
    ///
    /// # Errors
    ///
    /// [`Error::PendingWrite`] if another write is in flight,
    /// [`Error::StdinClosed`] after [`Child::close_stdin`],
    /// [`Error::Exited`] after termination, or [`Error::Os`] with the raw
    /// errno of a failed write.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let data = data.as_ref().to_vec();
        self.call(|reply| Request::Write { data, reply })?
    }

    /// Reads exactly `size` bytes from the child's stdout.
    ///
    /// Blocks until `size` bytes have been gathered
    /// ([`ReadResult::Complete`]) or the child closes its stdout first
    /// ([`ReadResult::Eof`] with whatever arrived).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidReadSize`] for `size == 0`, [`Error::PendingRead`] if
    /// another read is in flight, [`Error::Exited`] after termination, or
    /// [`Error::Os`].
    pub fn read(&self, size: usize) -> Result<ReadResult, Error> {
        if size == 0 {
            return Err(Error::InvalidReadSize);
        }
        self.call(|reply| Request::Read {
            size: ReadSize::Exact(size),
            reply,
        })?
    }

    /// Reads whatever the next successful read yields, up to 64 KiB.
    ///
    /// Returns as soon as any bytes are available rather than waiting for a
    /// fixed count; an immediate end-of-file is `ReadResult::Eof` with an
    /// empty buffer.
    ///
    /// # Errors
    ///
    /// As for [`Child::read`], minus the size validation.
    pub fn read_unbuffered(&self) -> Result<ReadResult, Error> {
        self.call(|reply| Request::Read {
            size: ReadSize::Unbuffered,
            reply,
        })?
    }

    /// Closes the child's stdin, delivering EOF once the pipe drains.
    ///
    /// Idempotent, and reports `Ok` on an already-exited child. A write still
    /// in flight is failed with [`Error::StdinClosed`].
    ///
    /// # Errors
    ///
    /// [`Error::Os`] if the close itself fails.
    pub fn close_stdin(&self) -> Result<(), Error> {
        self.call(|reply| Request::CloseStdin { reply })?
    }

    /// Delivers `signal` to the child's process group.
    ///
    /// # Errors
    ///
    /// [`Error::ProcessNotAlive`] if no OS process is known any more.
    pub fn kill(&self, signal: SignalKind) -> Result<(), Error> {
        self.call(|reply| Request::Kill { signal, reply })?
    }

    /// Waits for the child to exit and returns the captured status.
    ///
    /// With `timeout: None` this blocks until termination. Any number of
    /// threads may wait concurrently; all of them receive the status when the
    /// child exits, and a completed child answers immediately.
    ///
    /// # Errors
    ///
    /// [`Error::WaitTimeout`] if the deadline fires first; the waiter is
    /// dropped and other waiters are unaffected.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<ExitStatus, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.call(|reply| Request::Wait { deadline, reply })?
    }

    /// Returns the child's OS pid, or `None` once it is no longer known
    /// (after exit or stop).
    pub fn os_pid(&self) -> Option<u32> {
        self.call(|reply| Request::OsPid { reply }).unwrap_or(None)
    }

    /// Releases the controller. The watcher then terminates the OS process
    /// if needed, reaps it, and removes the handshake socket.
    ///
    /// Callers still blocked in `read`/`write`/`wait` observe
    /// [`Error::ControllerGone`]. Dropping the handle does the same.
    pub fn stop(&self) {
        let _ = self.mailbox.push(Msg::Request(Request::Stop));
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, Error> {
        let (reply, response) = mpsc::channel();
        self.mailbox
            .push(Msg::Request(build(reply)))
            .map_err(|_| Error::ControllerGone)?;
        response.recv().map_err(|_| Error::ControllerGone)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("os_pid", &self.os_pid())
            .finish_non_exhaustive()
    }
}

/// Outcome of a read: the full requested count, or what was left at EOF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// The requested bytes (for an unbuffered read: one read's worth).
    Complete(Vec<u8>),
    /// End-of-file reached first; carries the bytes gathered so far.
    Eof(Vec<u8>),
}

impl ReadResult {
    /// The carried bytes, whichever way the read ended.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Complete(bytes) | Self::Eof(bytes) => bytes,
        }
    }

    /// Consumes the result, returning the carried bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Complete(bytes) | Self::Eof(bytes) => bytes,
        }
    }

    /// True if the child's stdout reached end-of-file.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof(_))
    }
}

/// Exit status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub(crate) const fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub(crate) const fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub(crate) const fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Returns `true` if the child exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns the exit code, or `None` if the child died by signal.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Returns the terminating signal, or `None` on a normal exit.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = self.code {
            write!(f, "exit code: {code}")
        } else if let Some(signal) = self.signal {
            write!(f, "signal: {signal}")
        } else {
            write!(f, "unknown exit status")
        }
    }
}

/// Resolves a program name to an absolute executable path.
fn resolve_program(program: &OsStr) -> Result<PathBuf, Error> {
    let not_found = || Error::CommandNotFound(program.to_string_lossy().into_owned());
    if program.is_empty() {
        return Err(not_found());
    }

    let path = Path::new(program);
    if program.as_bytes().contains(&b'/') {
        if !is_executable(path) {
            return Err(not_found());
        }
        return if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(env::current_dir()?.join(path))
        };
    }

    let search = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search) {
        let candidate = dir.join(path);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(not_found())
}

/// Finds the `leash-spawner` helper: `LEASH_SPAWNER`, then next to the
/// current executable (and one level up, for test harness layouts), then
/// `$PATH`.
fn locate_spawner() -> Result<PathBuf, HandshakeError> {
    if let Some(path) = env::var_os(SPAWNER_ENV) {
        return Ok(PathBuf::from(path));
    }
    if let Ok(exe) = env::current_exe() {
        let mut dirs = Vec::new();
        if let Some(parent) = exe.parent() {
            dirs.push(parent);
            if let Some(grandparent) = parent.parent() {
                dirs.push(grandparent);
            }
        }
        for dir in dirs {
            let candidate = dir.join(SPAWNER_BIN);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    let search = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search) {
        let candidate = dir.join(SPAWNER_BIN);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(HandshakeError::SpawnerNotFound)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn check_nul(value: &OsStr) -> Result<(), Error> {
    if value.as_bytes().contains(&0) {
        return Err(Error::NulByte);
    }
    Ok(())
}
