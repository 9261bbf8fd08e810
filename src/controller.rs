//! The per-child controller: a single-threaded cooperative state machine.
//!
//! Exactly one controller thread exists per child and it serialises every
//! operation on that child. Work arrives through a mailbox as [`Msg`]s:
//! caller requests (each carrying its own reply channel) and the child-exit
//! event from the reaper. Readiness notifications for the two pipe fds arrive
//! through the shared [`Reactor`]; the mailbox wakes the same poller, so the
//! loop has a single suspension point.
//!
//! All pipe I/O is non-blocking and makes exactly one attempt per readiness
//! notification: a partial write keeps the unwritten tail in the pending slot
//! and re-arms; a short read appends to the accumulator and re-arms; `EAGAIN`
//! only re-arms and is never surfaced. At most one read and one write are in
//! flight at any instant — a second request is rejected synchronously, never
//! queued.
//!
//! The state is held in this struct and its dispatch table, not in stack
//! frames of blocked callers: a caller timing out or disappearing never
//! unwinds controller state.

use crate::error::Error;
use crate::handshake::Pipes;
use crate::process::{ExitStatus, ReadResult};
use crate::reactor::{Event, Interest, Reactor, Token};
use crate::signal::SignalKind;
use crate::watcher::{WatchState, WatcherGuard};
use nix::errno::Errno;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Poller token for the child's stdin write end.
const TOKEN_STDIN: Token = Token(1);
/// Poller token for the child's stdout read end.
const TOKEN_STDOUT: Token = Token(2);

/// Largest single read attempt: one default pipe buffer. Also the upper
/// bound on what an unbuffered read can return.
const READ_CHUNK: usize = 64 * 1024;

/// Reply channel for one request; the caller blocks on the receiving end.
pub(crate) type Reply<T> = Sender<T>;

/// Requested read size: an exact byte count or the unbuffered sentinel.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadSize {
    /// Block until exactly this many bytes have been gathered (or EOF).
    Exact(usize),
    /// Return whatever the first successful read yields.
    Unbuffered,
}

/// A caller request, serialised through the mailbox.
pub(crate) enum Request {
    Write {
        data: Vec<u8>,
        reply: Reply<Result<(), Error>>,
    },
    Read {
        size: ReadSize,
        reply: Reply<Result<ReadResult, Error>>,
    },
    CloseStdin {
        reply: Reply<Result<(), Error>>,
    },
    Kill {
        signal: SignalKind,
        reply: Reply<Result<(), Error>>,
    },
    Wait {
        deadline: Option<Instant>,
        reply: Reply<Result<ExitStatus, Error>>,
    },
    OsPid {
        reply: Reply<Option<u32>>,
    },
    Stop,
}

/// Everything the controller loop consumes.
pub(crate) enum Msg {
    Request(Request),
    /// Pushed by the reaper once the OS reports termination.
    Exited(ExitStatus),
}

/// Serialised mailbox feeding the controller loop.
///
/// Pushing wakes the controller's poller. Once closed, pushes fail and the
/// remaining messages are dropped — dropping a request disconnects its reply
/// channel, which blocked callers observe as [`Error::ControllerGone`].
pub(crate) struct Mailbox {
    queue: Mutex<Option<VecDeque<Msg>>>,
    reactor: Arc<Reactor>,
}

impl Mailbox {
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            queue: Mutex::new(Some(VecDeque::new())),
            reactor,
        }
    }

    /// Enqueues a message; `Err` returns it if the controller is gone.
    pub fn push(&self, msg: Msg) -> Result<(), Msg> {
        {
            let mut queue = self.queue.lock();
            match queue.as_mut() {
                Some(queue) => queue.push_back(msg),
                None => return Err(msg),
            }
        }
        if let Err(err) = self.reactor.notify() {
            warn!(error = %err, "mailbox notify failed");
        }
        Ok(())
    }

    pub fn pop(&self) -> Option<Msg> {
        self.queue.lock().as_mut()?.pop_front()
    }

    /// Closes the mailbox and drops whatever was still queued.
    fn close(&self) {
        self.queue.lock().take();
    }
}

/// Lifecycle of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// Controller created, fds not yet installed.
    Init,
    /// Handshake complete, child running.
    Running,
    /// Child reaped; absorbing.
    Exited(ExitStatus),
}

struct PendingRead {
    size: ReadSize,
    acc: Vec<u8>,
    reply: Reply<Result<ReadResult, Error>>,
}

struct PendingWrite {
    data: Vec<u8>,
    written: usize,
    reply: Reply<Result<(), Error>>,
}

struct ExitWaiter {
    deadline: Option<Instant>,
    reply: Reply<Result<ExitStatus, Error>>,
}

pub(crate) struct Controller {
    reactor: Arc<Reactor>,
    mailbox: Arc<Mailbox>,
    watch: Arc<WatchState>,
    /// Write end of the child's stdin; `None` once closed.
    stdin: Option<File>,
    /// Read end of the child's stdout; `None` once closed.
    stdout: Option<File>,
    status: Status,
    pending_read: Option<PendingRead>,
    pending_write: Option<PendingWrite>,
    exit_waiters: Vec<ExitWaiter>,
    read_buf: Box<[u8]>,
    /// Last errno seen on the pipes, kept for diagnostics.
    last_errno: Option<Errno>,
}

impl Controller {
    /// Installs the handshake fds and registers them with the poller.
    pub fn new(
        reactor: Arc<Reactor>,
        mailbox: Arc<Mailbox>,
        pipes: Pipes,
        watch: Arc<WatchState>,
    ) -> io::Result<Self> {
        let mut controller = Self {
            reactor,
            mailbox,
            watch,
            stdin: Some(File::from(pipes.stdin)),
            stdout: Some(File::from(pipes.stdout)),
            status: Status::Init,
            pending_read: None,
            pending_write: None,
            exit_waiters: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            last_errno: None,
        };
        if let Some(stdin) = controller.stdin.as_ref() {
            controller.reactor.add(stdin.as_raw_fd(), TOKEN_STDIN)?;
        }
        if let Some(stdout) = controller.stdout.as_ref() {
            controller.reactor.add(stdout.as_raw_fd(), TOKEN_STDOUT)?;
        }
        controller.status = Status::Running;
        debug!(pid = pipes.pid, "controller running");
        Ok(controller)
    }

    /// The event loop. Consumes the controller; dropping `guard` at the end
    /// (or on panic) releases the watcher.
    pub fn run(mut self, guard: WatcherGuard) {
        let mut events: Vec<Event> = Vec::new();
        loop {
            let timeout = self.poll_timeout();
            match self.reactor.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "reactor wait failed, releasing controller");
                    break;
                }
            }

            for event in &events {
                match event.token {
                    TOKEN_STDIN if event.writable => self.drive_write(),
                    TOKEN_STDOUT if event.readable => self.drive_read(),
                    _ => {}
                }
            }

            let mut stop = false;
            while let Some(msg) = self.mailbox.pop() {
                if self.handle(msg) {
                    stop = true;
                    break;
                }
            }
            self.expire_waiters();
            if stop {
                break;
            }
        }
        self.teardown();
        drop(guard);
    }

    /// Returns true when the loop should stop.
    fn handle(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Exited(status) => {
                self.on_exit(status);
                false
            }
            Msg::Request(Request::Write { data, reply }) => {
                self.on_write(data, reply);
                false
            }
            Msg::Request(Request::Read { size, reply }) => {
                self.on_read(size, reply);
                false
            }
            Msg::Request(Request::CloseStdin { reply }) => {
                self.on_close_stdin(reply);
                false
            }
            Msg::Request(Request::Kill { signal, reply }) => {
                self.on_kill(signal, reply);
                false
            }
            Msg::Request(Request::Wait { deadline, reply }) => {
                self.on_wait(deadline, reply);
                false
            }
            Msg::Request(Request::OsPid { reply }) => {
                let pid = match self.status {
                    Status::Running => Some(self.watch.pid),
                    _ => None,
                };
                let _ = reply.send(pid);
                false
            }
            Msg::Request(Request::Stop) => {
                debug!("stop requested");
                true
            }
        }
    }

    fn on_write(&mut self, data: Vec<u8>, reply: Reply<Result<(), Error>>) {
        if let Status::Exited(status) = self.status {
            let _ = reply.send(Err(Error::Exited(status)));
            return;
        }
        if self.pending_write.is_some() {
            let _ = reply.send(Err(Error::PendingWrite));
            return;
        }
        if self.stdin.is_none() {
            let _ = reply.send(Err(Error::StdinClosed));
            return;
        }
        self.pending_write = Some(PendingWrite {
            data,
            written: 0,
            reply,
        });
        self.drive_write();
    }

    fn on_read(&mut self, size: ReadSize, reply: Reply<Result<ReadResult, Error>>) {
        if let Status::Exited(status) = self.status {
            let _ = reply.send(Err(Error::Exited(status)));
            return;
        }
        if self.pending_read.is_some() {
            let _ = reply.send(Err(Error::PendingRead));
            return;
        }
        self.pending_read = Some(PendingRead {
            size,
            acc: Vec::new(),
            reply,
        });
        self.drive_read();
    }

    fn on_close_stdin(&mut self, reply: Reply<Result<(), Error>>) {
        if matches!(self.status, Status::Exited(_)) {
            // Fds are already closed on a terminal status.
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.reply.send(Err(Error::StdinClosed));
        }
        let result = self.close_stdin_fd();
        let _ = reply.send(result);
    }

    fn on_kill(&mut self, signal: SignalKind, reply: Reply<Result<(), Error>>) {
        let result = match self.status {
            Status::Running => {
                let group = Pid::from_raw(self.watch.pid as i32);
                match killpg(group, signal.as_nix()) {
                    Ok(()) => {
                        debug!(%signal, pid = self.watch.pid, "signal delivered");
                        Ok(())
                    }
                    Err(Errno::ESRCH) => Err(Error::ProcessNotAlive),
                    Err(errno) => {
                        self.last_errno = Some(errno);
                        Err(Error::Os(errno))
                    }
                }
            }
            _ => Err(Error::ProcessNotAlive),
        };
        let _ = reply.send(result);
    }

    fn on_wait(&mut self, deadline: Option<Instant>, reply: Reply<Result<ExitStatus, Error>>) {
        if let Status::Exited(status) = self.status {
            let _ = reply.send(Ok(status));
            return;
        }
        self.exit_waiters.push(ExitWaiter { deadline, reply });
    }

    fn on_exit(&mut self, status: ExitStatus) {
        debug!(%status, "child exited");
        self.status = Status::Exited(status);
        for waiter in self.exit_waiters.drain(..) {
            let _ = waiter.reply.send(Ok(status));
        }
        // The write side of the stdout pipe is gone, so a pending read can be
        // driven to its EOF (or completion) without ever blocking.
        self.drain_pending_read();
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.reply.send(Err(Error::Exited(status)));
        }
        self.close_fds();
    }

    /// One non-blocking write attempt for the pending slot.
    fn drive_write(&mut self) {
        let Some(mut pending) = self.pending_write.take() else {
            return;
        };
        let Some(stdin) = self.stdin.as_ref() else {
            self.pending_write = Some(pending);
            return;
        };
        match (&*stdin).write(&pending.data[pending.written..]) {
            Ok(n) => {
                pending.written += n;
                trace!(n, remaining = pending.data.len() - pending.written, "wrote");
                if pending.written >= pending.data.len() {
                    let _ = pending.reply.send(Ok(()));
                } else {
                    self.pending_write = Some(pending);
                    self.rearm_stdin_or_fail();
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.pending_write = Some(pending);
                self.rearm_stdin_or_fail();
            }
            Err(err) => {
                self.record_errno(&err);
                let _ = pending.reply.send(Err(Error::os(&err)));
            }
        }
    }

    /// One non-blocking read attempt for the pending slot.
    fn drive_read(&mut self) {
        let Some(mut pending) = self.pending_read.take() else {
            return;
        };
        let Some(stdout) = self.stdout.as_ref() else {
            self.pending_read = Some(pending);
            return;
        };
        let want = match pending.size {
            ReadSize::Exact(n) => (n - pending.acc.len()).min(self.read_buf.len()),
            ReadSize::Unbuffered => self.read_buf.len(),
        };
        match (&*stdout).read(&mut self.read_buf[..want]) {
            Ok(0) => {
                let eof = ReadResult::Eof(std::mem::take(&mut pending.acc));
                let _ = pending.reply.send(Ok(eof));
            }
            Ok(k) => match pending.size {
                ReadSize::Unbuffered => {
                    let chunk = ReadResult::Complete(self.read_buf[..k].to_vec());
                    let _ = pending.reply.send(Ok(chunk));
                }
                ReadSize::Exact(n) => {
                    pending.acc.extend_from_slice(&self.read_buf[..k]);
                    trace!(k, gathered = pending.acc.len(), want = n, "read");
                    if pending.acc.len() >= n {
                        let full = ReadResult::Complete(std::mem::take(&mut pending.acc));
                        let _ = pending.reply.send(Ok(full));
                    } else {
                        self.pending_read = Some(pending);
                        self.rearm_stdout_or_fail();
                    }
                }
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.pending_read = Some(pending);
                self.rearm_stdout_or_fail();
            }
            Err(err) => {
                self.record_errno(&err);
                let _ = pending.reply.send(Err(Error::os(&err)));
            }
        }
    }

    /// Drives a pending read to its natural end at child exit.
    fn drain_pending_read(&mut self) {
        let Some(mut pending) = self.pending_read.take() else {
            return;
        };
        let result = loop {
            let Some(stdout) = self.stdout.as_ref() else {
                break ReadResult::Eof(std::mem::take(&mut pending.acc));
            };
            let want = match pending.size {
                ReadSize::Exact(n) => (n - pending.acc.len()).min(self.read_buf.len()),
                ReadSize::Unbuffered => self.read_buf.len(),
            };
            match (&*stdout).read(&mut self.read_buf[..want]) {
                Ok(0) => break ReadResult::Eof(std::mem::take(&mut pending.acc)),
                Ok(k) => match pending.size {
                    ReadSize::Unbuffered => {
                        break ReadResult::Complete(self.read_buf[..k].to_vec())
                    }
                    ReadSize::Exact(n) => {
                        pending.acc.extend_from_slice(&self.read_buf[..k]);
                        if pending.acc.len() >= n {
                            break ReadResult::Complete(std::mem::take(&mut pending.acc));
                        }
                    }
                },
                // A straggler holding the write end (a grandchild that
                // inherited the pipe) could still produce data, but the slot
                // must resolve once the child itself is gone.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    break ReadResult::Eof(std::mem::take(&mut pending.acc))
                }
                Err(err) => {
                    self.record_errno(&err);
                    let _ = pending.reply.send(Err(Error::os(&err)));
                    return;
                }
            }
        };
        let _ = pending.reply.send(Ok(result));
    }

    fn fail_pending_write(&mut self, err: &io::Error) {
        self.record_errno(err);
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.reply.send(Err(Error::os(err)));
        }
    }

    fn fail_pending_read(&mut self, err: &io::Error) {
        self.record_errno(err);
        if let Some(pending) = self.pending_read.take() {
            let _ = pending.reply.send(Err(Error::os(err)));
        }
    }

    /// Re-arms stdin writability; an arm failure fails the pending writer.
    fn rearm_stdin_or_fail(&mut self) {
        if let Err(err) = self.arm_stdin() {
            self.fail_pending_write(&err);
        }
    }

    /// Re-arms stdout readability; an arm failure fails the pending reader.
    fn rearm_stdout_or_fail(&mut self) {
        if let Err(err) = self.arm_stdout() {
            self.fail_pending_read(&err);
        }
    }

    fn record_errno(&mut self, err: &io::Error) {
        self.last_errno = err.raw_os_error().map(Errno::from_raw);
        trace!(errno = ?self.last_errno, "pipe error recorded");
    }

    /// Closes the stdin write end exactly once, reporting the close errno.
    fn close_stdin_fd(&mut self) -> Result<(), Error> {
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        let _ = self.reactor.delete(stdin.as_raw_fd());
        nix::unistd::close(stdin.into_raw_fd()).map_err(|errno| {
            self.last_errno = Some(errno);
            Error::Os(errno)
        })
    }

    fn close_fds(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            let _ = self.reactor.delete(stdin.as_raw_fd());
            if let Err(errno) = nix::unistd::close(stdin.into_raw_fd()) {
                warn!(%errno, "closing stdin fd failed");
            }
        }
        if let Some(stdout) = self.stdout.take() {
            let _ = self.reactor.delete(stdout.as_raw_fd());
            if let Err(errno) = nix::unistd::close(stdout.into_raw_fd()) {
                warn!(%errno, "closing stdout fd failed");
            }
        }
    }

    fn arm_stdin(&self) -> io::Result<()> {
        match self.stdin.as_ref() {
            Some(stdin) => self
                .reactor
                .arm(stdin.as_raw_fd(), TOKEN_STDIN, Interest::WRITABLE),
            None => Ok(()),
        }
    }

    fn arm_stdout(&self) -> io::Result<()> {
        match self.stdout.as_ref() {
            Some(stdout) => self
                .reactor
                .arm(stdout.as_raw_fd(), TOKEN_STDOUT, Interest::READABLE),
            None => Ok(()),
        }
    }

    fn expire_waiters(&mut self) {
        if self.exit_waiters.is_empty() {
            return;
        }
        let now = Instant::now();
        self.exit_waiters.retain(|waiter| match waiter.deadline {
            Some(deadline) if deadline <= now => {
                let _ = waiter.reply.send(Err(Error::WaitTimeout));
                false
            }
            _ => true,
        });
    }

    /// Poll timeout: the nearest exit-waiter deadline, if any.
    fn poll_timeout(&self) -> Option<Duration> {
        let deadline = self
            .exit_waiters
            .iter()
            .filter_map(|waiter| waiter.deadline)
            .min()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    fn teardown(&mut self) {
        // No new messages; queued ones are dropped, which disconnects their
        // reply channels.
        self.mailbox.close();
        self.pending_read = None;
        self.pending_write = None;
        self.exit_waiters.clear();
        self.close_fds();
        debug!(pid = self.watch.pid, "controller released");
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pid", &self.watch.pid)
            .field("status", &self.status)
            .field("pending_read", &self.pending_read.is_some())
            .field("pending_write", &self.pending_write.is_some())
            .field("exit_waiters", &self.exit_waiters.len())
            .field("last_errno", &self.last_errno)
            .finish()
    }
}
