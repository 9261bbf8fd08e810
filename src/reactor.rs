//! Readiness notifications for the controller's pipe fds.
//!
//! A thin wrapper over [`polling::Poller`]. Registrations are oneshot: after
//! an event is delivered the interest is cleared and must be re-armed with
//! [`Reactor::arm`]. Readiness is level-triggered, so re-arming while the
//! condition still holds delivers the event again on the next wait — this is
//! what lets the controller make exactly one I/O attempt per notification.
//!
//! [`Reactor::notify`] wakes a blocked (or the next) [`Reactor::wait`] from
//! another thread; the mailbox uses it to interrupt the controller whenever a
//! request is queued.

use polling::{Event as PollEvent, Poller};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Opaque token identifying a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(pub usize);

impl Token {
    /// Returns the token as a usize key.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Interest flags indicating what readiness to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest(u8);

impl Interest {
    /// No interest; the fd stays registered but silent.
    pub const NONE: Interest = Self(0b00);
    /// Interest in readable events.
    pub const READABLE: Interest = Self(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Self(0b10);

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

/// A readiness event delivered by [`Reactor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Event {
    /// Token of the fd that became ready.
    pub token: Token,
    /// The fd is readable (or hung up).
    pub readable: bool,
    /// The fd is writable.
    pub writable: bool,
}

/// Readiness poller shared between the handshake and the controller loop.
pub(crate) struct Reactor {
    poller: Poller,
}

impl Reactor {
    /// Creates a new reactor.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
        })
    }

    /// Registers an fd with no interest. The fd must be non-blocking and must
    /// stay open until [`Reactor::delete`].
    pub fn add(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poller
            .add(fd, Self::interest_to_poll_event(token, Interest::NONE))
    }

    /// Arms (or re-arms) interest on a registered fd.
    pub fn arm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poller.modify(fd, Self::interest_to_poll_event(token, interest))
    }

    /// Removes an fd from the poller. Call before closing the fd.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.poller.delete(fd)
    }

    /// Blocks until readiness, a notification, or the timeout. Events are
    /// appended to `events` (cleared first); returns how many arrived.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let mut poll_events: Vec<PollEvent> = Vec::with_capacity(4);
        self.poller.wait(&mut poll_events, timeout)?;
        for ev in &poll_events {
            events.push(Event {
                token: Token(ev.key),
                readable: ev.readable,
                writable: ev.writable,
            });
        }
        Ok(events.len())
    }

    /// Wakes the current (or next) `wait` from another thread.
    pub fn notify(&self) -> io::Result<()> {
        self.poller.notify()
    }

    fn interest_to_poll_event(token: Token, interest: Interest) -> PollEvent {
        let key = token.index();
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}
