//! Signals deliverable to a supervised child.
//!
//! This is the closed set [`crate::Child::kill`] accepts: graceful
//! termination and forced kill. Delivery targets the child's process group so
//! the signal reaches both the spawner helper and the target command.

/// Signal kinds deliverable to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// SIGTERM — ask the child to terminate.
    Terminate,
    /// SIGKILL — kill the child unconditionally.
    Kill,
}

impl SignalKind {
    /// Creates a `SignalKind` for SIGTERM.
    #[must_use]
    pub const fn terminate() -> Self {
        Self::Terminate
    }

    /// Creates a `SignalKind` for SIGKILL.
    #[must_use]
    pub const fn kill() -> Self {
        Self::Kill
    }

    /// Returns the platform signal number.
    #[must_use]
    pub const fn as_raw_value(&self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    pub(crate) fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            Self::Terminate => nix::sys::signal::Signal::SIGTERM,
            Self::Kill => nix::sys::signal::Signal::SIGKILL,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}
