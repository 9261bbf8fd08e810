//! The rights message: fd hand-off over a Unix-domain socket.
//!
//! Implemented in terms of `nix::sys::socket::{sendmsg, recvmsg}` so the rest
//! of the crate does not need unsafe control-message plumbing.
//!
//! The handshake message has a fixed shape: a single `SCM_RIGHTS` control
//! message carrying exactly two file descriptors — the child's stdin write
//! end first, the stdout read end second — and an 8-byte data payload of two
//! native-endian `u32` positional markers (the sender's fd numbers). The
//! markers are informational; the real transfer happens through the control
//! message. Anything else is a fatal handshake error.

#![allow(unsafe_code)]

use crate::error::HandshakeError;
use crate::handshake::HANDSHAKE_TIMEOUT;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use smallvec::SmallVec;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Number of fds a handshake message carries: stdin-write, stdout-read.
pub(crate) const HANDSHAKE_FD_COUNT: usize = 2;

/// Payload bytes: one `u32` marker per fd.
pub(crate) const PAYLOAD_LEN: usize = HANDSHAKE_FD_COUNT * 4;

/// Sends the two pipe fds over `sock` as one rights message.
///
/// `fds[0]` must be the stdin write end, `fds[1]` the stdout read end.
pub(crate) fn send_fds(sock: RawFd, fds: &[RawFd; HANDSHAKE_FD_COUNT]) -> nix::Result<()> {
    let mut payload = [0u8; PAYLOAD_LEN];
    for (slot, fd) in payload.chunks_exact_mut(4).zip(fds) {
        slot.copy_from_slice(&(*fd as u32).to_ne_bytes());
    }
    let iov = [IoSlice::new(&payload)];
    let cmsg = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receives the rights message from `sock`.
///
/// Returns the received fds as `(stdin_write, stdout_read)`. The shape is
/// validated strictly: exactly two fds, an 8-byte payload, no control-message
/// truncation. Received fds that fail validation are closed before returning.
pub(crate) fn recv_fds(sock: RawFd) -> Result<(OwnedFd, OwnedFd), HandshakeError> {
    // One spare marker's worth of room so an over-long payload is visible as
    // `bytes != PAYLOAD_LEN` rather than silently clipped.
    let mut payload = [0u8; PAYLOAD_LEN + 4];
    let mut fds: SmallVec<[RawFd; HANDSHAKE_FD_COUNT]> = SmallVec::new();

    let (bytes, truncated, foreign_cmsg) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; HANDSHAKE_FD_COUNT]);

        let msg = recvmsg::<()>(
            sock,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|errno| match errno {
            Errno::EAGAIN => HandshakeError::RecvTimeout(HANDSHAKE_TIMEOUT),
            other => HandshakeError::Recv(other),
        })?;

        let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
        let bytes = msg.bytes;

        let cmsgs = msg.cmsgs().map_err(HandshakeError::Recv)?;
        let mut foreign_cmsg = false;
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::ScmRights(received) => fds.extend_from_slice(&received),
                _ => foreign_cmsg = true,
            }
        }
        (bytes, truncated, foreign_cmsg)
    };

    let shape_error = if truncated {
        Some("control message truncated")
    } else if foreign_cmsg {
        Some("unexpected control message type")
    } else if fds.len() != HANDSHAKE_FD_COUNT {
        Some("expected exactly two fds")
    } else if bytes != PAYLOAD_LEN {
        Some("payload must be two u32 markers")
    } else {
        None
    };

    if let Some(reason) = shape_error {
        for fd in fds {
            let _ = nix::unistd::close(fd);
        }
        return Err(HandshakeError::Malformed(reason));
    }

    let stdin_marker = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let stdout_marker = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    tracing::trace!(stdin_marker, stdout_marker, "rights message received");

    // SAFETY: the fds were just created for us by recvmsg (with CLOEXEC set);
    // nothing else in this process owns them.
    let stdin = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let stdout = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((stdin, stdout))
}
