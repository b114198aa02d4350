//! Descriptor passing over Unix stream sockets (SCM_RIGHTS)

// Wrapping descriptors received from the kernel requires from_raw_fd
#![allow(unsafe_code)]

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Upper bound on descriptors accepted in one message
pub const MAX_FDS_PER_MESSAGE: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Bytes and descriptors received by one [`recv_with_fds`] call
#[derive(Debug)]
pub struct Received {
    /// Number of bytes written to the buffer; 0 means end of stream
    pub len: usize,
    /// Descriptors that arrived with those bytes
    pub fds: Vec<OwnedFd>,
}

/// Send `bytes` with `fds` attached in a single `sendmsg`.
///
/// Returns the number of bytes sent. Descriptors are only guaranteed to be
/// delivered atomically with a bounded first send, so callers keep `bytes`
/// small (a header).
pub fn send_with_fds(socket: BorrowedFd<'_>, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )
    .map_err(io::Error::from)
}

/// Receive into `buf`, collecting any attached descriptors.
///
/// Descriptors are returned close-on-exec. A message carrying more than
/// [`MAX_FDS_PER_MESSAGE`] descriptors fails with `InvalidData`.
pub fn recv_with_fds(socket: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Received> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        recv_flags(),
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // SAFETY: the kernel just installed `fd` in our table for us
                // and nothing else references it.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    let len = msg.bytes;
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        // The kernel closed whatever did not fit; `fds` is dropped here too
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "control data truncated: more than {MAX_FDS_PER_MESSAGE} descriptors attached"
            ),
        ));
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds {
        nix::fcntl::fcntl(
            fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
        )
        .map_err(io::Error::from)?;
    }

    Ok(Received { len, fds })
}

/// Receive exactly `buf.len()` bytes, collecting descriptors from every
/// underlying `recvmsg`.
///
/// Returns `UnexpectedEof` if the peer closes before the buffer is full.
pub fn recv_exact_with_fds(socket: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Vec<OwnedFd>> {
    let mut filled = 0;
    let mut fds = Vec::new();
    while filled < buf.len() {
        match recv_with_fds(socket, &mut buf[filled..]) {
            Ok(Received { len: 0, .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the socket mid-message",
                ));
            }
            Ok(received) => {
                filled += received.len;
                fds.extend(received.fds);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(fds)
}
