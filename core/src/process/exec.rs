//! fork + execve with an explicit descriptor layout
//!
//! Shared by the direct strategy and by `brood-helper`. Everything the child
//! needs (C strings, pointer arrays) is built in the parent; between `fork`
//! and `execve` the child only makes raw, async-signal-safe libc calls.
//!
//! A failed `execve` (or `chdir`, `setsid`, ...) in the child is reported to
//! the parent as an errno through a close-on-exec pipe: the parent reads
//! zero bytes on success and four bytes on failure.

// fork and the raw libc calls in the child are inherently unsafe
#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

/// Session and process-group placement of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Stay in the caller's session and process group
    Inherit,
    /// New process group in the caller's session (`setpgid(0, 0)`)
    NewProcessGroup,
    /// New session without a controlling terminal (`setsid`)
    NewSession,
    /// New session with the given pty slave as controlling terminal
    NewSessionWithTty(RawFd),
}

/// Executable, arguments, environment and working directory as C strings
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

impl PreparedCommand {
    /// Convert raw byte strings.
    ///
    /// `argv` is the full vector including `argv[0]`. Fails with `EINVAL` on
    /// an interior NUL.
    pub fn new<A, E>(
        program: &[u8],
        argv: A,
        envp: E,
        cwd: Option<&[u8]>,
    ) -> Result<Self, Errno>
    where
        A: IntoIterator,
        A::Item: Into<Vec<u8>>,
        E: IntoIterator,
        E::Item: Into<Vec<u8>>,
    {
        let to_c = |bytes: Vec<u8>| CString::new(bytes).map_err(|_| Errno::EINVAL);
        Ok(Self {
            program: to_c(program.to_vec())?,
            argv: argv
                .into_iter()
                .map(|a| to_c(a.into()))
                .collect::<Result<_, _>>()?,
            envp: envp
                .into_iter()
                .map(|e| to_c(e.into()))
                .collect::<Result<_, _>>()?,
            cwd: cwd.map(|d| to_c(d.to_vec())).transpose()?,
        })
    }

    /// Program path
    pub fn program(&self) -> &CString {
        &self.program
    }
}

/// Descriptor layout and placement of the child
#[derive(Debug, Clone)]
pub struct ChildSetup {
    /// Descriptors that become the child's 0, 1 and 2
    pub stdio: [RawFd; 3],
    /// Session placement
    pub session: SessionMode,
    /// Descriptors to close in the child once stdio is in place
    pub close_after_dup: Vec<RawFd>,
}

/// Fork and exec `command` with `setup`.
///
/// Returns the child's pid once `execve` succeeded, or the errno of the
/// first failing step in the child (the failed child is reaped).
pub fn fork_exec(command: &PreparedCommand, setup: &ChildSetup) -> Result<Pid, Errno> {
    let argv_ptrs: Vec<*const libc::c_char> = command
        .argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = command
        .envp
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let cwd_ptr = command
        .cwd
        .as_ref()
        .map_or(std::ptr::null(), |c| c.as_ptr());
    let close_fds: &[RawFd] = &setup.close_after_dup;

    let (err_read, err_write) = error_pipe()?;
    let err_fd = err_write.as_raw_fd();

    // SAFETY: the child branch below only performs async-signal-safe libc
    // calls on data prepared before the fork, then execs or _exits
    match unsafe { fork() }? {
        ForkResult::Child => unsafe {
            child_after_fork(
                command.program.as_ptr(),
                argv_ptrs.as_ptr(),
                envp_ptrs.as_ptr(),
                cwd_ptr,
                setup.stdio,
                setup.session,
                close_fds,
                err_fd,
            )
        },
        ForkResult::Parent { child } => {
            drop(err_write);
            match read_child_errno(err_read) {
                None => {
                    debug!("Started {:?} as pid {}", command.program, child);
                    Ok(child)
                }
                Some(errno) => {
                    match waitpid(child, None) {
                        Ok(_) | Err(Errno::ECHILD) => {}
                        Err(e) => warn!("Failed to reap failed child {}: {}", child, e),
                    }
                    Err(errno)
                }
            }
        }
    }
}

/// Close-on-exec pipe whose ends are both above the stdio range, so the
/// child's dup2 calls cannot clobber them
fn error_pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((lift_above_stdio(r)?, lift_above_stdio(w)?))
}

fn lift_above_stdio(fd: OwnedFd) -> Result<OwnedFd, Errno> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    let dup = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // SAFETY: fresh descriptor from F_DUPFD_CLOEXEC
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn read_child_errno(pipe: OwnedFd) -> Option<Errno> {
    let mut file = std::fs::File::from(pipe);
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    match filled {
        0 => None,
        4 => Some(Errno::from_raw(i32::from_ne_bytes(buf))),
        _ => Some(Errno::EIO),
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn child_after_fork(
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    cwd: *const libc::c_char,
    stdio: [RawFd; 3],
    session: SessionMode,
    close_fds: &[RawFd],
    err_fd: RawFd,
) -> ! {
    match session {
        SessionMode::Inherit => {}
        SessionMode::NewProcessGroup => {
            if libc::setpgid(0, 0) == -1 {
                fail(err_fd);
            }
        }
        SessionMode::NewSession => {
            if libc::setsid() == -1 {
                fail(err_fd);
            }
        }
        SessionMode::NewSessionWithTty(slave) => {
            if libc::setsid() == -1 {
                fail(err_fd);
            }
            if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) == -1 {
                fail(err_fd);
            }
        }
    }

    // Move sources that sit on a stdio number elsewhere first, so that
    // dup2 onto 0..=2 cannot overwrite a source still needed
    let mut sources = stdio;
    for (target, source) in sources.iter_mut().enumerate() {
        if *source < 3 && *source != target as RawFd {
            let moved = libc::fcntl(*source, libc::F_DUPFD, 3);
            if moved == -1 {
                fail(err_fd);
            }
            *source = moved;
        }
    }
    for (target, source) in sources.iter().enumerate() {
        let target = target as RawFd;
        if *source == target {
            if libc::fcntl(target, libc::F_SETFD, 0) == -1 {
                fail(err_fd);
            }
        } else if libc::dup2(*source, target) == -1 {
            fail(err_fd);
        }
    }
    for fd in close_fds {
        if *fd > 2 {
            libc::close(*fd);
        }
    }
    for (target, source) in sources.iter().enumerate() {
        if *source != stdio[target] && *source > 2 {
            libc::close(*source);
        }
    }

    // Dispositions set to SIG_IGN survive execve; the runtime ignores SIGPIPE
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    if !cwd.is_null() && libc::chdir(cwd) == -1 {
        fail(err_fd);
    }

    libc::execve(program, argv, envp);
    fail(err_fd)
}

unsafe fn fail(err_fd: RawFd) -> ! {
    let errno = Errno::last_raw();
    let bytes = errno.to_ne_bytes();
    libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(127)
}
