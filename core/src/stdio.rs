//! Resolution of stdin/stdout/stderr redirections into descriptors
//!
//! [`resolve`] turns the three [`Redirection`] requests of a
//! [`ProcessOptions`](schema::ProcessOptions) into concrete descriptors for
//! the child plus, for pipes, the local ends kept by the parent. All three
//! requests are validated before anything is opened. Everything opened is
//! held in [`OwnedFd`]s, so an early return releases it.
//!
//! The local pipe ends stay inside [`ResolvedStdio`] until
//! [`ResolvedStdio::detach`] hands them to the process object, which only
//! happens once the child exists.

// Borrowing the caller's raw descriptors requires borrow_raw
#![allow(unsafe_code)]

use crate::handles::is_valid_fd;
use crate::{CoreError, Result};
use nix::fcntl::OFlag;
use schema::Redirection;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;
use tracing::debug;

/// Write end of the child's stdin pipe
pub type ChildStdin = tokio::net::unix::pipe::Sender;
/// Read end of the child's stdout pipe
pub type ChildStdout = tokio::net::unix::pipe::Receiver;
/// Read end of the child's stderr pipe
pub type ChildStderr = tokio::net::unix::pipe::Receiver;

const NULL_DEVICE: &str = "/dev/null";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn own_fd(self) -> RawFd {
        match self {
            Stream::Stdin => 0,
            Stream::Stdout => 1,
            Stream::Stderr => 2,
        }
    }
}

#[derive(Debug)]
enum Endpoint {
    /// A descriptor owned by someone else (our own stdio, or the caller's)
    Borrowed(RawFd),
    /// A descriptor opened for this spawn
    Owned(OwnedFd),
    /// stderr shares stdout's open file
    SameAsStdout,
}

/// Child-side descriptors and parent-side pipe ends for one spawn
#[derive(Debug)]
pub struct ResolvedStdio {
    endpoints: [Endpoint; 3],
    local_stdin: Option<OwnedFd>,
    local_stdout: Option<OwnedFd>,
    local_stderr: Option<OwnedFd>,
}

/// Parent-side pipe ends, ready for async I/O
#[derive(Debug, Default)]
pub struct LocalPipes {
    /// Writes to the child's stdin
    pub stdin: Option<ChildStdin>,
    /// Reads the child's stdout
    pub stdout: Option<ChildStdout>,
    /// Reads the child's stderr
    pub stderr: Option<ChildStderr>,
}

impl ResolvedStdio {
    /// Descriptors for the child's stdin, stdout and stderr
    pub fn child_fds(&self) -> [BorrowedFd<'_>; 3] {
        let stdout = self.endpoint_fd(&self.endpoints[1]);
        [
            self.endpoint_fd(&self.endpoints[0]),
            stdout,
            match &self.endpoints[2] {
                Endpoint::SameAsStdout => stdout,
                other => self.endpoint_fd(other),
            },
        ]
    }

    fn endpoint_fd<'a>(&'a self, endpoint: &'a Endpoint) -> BorrowedFd<'a> {
        match endpoint {
            // SAFETY: borrowed descriptors were checked to be open during
            // resolution and the caller keeps them open until the spawn
            // call returns, which outlives `self`'s use
            Endpoint::Borrowed(fd) => unsafe { BorrowedFd::borrow_raw(*fd) },
            Endpoint::Owned(fd) => fd.as_fd(),
            Endpoint::SameAsStdout => self.endpoint_fd(&self.endpoints[1]),
        }
    }

    /// Whether any stream is a pipe
    pub fn has_pipes(&self) -> bool {
        self.local_stdin.is_some() || self.local_stdout.is_some() || self.local_stderr.is_some()
    }

    /// Release the child-side descriptors and hand the local pipe ends over
    /// as async streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn detach(self) -> Result<LocalPipes> {
        let ResolvedStdio {
            endpoints,
            local_stdin,
            local_stdout,
            local_stderr,
        } = self;
        // Our copies of the child ends must go, or the child never sees EOF
        drop(endpoints);

        Ok(LocalPipes {
            stdin: local_stdin
                .map(|fd| ChildStdin::from_file(File::from(fd)))
                .transpose()?,
            stdout: local_stdout
                .map(|fd| ChildStdout::from_file(File::from(fd)))
                .transpose()?,
            stderr: local_stderr
                .map(|fd| ChildStderr::from_file(File::from(fd)))
                .transpose()?,
        })
    }
}

/// Validate the three requests without touching the OS
pub fn validate(stdin: &Redirection, stdout: &Redirection, stderr: &Redirection) -> Result<()> {
    for (stream, redirection) in [
        (Stream::Stdin, stdin),
        (Stream::Stdout, stdout),
        (Stream::Stderr, stderr),
    ] {
        match redirection {
            Redirection::File { path, .. } if path.as_os_str().is_empty() => {
                return Err(CoreError::ValidationError(format!(
                    "{}: file redirection requires a path",
                    stream.name()
                )));
            }
            Redirection::Fd { fd } if *fd < 0 => {
                return Err(CoreError::ValidationError(format!(
                    "{}: descriptor {} is negative",
                    stream.name(),
                    fd
                )));
            }
            _ => {}
        }
    }

    if let (
        Redirection::File {
            path: out_path,
            append: out_append,
        },
        Redirection::File {
            path: err_path,
            append: err_append,
        },
    ) = (stdout, stderr)
    {
        if out_path == err_path && out_append != err_append {
            return Err(CoreError::ValidationError(format!(
                "stdout and stderr redirect to the same file {:?} with different append modes",
                out_path
            )));
        }
    }
    Ok(())
}

/// Resolve the three redirections.
///
/// `create_new_console` is true when the child is isolated on its own
/// terminal or session; an inherited stream that is a terminal is then
/// replaced by the null device.
pub fn resolve(
    stdin: &Redirection,
    stdout: &Redirection,
    stderr: &Redirection,
    create_new_console: bool,
) -> Result<ResolvedStdio> {
    validate(stdin, stdout, stderr)?;

    let (stdin_ep, local_stdin) = open_endpoint(Stream::Stdin, stdin, create_new_console)?;
    let (stdout_ep, local_stdout) = open_endpoint(Stream::Stdout, stdout, create_new_console)?;
    let (stderr_ep, local_stderr) = if same_file(stdout, stderr) {
        debug!("stdout and stderr share one file");
        (Endpoint::SameAsStdout, None)
    } else {
        open_endpoint(Stream::Stderr, stderr, create_new_console)?
    };

    Ok(ResolvedStdio {
        endpoints: [stdin_ep, stdout_ep, stderr_ep],
        local_stdin,
        local_stdout,
        local_stderr,
    })
}

fn same_file(stdout: &Redirection, stderr: &Redirection) -> bool {
    matches!(
        (stdout, stderr),
        (Redirection::File { path: a, .. }, Redirection::File { path: b, .. }) if a == b
    )
}

fn open_endpoint(
    stream: Stream,
    redirection: &Redirection,
    create_new_console: bool,
) -> Result<(Endpoint, Option<OwnedFd>)> {
    match redirection {
        Redirection::Inherit => {
            let fd = stream.own_fd();
            if !is_valid_fd(fd) {
                debug!("{} is closed in this process, using null device", stream.name());
                return Ok((Endpoint::Owned(open_null(stream)?), None));
            }
            if create_new_console && nix::unistd::isatty(fd).unwrap_or(false) {
                debug!(
                    "{} is a terminal and the child is isolated, using null device",
                    stream.name()
                );
                return Ok((Endpoint::Owned(open_null(stream)?), None));
            }
            Ok((Endpoint::Borrowed(fd), None))
        }
        Redirection::Pipe => {
            let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
                .map_err(|e| CoreError::spawn_errno(e, format!("{}: pipe", stream.name())))?;
            Ok(match stream {
                Stream::Stdin => (Endpoint::Owned(read_end), Some(write_end)),
                Stream::Stdout | Stream::Stderr => (Endpoint::Owned(write_end), Some(read_end)),
            })
        }
        Redirection::File { path, append } => {
            let file = open_file(stream, path, *append)?;
            Ok((Endpoint::Owned(OwnedFd::from(file)), None))
        }
        Redirection::Fd { fd } => {
            if !is_valid_fd(*fd) {
                return Err(CoreError::ValidationError(format!(
                    "{}: descriptor {} is not open",
                    stream.name(),
                    fd
                )));
            }
            Ok((Endpoint::Borrowed(*fd), None))
        }
        Redirection::Null => Ok((Endpoint::Owned(open_null(stream)?), None)),
    }
}

fn open_file(stream: Stream, path: &Path, append: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    match stream {
        Stream::Stdin => {
            options.read(true);
        }
        Stream::Stdout | Stream::Stderr => {
            options.write(true).create(true);
            if append {
                options.append(true);
            } else {
                options.truncate(true);
            }
        }
    }
    options.open(path).map_err(|e| CoreError::ProcessSpawn {
        errno: e.raw_os_error().unwrap_or(0),
        message: format!("{}: failed to open {:?}: {}", stream.name(), path, e),
    })
}

fn open_null(stream: Stream) -> Result<OwnedFd> {
    let file = match stream {
        Stream::Stdin => OpenOptions::new().read(true).open(NULL_DEVICE),
        Stream::Stdout | Stream::Stderr => OpenOptions::new().write(true).open(NULL_DEVICE),
    }
    .map_err(|e| CoreError::ProcessSpawn {
        errno: e.raw_os_error().unwrap_or(0),
        message: format!("{}: failed to open {}: {}", stream.name(), NULL_DEVICE, e),
    })?;
    Ok(OwnedFd::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_file_without_path_rejected() {
        let err = validate(
            &Redirection::Inherit,
            &Redirection::file(""),
            &Redirection::Inherit,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(ref m) if m.starts_with("stdout")));
    }

    #[test]
    fn test_negative_fd_rejected() {
        let err = validate(
            &Redirection::Fd { fd: -1 },
            &Redirection::Inherit,
            &Redirection::Inherit,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(ref m) if m.starts_with("stdin")));
    }

    #[test]
    fn test_same_file_mixed_append_rejected_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let err = resolve(
            &Redirection::Null,
            &Redirection::file(&path),
            &Redirection::append(&path),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
        assert!(!path.exists(), "nothing may be created on validation failure");
    }

    #[test]
    fn test_same_file_shares_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both.log");
        let resolved = resolve(
            &Redirection::Null,
            &Redirection::append(&path),
            &Redirection::append(&path),
            false,
        )
        .unwrap();
        let fds = resolved.child_fds();
        assert_eq!(fds[1].as_raw_fd(), fds[2].as_raw_fd());
        assert!(path.exists());
    }

    #[test]
    fn test_truncate_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        std::fs::write(&path, "old contents\n").unwrap();

        let resolved = resolve(
            &Redirection::Null,
            &Redirection::append(&path),
            &Redirection::Null,
            false,
        )
        .unwrap();
        let mut f = File::from(resolved.child_fds()[1].try_clone_to_owned().unwrap());
        f.write_all(b"new\n").unwrap();
        drop(resolved);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old contents\nnew\n");

        let resolved = resolve(
            &Redirection::Null,
            &Redirection::file(&path),
            &Redirection::Null,
            false,
        )
        .unwrap();
        drop(resolved);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_missing_stdin_file_is_spawn_error() {
        let err = resolve(
            &Redirection::file("/nonexistent/brood/input"),
            &Redirection::Null,
            &Redirection::Null,
            false,
        )
        .unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_closed_fd_rejected() {
        let file = tempfile::tempfile().unwrap();
        let raw = file.as_raw_fd();
        drop(file);
        // Another test may have reused the number; only assert when it is free
        if !is_valid_fd(raw) {
            let err = resolve(
                &Redirection::Inherit,
                &Redirection::Fd { fd: raw },
                &Redirection::Inherit,
                false,
            )
            .unwrap_err();
            assert!(matches!(err, CoreError::ValidationError(_)));
        }
    }

    #[test]
    fn test_raw_fd_passed_verbatim() {
        let file = tempfile::tempfile().unwrap();
        let resolved = resolve(
            &Redirection::Inherit,
            &Redirection::Fd {
                fd: file.as_raw_fd(),
            },
            &Redirection::Inherit,
            false,
        )
        .unwrap();
        assert_eq!(resolved.child_fds()[1].as_raw_fd(), file.as_raw_fd());
        assert!(!resolved.has_pipes());
    }

    #[tokio::test]
    async fn test_each_pipe_is_separate() {
        use tokio::io::AsyncReadExt;

        let resolved = resolve(
            &Redirection::Pipe,
            &Redirection::Pipe,
            &Redirection::Pipe,
            false,
        )
        .unwrap();
        assert!(resolved.has_pipes());
        let [_, out, err] = resolved.child_fds();
        assert_ne!(out.as_raw_fd(), err.as_raw_fd());

        let mut out_writer = File::from(out.try_clone_to_owned().unwrap());
        let mut err_writer = File::from(err.try_clone_to_owned().unwrap());
        let pipes = resolved.detach().unwrap();

        out_writer.write_all(b"to stdout").unwrap();
        err_writer.write_all(b"to stderr").unwrap();
        drop(out_writer);
        drop(err_writer);

        let mut s = String::new();
        pipes.stdout.unwrap().read_to_string(&mut s).await.unwrap();
        assert_eq!(s, "to stdout");
        let mut s = String::new();
        pipes.stderr.unwrap().read_to_string(&mut s).await.unwrap();
        assert_eq!(s, "to stderr");
        assert!(pipes.stdin.is_some());
    }

    #[test]
    fn test_null_reads_empty() {
        let resolved = resolve(
            &Redirection::Null,
            &Redirection::Null,
            &Redirection::Null,
            false,
        )
        .unwrap();
        let mut f = File::from(resolved.child_fds()[0].try_clone_to_owned().unwrap());
        let mut buf = Vec::new();
        assert_eq!(f.read_to_end(&mut buf).unwrap(), 0);
    }
}
