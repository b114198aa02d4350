//! Caller-facing process object

use crate::engine::Engine;
use crate::process::direct::DirectProcess;
use crate::process::helper::DelegatedProcess;
use crate::process::{Lifecycle, ProcessState};
use crate::stdio::{ChildStderr, ChildStdin, ChildStdout, LocalPipes};
use crate::{CoreError, Result};
use schema::Signal;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Strategy-specific half of a [`ChildProcess`]
#[derive(Debug)]
pub enum NativeProcess {
    /// Spawned in this process
    Direct(DirectProcess),
    /// Spawned by the helper
    Delegated(DelegatedProcess),
}

impl NativeProcess {
    fn state(&self) -> &Arc<ProcessState> {
        match self {
            NativeProcess::Direct(p) => p.state(),
            NativeProcess::Delegated(p) => p.state(),
        }
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        match self {
            NativeProcess::Direct(p) => p.signal(signal),
            NativeProcess::Delegated(p) => p.signal(signal).await,
        }
    }
}

/// OS handles of a child, available with `ENABLE_HANDLE_EXPORT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHandles {
    /// Process id
    pub pid: i32,
    /// Process group id; equals the pid for every child we create
    pub pgid: i32,
    /// pidfd, only for directly spawned children. Owned by the
    /// [`ChildProcess`]; valid until it is dropped.
    pub pidfd: Option<RawFd>,
}

/// A running or exited child process
///
/// Dropping it tree-kills the child unless `DISABLE_KILL_ON_DISPOSE` was
/// given.
#[derive(Debug)]
pub struct ChildProcess {
    native: NativeProcess,
    engine: Engine,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    handle_export: bool,
}

impl ChildProcess {
    pub(crate) fn new(
        native: NativeProcess,
        engine: Engine,
        pipes: LocalPipes,
        handle_export: bool,
    ) -> Self {
        Self {
            native,
            engine,
            stdin: pipes.stdin,
            stdout: pipes.stdout,
            stderr: pipes.stderr,
            handle_export,
        }
    }

    /// Process id
    pub fn pid(&self) -> i32 {
        // A ChildProcess only exists after a successful spawn
        self.native.state().pid().unwrap_or(-1)
    }

    /// Writer for a piped stdin; `None` if not piped or already taken
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Reader for a piped stdout; `None` if not piped or already taken
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Reader for a piped stderr; `None` if not piped or already taken
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Whether the child has exited, without blocking
    pub fn has_exited(&self) -> Result<bool> {
        let state = self.native.state();
        if state.lifecycle() == Lifecycle::Exited {
            return Ok(true);
        }
        match self.native {
            NativeProcess::Direct(_) => state.try_reap(),
            // Fails with the crash
            NativeProcess::Delegated(_) if state.is_helper_lost() => {
                state.exit_code().map(|_| true)
            }
            NativeProcess::Delegated(_) => Ok(false),
        }
    }

    /// Exit code; an error until the child has exited.
    ///
    /// A child killed by a signal reports `128 + signal`.
    pub fn exit_code(&self) -> Result<i32> {
        self.has_exited()?;
        self.native.state().exit_code()
    }

    /// Block the calling thread until the child exits or `timeout` elapses.
    /// Returns whether the child exited.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        self.engine
            .scheduler()
            .wait_blocking(self.native.state().as_ref(), timeout)
    }

    /// Wait for the child to exit, for at most `timeout`.
    ///
    /// Returns `Ok(true)` on exit, `Ok(false)` on timeout and
    /// [`CoreError::Canceled`] when `cancel` fires first.
    pub async fn wait_for_exit_async(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.engine
            .scheduler()
            .wait_async(self.native.state().as_ref(), timeout, cancel)
            .await
    }

    /// Wait for the child to exit and return its exit code
    pub async fn wait(&self) -> Result<i32> {
        let never = CancellationToken::new();
        self.wait_for_exit_async(None, &never).await?;
        self.native.state().exit_code()
    }

    /// Whether interrupt and termination can be delivered to this child
    pub fn can_signal(&self) -> bool {
        self.native.state().can_signal()
    }

    /// Interrupt the child (Ctrl+C)
    pub async fn signal_interrupt(&self) -> Result<()> {
        self.native.signal(Signal::Interrupt).await
    }

    /// Ask the child to terminate (hang up its terminal)
    pub async fn signal_termination(&self) -> Result<()> {
        self.native.signal(Signal::Termination).await
    }

    /// Forcibly kill the child and its descendants. Killing an exited
    /// child is not an error.
    pub async fn kill(&self) -> Result<()> {
        debug!("Killing process tree of pid {}", self.pid());
        self.native.signal(Signal::Kill).await
    }

    /// Raw OS handles
    pub fn raw_handles(&self) -> Result<RawHandles> {
        if !self.handle_export {
            return Err(CoreError::InvalidState(
                "handle export was not enabled for this process".to_string(),
            ));
        }
        let pid = self.pid();
        Ok(match &self.native {
            NativeProcess::Direct(p) => RawHandles {
                pid,
                pgid: p.pgid(),
                pidfd: p.raw_pidfd(),
            },
            NativeProcess::Delegated(_) => RawHandles {
                pid,
                pgid: pid,
                pidfd: None,
            },
        })
    }
}
