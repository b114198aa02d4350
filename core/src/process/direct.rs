//! Direct strategy: fork/exec in this process
//!
//! Each child is placed in its own process group so that `kill` reaches the
//! whole tree. An isolated child additionally gets a fresh session whose
//! controlling terminal is a pty owned by us:
//!
//! - interrupt writes `^C` (0x03) to the pty master; the line discipline
//!   turns it into `SIGINT` for the child's foreground group
//! - termination closes the pty, which hangs up the session (`SIGHUP`)
//!
//! On WSL1 closing the pty does not hang up the session, so termination
//! there also kills the group.
//!
//! Exit is observed through a pidfd; see [`ProcessState::try_reap`].

// pidfd_open and adopting descriptors require raw syscalls
#![allow(unsafe_code)]

use super::exec::{fork_exec, ChildSetup, PreparedCommand, SessionMode};
use super::platform::is_wsl1;
use super::{ProcessState, SpawnPlan};
use crate::handles::{InheritableFdStore, SPAWN_LOCK};
use crate::wait::{ExitSource, WaitPrimitive};
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::signal::{killpg, Signal as NixSignal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use schema::Signal;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Byte the line discipline maps to `SIGINT` (VINTR)
const INTERRUPT_BYTE: u8 = 0x03;

/// First backoff delay for `EAGAIN` retries; doubled per attempt
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// Creates children with fork/exec
#[derive(Debug, Clone)]
pub struct DirectSpawner {
    retry_attempts: u32,
}

#[derive(Debug)]
struct Pty {
    master: File,
    slave: OwnedFd,
}

/// A directly spawned child
#[derive(Debug)]
pub struct DirectProcess {
    state: Arc<ProcessState>,
    pgid: Pid,
    pty: Mutex<Option<Pty>>,
    kill_on_drop: bool,
}

impl DirectSpawner {
    /// Spawner retrying transient `EAGAIN` up to `retry_attempts` times in
    /// total
    pub fn new(retry_attempts: u32) -> Self {
        Self {
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Create a child with `stdio` as its standard streams
    pub async fn spawn(&self, plan: &SpawnPlan, stdio: [BorrowedFd<'_>; 3]) -> Result<DirectProcess> {
        let command = PreparedCommand::new(
            &plan.file_name,
            plan.argv.iter().cloned(),
            plan.env.iter().cloned(),
            plan.working_directory.as_deref(),
        )
        .map_err(|e| CoreError::spawn_errno(e, "invalid command string"))?;

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.spawn_once(plan, &command, stdio) {
                Err(CoreError::ProcessSpawn { errno, .. })
                    if errno == Errno::EAGAIN as i32 && attempt < self.retry_attempts =>
                {
                    warn!(
                        "fork failed with EAGAIN (attempt {}/{}), retrying in {:?}",
                        attempt, self.retry_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn spawn_once(
        &self,
        plan: &SpawnPlan,
        command: &PreparedCommand,
        stdio: [BorrowedFd<'_>; 3],
    ) -> Result<DirectProcess> {
        let pty = if plan.isolate {
            let pair = openpty(None, None)
                .map_err(|e| CoreError::spawn_errno(e, "openpty"))?;
            for fd in [&pair.master, &pair.slave] {
                fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                    .map_err(|e| CoreError::spawn_errno(e, "fcntl on pty"))?;
            }
            Some(Pty {
                master: File::from(pair.master),
                slave: pair.slave,
            })
        } else {
            None
        };

        let pid = {
            let _guard = SPAWN_LOCK.lock().unwrap_or_else(|p| p.into_inner());
            let mut store = InheritableFdStore::new();
            let mut aliases = [0 as RawFd; 3];
            for (alias, fd) in aliases.iter_mut().zip(stdio) {
                *alias = store.add(fd)?;
            }
            let session = match &pty {
                Some(pty) => SessionMode::NewSessionWithTty(pty.slave.as_raw_fd()),
                None => SessionMode::NewProcessGroup,
            };
            let setup = ChildSetup {
                stdio: aliases,
                session,
                close_after_dup: store.owned_aliases(),
            };
            fork_exec(command, &setup).map_err(|e| {
                CoreError::spawn_errno(e, format!("failed to start {:?}", command.program()))
            })?
        };

        let pidfd = match pidfd_open(pid) {
            Ok(fd) => fd,
            Err(e) => {
                // Without a wait primitive the child cannot be tracked
                let _ = killpg(pid, NixSignal::SIGKILL);
                let _ = waitpid(pid, None);
                return Err(CoreError::spawn_errno(e, "pidfd_open"));
            }
        };

        debug!(
            "Spawned pid {} ({})",
            pid,
            if plan.isolate { "isolated on pty" } else { "attached" }
        );
        Ok(DirectProcess {
            state: ProcessState::direct(pid.as_raw(), pidfd, plan.isolate),
            pgid: pid,
            pty: Mutex::new(pty),
            kill_on_drop: plan.kill_on_drop,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn pidfd_open(pid: Pid) -> std::result::Result<OwnedFd, Errno> {
    // SAFETY: plain syscall with integer arguments
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: pidfd_open returned a new descriptor (close-on-exec) we own
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn pidfd_open(_pid: Pid) -> std::result::Result<OwnedFd, Errno> {
    Err(Errno::ENOSYS)
}

impl DirectProcess {
    /// Shared process state
    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Process group id (equals the pid)
    pub fn pgid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Raw pidfd, for handle export
    pub fn raw_pidfd(&self) -> Option<RawFd> {
        match self.state.primitive() {
            WaitPrimitive::PidFd(fd) => Some(fd.as_raw_fd()),
            WaitPrimitive::Event(_) => None,
        }
    }

    /// Deliver `signal`
    pub fn signal(&self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Kill => self.kill_group(),
            Signal::Interrupt => {
                self.ensure_signalable(signal)?;
                let mut pty = self.pty.lock().unwrap_or_else(|p| p.into_inner());
                let pty = pty.as_mut().ok_or_else(|| {
                    CoreError::InvalidState("terminal already closed by termination".to_string())
                })?;
                pty.master.write_all(&[INTERRUPT_BYTE]).map_err(|e| {
                    CoreError::ProcessSignal(format!("writing interrupt to pty: {e}"))
                })?;
                debug!("Sent interrupt to pid {}", self.pgid);
                Ok(())
            }
            Signal::Termination => {
                self.ensure_signalable(signal)?;
                let closed = self
                    .pty
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take();
                drop(closed);
                debug!("Closed pty of pid {}", self.pgid);
                if is_wsl1() {
                    self.kill_group()?;
                }
                Ok(())
            }
        }
    }

    fn ensure_signalable(&self, signal: Signal) -> Result<()> {
        if !self.state.can_signal() {
            return Err(CoreError::InvalidState(format!(
                "{signal:?} requires a process that is not attached to the current console"
            )));
        }
        if !self.state.accepts_signals() || self.state.try_reap()? {
            return Err(CoreError::InvalidState(format!(
                "{signal:?} requires a running process"
            )));
        }
        Ok(())
    }

    /// Kill the process group.
    ///
    /// Until the lead is reaped, or while any member is alive, the group
    /// number cannot be reused. A group found empty at reap time is never
    /// signalled again. A group that empties after the reap can still have
    /// its number reused before this call.
    fn kill_group(&self) -> Result<()> {
        if self.state.is_group_gone() {
            debug!("Process group {} already empty", self.pgid);
            return Ok(());
        }
        match killpg(self.pgid, NixSignal::SIGKILL) {
            Ok(()) => {
                debug!("Sent SIGKILL to process group {}", self.pgid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("Process group {} already exited", self.pgid);
                Ok(())
            }
            Err(Errno::EPERM) => {
                debug!(
                    "Permission denied signaling process group {} (likely already exited)",
                    self.pgid
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to send SIGKILL to process group {}: {}", self.pgid, e);
                Err(CoreError::ProcessSignal(format!(
                    "Failed to send SIGKILL to process group {}: {}",
                    self.pgid, e
                )))
            }
        }
    }
}

impl Drop for DirectProcess {
    fn drop(&mut self) {
        if self.kill_on_drop {
            let _ = self.kill_group();
        }
        if matches!(self.state.try_reap(), Ok(false)) {
            // Reap in the background so the child does not linger as a zombie
            let pid = self.pgid;
            let spawned = std::thread::Builder::new()
                .name("brood-reaper".to_string())
                .spawn(move || {
                    let _ = waitpid(pid, None);
                });
            if let Err(e) = spawned {
                warn!("Failed to start reaper for pid {}: {}", pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::time::Instant;

    fn plan(argv: &[&str]) -> SpawnPlan {
        SpawnPlan {
            file_name: argv[0].as_bytes().to_vec(),
            argv: argv.iter().map(|a| a.as_bytes().to_vec()).collect(),
            env: Vec::new(),
            working_directory: None,
            isolate: false,
            kill_on_drop: true,
        }
    }

    /// Members of `pgid` that are neither exited nor zombies
    fn live_members(pgid: Pid) -> usize {
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| std::fs::read_to_string(entry.ok()?.path().join("stat")).ok())
            .filter(|stat| {
                let Some((_, rest)) = stat.rsplit_once(')') else {
                    return false;
                };
                let fields: Vec<&str> = rest.split_whitespace().collect();
                fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.as_raw().to_string()
            })
            .count()
    }

    async fn reap(process: &DirectProcess) {
        let start = Instant::now();
        while !process.state().try_reap().unwrap() {
            assert!(start.elapsed() < Duration::from_secs(10), "child did not exit");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_empty_group_not_signalled_after_reap() {
        let null = File::options().read(true).write(true).open("/dev/null").unwrap();
        let fd = null.as_fd();
        let process = DirectSpawner::new(1)
            .spawn(&plan(&["/bin/true"]), [fd, fd, fd])
            .await
            .unwrap();
        reap(&process).await;
        assert!(process.state().is_group_gone());
        process.signal(Signal::Kill).unwrap();
    }

    #[tokio::test]
    async fn test_group_with_survivors_still_killed_after_reap() {
        let null = File::options().read(true).write(true).open("/dev/null").unwrap();
        let fd = null.as_fd();
        let process = DirectSpawner::new(1)
            .spawn(&plan(&["/bin/sh", "-c", "/bin/sleep 30 & exit 0"]), [fd, fd, fd])
            .await
            .unwrap();
        reap(&process).await;
        assert_eq!(process.state().exit_code().unwrap(), 0);
        assert!(!process.state().is_group_gone());

        process.signal(Signal::Kill).unwrap();
        let start = Instant::now();
        while live_members(process.pgid) > 0 {
            assert!(start.elapsed() < Duration::from_secs(10), "group still alive");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
