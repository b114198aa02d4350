//! Process state shared between the caller and the exit observers
//!
//! A [`ProcessState`] is the live record of one spawned child:
//!
//! ```text
//! Spawning ──► Running ──► Exited
//!     │
//!     └──────► SpawnFailed
//! ```
//!
//! Directly spawned children start in `Running` (the pid is known when the
//! state is created) and record their exit by reaping with `waitpid` once
//! their pidfd becomes readable. Helper-spawned children start in
//! `Spawning`; the pid arrives with the spawn acknowledgement and the exit
//! code with the helper's notification. Either may arrive first. If the
//! helper dies first, the state is marked helper-lost: its event is set so
//! waiters wake, and every wait or exit code query fails with
//! [`CoreError::HelperCrashed`].
//!
//! The state is always held in an `Arc`: one reference belongs to the
//! caller's process object, another to the exit observer (the helper
//! correlation table).

pub mod direct;
pub mod exec;
pub mod helper;
pub mod platform;

use crate::wait::{ExitEvent, ExitSource, WaitPrimitive};
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::killpg;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, error, warn};

/// Everything a strategy needs to create one child, already validated and
/// encoded
#[derive(Debug, Clone)]
pub struct SpawnPlan {
    /// Executable path
    pub file_name: Vec<u8>,
    /// Full argument vector including `argv[0]`
    pub argv: Vec<Vec<u8>>,
    /// `name=value` entries
    pub env: Vec<Vec<u8>>,
    /// Working directory, `None` to inherit
    pub working_directory: Option<Vec<u8>>,
    /// Isolate the child so it can receive interrupt and termination
    pub isolate: bool,
    /// Tree-kill the child when its process object is dropped
    pub kill_on_drop: bool,
}

/// Lifecycle of a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Creation requested, no pid yet
    Spawning,
    /// Pid known, not exited
    Running,
    /// Exit code recorded
    Exited,
    /// Creation failed; never handed to a caller
    SpawnFailed,
}

#[derive(Debug)]
struct Slot {
    lifecycle: Lifecycle,
    exit_code: Option<i32>,
    helper_lost: bool,
    group_gone: bool,
}

impl Slot {
    fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            exit_code: None,
            helper_lost: false,
            group_gone: false,
        }
    }
}

/// Live record of one spawned child
#[derive(Debug)]
pub struct ProcessState {
    token: Option<u64>,
    pid: OnceLock<i32>,
    slot: Mutex<Slot>,
    primitive: WaitPrimitive,
    can_signal: bool,
}

/// Exit code as reported to callers: the code itself, or `128 + signal`
pub fn exit_code_from_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

impl ProcessState {
    /// State for a directly spawned child
    pub fn direct(pid: i32, pidfd: OwnedFd, can_signal: bool) -> Arc<Self> {
        Arc::new(Self {
            token: None,
            pid: OnceLock::from(pid),
            slot: Mutex::new(Slot::new(Lifecycle::Running)),
            primitive: WaitPrimitive::PidFd(pidfd),
            can_signal,
        })
    }

    /// State for a helper-spawned child, before the helper acknowledged it
    pub fn delegated(token: u64, can_signal: bool) -> Arc<Self> {
        Arc::new(Self {
            token: Some(token),
            pid: OnceLock::new(),
            slot: Mutex::new(Slot::new(Lifecycle::Spawning)),
            primitive: WaitPrimitive::Event(Arc::new(ExitEvent::new())),
            can_signal,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Correlation token (helper-spawned children only)
    pub fn token(&self) -> Option<u64> {
        self.token
    }

    /// Process id, once known
    pub fn pid(&self) -> Option<i32> {
        self.pid.get().copied()
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.slot().lifecycle
    }

    /// Whether interrupt and termination may be delivered
    pub fn can_signal(&self) -> bool {
        self.can_signal
    }

    /// Whether interrupt/termination are valid right now
    pub fn accepts_signals(&self) -> bool {
        let slot = self.slot();
        self.can_signal && slot.lifecycle == Lifecycle::Running && !slot.helper_lost
    }

    /// Whether the helper died before reporting this child's exit
    pub fn is_helper_lost(&self) -> bool {
        let slot = self.slot();
        slot.helper_lost && slot.lifecycle != Lifecycle::Exited
    }

    /// Whether the process group was already empty when the child was
    /// reaped. Its number may belong to someone else from then on.
    pub fn is_group_gone(&self) -> bool {
        self.slot().group_gone
    }

    /// Exit code; an error until the process has exited
    pub fn exit_code(&self) -> Result<i32> {
        let slot = self.slot();
        match (slot.lifecycle, slot.exit_code) {
            (Lifecycle::Exited, Some(code)) => Ok(code),
            _ if slot.helper_lost => Err(self.helper_lost_error()),
            (lifecycle, _) => Err(CoreError::InvalidState(format!(
                "exit code requested while process is {lifecycle:?}"
            ))),
        }
    }

    /// Record the pid from the spawn acknowledgement. Only the first call
    /// has an effect.
    pub fn set_process_id(&self, pid: i32) {
        if self.pid.set(pid).is_err() {
            debug_assert!(false, "process id set twice");
            error!("Process id set twice (kept {:?}, got {})", self.pid(), pid);
            return;
        }
        let mut slot = self.slot();
        if slot.lifecycle == Lifecycle::Spawning {
            slot.lifecycle = Lifecycle::Running;
        }
    }

    /// Record the exit code reported by the exit observer.
    ///
    /// Must be called at most once; a second call is a logic error and is
    /// ignored.
    pub fn set_exited(&self, exit_code: i32) {
        {
            let mut slot = self.slot();
            if slot.lifecycle == Lifecycle::Exited {
                debug_assert!(false, "exit recorded twice");
                error!(
                    "Exit recorded twice for token {:?} (kept {:?}, got {})",
                    self.token, slot.exit_code, exit_code
                );
                return;
            }
            slot.lifecycle = Lifecycle::Exited;
            slot.exit_code = Some(exit_code);
        }
        if let WaitPrimitive::Event(event) = &self.primitive {
            event.set();
        }
    }

    /// Record that the helper died before reporting the exit, and wake
    /// every waiter. Has no effect once the exit is recorded.
    pub fn set_helper_lost(&self) {
        {
            let mut slot = self.slot();
            if slot.lifecycle == Lifecycle::Exited {
                return;
            }
            slot.helper_lost = true;
        }
        if let WaitPrimitive::Event(event) = &self.primitive {
            event.set();
        }
    }

    fn helper_lost_error(&self) -> CoreError {
        CoreError::HelperCrashed(format!(
            "helper exited before reporting the exit of process {:?}",
            self.pid()
        ))
    }

    /// Mark a creation attempt as failed
    pub fn set_spawn_failed(&self) {
        let mut slot = self.slot();
        if slot.lifecycle == Lifecycle::Spawning {
            slot.lifecycle = Lifecycle::SpawnFailed;
        }
    }

    /// Reap a directly spawned child without blocking and record its exit
    /// code. Returns whether the child has exited.
    ///
    /// The slot lock is held across `waitpid` so that concurrent waiters
    /// reap exactly once.
    pub fn try_reap(&self) -> Result<bool> {
        let mut slot = self.slot();
        if slot.lifecycle == Lifecycle::Exited {
            return Ok(true);
        }
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        let code = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(false),
            Ok(status) => match exit_code_from_status(status) {
                Some(code) => code,
                None => return Ok(false),
            },
            Err(Errno::EINTR) => return Ok(false),
            Err(Errno::ECHILD) => {
                warn!("Process {} was reaped elsewhere; exit code unknown", pid);
                -1
            }
            Err(e) => {
                return Err(CoreError::ProcessWait(format!(
                    "waitpid({pid}) failed: {e}"
                )))
            }
        };
        debug!("Process {} exited with code {}", pid, code);
        slot.lifecycle = Lifecycle::Exited;
        slot.exit_code = Some(code);
        // The pid stays reserved while any group member lives; once the
        // group is empty the number is free for reuse
        slot.group_gone = matches!(killpg(Pid::from_raw(pid), None), Err(Errno::ESRCH));
        Ok(true)
    }
}

impl ExitSource for ProcessState {
    fn has_exited(&self) -> bool {
        self.lifecycle() == Lifecycle::Exited
    }

    fn primitive(&self) -> &WaitPrimitive {
        &self.primitive
    }

    fn observe_exit(&self) -> Result<()> {
        match self.primitive {
            WaitPrimitive::PidFd(_) => {
                // Readable pidfd means the child is a zombie; waitpid will
                // not block
                if !self.try_reap()? {
                    warn!("pidfd signaled but process {:?} not reapable yet", self.pid());
                }
                Ok(())
            }
            WaitPrimitive::Event(_) if self.is_helper_lost() => Err(self.helper_lost_error()),
            WaitPrimitive::Event(_) => Ok(()),
        }
    }
}
