//! Children created by this helper, keyed by pid and by token

use brood_core::process::exec::{fork_exec, ChildSetup, PreparedCommand};
use nix::errno::Errno;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct Children {
    /// Children not yet reaped
    by_pid: HashMap<i32, u64>,
    /// Process group of every unreleased token
    by_token: HashMap<u64, i32>,
}

/// Children created by this helper
///
/// The lock is held across fork and insertion, so the reaper never sees a
/// pid it cannot resolve to a token.
///
/// A token keeps its process group after the lead process is reaped, so
/// descendants it left behind can still be signalled. The group is dropped
/// when the engine releases the token, or at reap time if it is already
/// empty. A group that empties later keeps its entry until released, and
/// its number can be reused in that window.
#[derive(Debug, Default)]
pub struct ChildTable {
    inner: Mutex<Children>,
    changed: Condvar,
}

impl ChildTable {
    fn lock(&self) -> MutexGuard<'_, Children> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fork and exec a child for `token` and record it
    pub fn spawn(
        &self,
        token: u64,
        command: &PreparedCommand,
        setup: &ChildSetup,
    ) -> Result<i32, Errno> {
        let mut children = self.lock();
        let pid = fork_exec(command, setup)?.as_raw();
        if let Some(previous) = children.by_token.insert(token, pid) {
            warn!("Token {} reused (was pid {}, now pid {})", token, previous, pid);
            children.by_pid.remove(&previous);
        }
        children.by_pid.insert(pid, token);
        self.changed.notify_all();
        debug!("Token {} spawned as pid {}", token, pid);
        Ok(pid)
    }

    /// Process group created for `token`, if it may still have members
    pub fn pid_of(&self, token: u64) -> Option<i32> {
        self.lock().by_token.get(&token).copied()
    }

    /// Record that a child was reaped; returns its token if it was ours
    pub fn take_exited(&self, pid: i32) -> Option<u64> {
        let mut children = self.lock();
        let token = children.by_pid.remove(&pid)?;
        if children.by_token.get(&token) == Some(&pid)
            && matches!(killpg(Pid::from_raw(pid), None), Err(Errno::ESRCH))
        {
            trace!("Process group {} empty at reap", pid);
            children.by_token.remove(&token);
        }
        Some(token)
    }

    /// Forget `token`; returns the group it still referred to
    ///
    /// A released child that is still running is reaped as usual.
    pub fn release(&self, token: u64) -> Option<i32> {
        self.lock().by_token.remove(&token)
    }

    /// Number of children not yet reaped
    pub fn len(&self) -> usize {
        self.lock().by_pid.len()
    }

    /// Whether every child has been reaped
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least one child is outstanding
    pub fn wait_for_children(&self) {
        let mut children = self.lock();
        while children.by_pid.is_empty() {
            children = self
                .changed
                .wait(children)
                .unwrap_or_else(|p| p.into_inner());
        }
    }
}
