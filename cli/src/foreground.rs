//! Terminal foreground handoff for attached children
//!
//! An attached child runs in its own process group so that kill reaches its
//! whole tree. For it to read the terminal and receive Ctrl+C, that group
//! must be the terminal's foreground group while it runs.

use nix::sys::signal::{killpg, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{tcgetpgrp, tcsetpgrp, Pid};
use std::io::IsTerminal;
use tracing::{debug, warn};

/// Makes a process group the foreground group of our terminal until dropped
#[derive(Debug)]
pub struct ForegroundGuard {
    previous: Pid,
}

/// `tcsetpgrp` on stdin with `SIGTTOU` blocked, so it also works once we
/// are in the background
fn set_foreground(pgid: Pid) -> nix::Result<()> {
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGTTOU);
    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut old))?;
    let result = tcsetpgrp(std::io::stdin(), pgid);
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None)?;
    result
}

impl ForegroundGuard {
    /// Hand the terminal to `pgid`. `None` when stdin is not a terminal or
    /// the handoff failed.
    pub fn acquire(pgid: i32) -> Option<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return None;
        }
        let previous = tcgetpgrp(stdin).ok()?;
        let pgid = Pid::from_raw(pgid);
        if let Err(e) = set_foreground(pgid) {
            warn!("Could not hand terminal to process group {}: {}", pgid, e);
            return None;
        }
        // The child may have touched the terminal while still in the
        // background and been stopped
        let _ = killpg(pgid, Signal::SIGCONT);
        debug!("Process group {} is now in the foreground", pgid);
        Some(Self { previous })
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        if let Err(e) = set_foreground(self.previous) {
            warn!("Could not take back the terminal: {}", e);
        }
    }
}
