//! Reaps children and reports their exit on the main channel

use crate::children::ChildTable;
use crate::Result;
use brood_core::process::exit_code_from_status;
use ipc::ExitNotification;
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Reap children forever, writing one notification per exit to `out`.
///
/// Returns when writing fails, i.e. the client is gone.
pub fn run<W: Write>(table: Arc<ChildTable>, mut out: W) -> Result<()> {
    loop {
        table.wait_for_children();
        let status = match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                // Children recorded but none waitable yet; not expected
                warn!("waitpid reported no children with {} outstanding", table.len());
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let (Some(pid), Some(code)) = (status.pid(), exit_code_from_status(status)) else {
            trace!("Ignoring wait status {:?}", status);
            continue;
        };
        let pid = pid.as_raw();
        match table.take_exited(pid) {
            Some(token) => {
                debug!("Token {} (pid {}) exited with {}", token, pid, code);
                let notification = ExitNotification {
                    token,
                    pid,
                    status: code,
                };
                out.write_all(&notification.to_bytes())?;
                out.flush()?;
            }
            // A child whose exec failed; the spawner already reported it
            None => debug!("Reaped untracked pid {}", pid),
        }
    }
}
