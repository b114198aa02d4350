//! Runtime detection of host quirks

use std::sync::OnceLock;
use tracing::debug;

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Whether we run under the first generation Windows Subsystem for Linux.
///
/// WSL1 emulates the Linux syscall layer and differs in two ways that
/// matter here: closing a pty master does not hang up the session attached
/// to it, and descriptors passed over a Unix socket can be delivered again
/// by a later `recvmsg` on the same message. WSL2 runs a real kernel and
/// behaves like Linux.
pub fn is_wsl1() -> bool {
    static WSL1: OnceLock<bool> = OnceLock::new();
    *WSL1.get_or_init(|| {
        let release = std::fs::read_to_string(OSRELEASE_PATH).unwrap_or_default();
        let wsl1 = release_is_wsl1(&release);
        if wsl1 {
            debug!("Detected WSL1 kernel {:?}", release.trim());
        }
        wsl1
    })
}

/// WSL1 reports e.g. `4.4.0-19041-Microsoft`; WSL2 reports
/// `5.15.90.1-microsoft-standard-WSL2`
pub fn release_is_wsl1(release: &str) -> bool {
    release.contains("Microsoft")
}
