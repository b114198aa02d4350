//! brood-helper binary
//!
//! Usage: `brood-helper SOCKET_PATH`. Launched by the engine, not by users.

#![allow(unused_crate_dependencies)]

use daemon::HelperError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    daemon::init_logging();

    let result = match std::env::args_os().nth(1) {
        Some(path) => daemon::run(&PathBuf::from(path)),
        None => Err(HelperError::UsageError(
            "brood-helper SOCKET_PATH".to_string(),
        )),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ HelperError::UsageError(_)) => {
            error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("Helper failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
