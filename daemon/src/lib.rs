//! The `brood-helper` process
//!
//! An engine using the helper strategy launches this binary with the path of
//! a private Unix socket. The helper connects back, says hello and from then
//! on creates and signals processes on the engine's behalf, reporting every
//! exit on the main channel. It exits when the engine closes the connection.

#![allow(unused_crate_dependencies)]

pub mod children;
pub mod reaper;
pub mod server;
pub mod simple_error;

#[cfg(test)]
mod simple_error_tests;

pub use children::ChildTable;
pub use server::run;
pub use simple_error::{HelperError, Result};

/// Environment variable holding the helper's log filter
pub const LOG_ENV: &str = "BROOD_HELPER_LOG";

/// Install a stderr subscriber filtered by [`LOG_ENV`], `warn` by default
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Only fails if a subscriber is already installed
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
