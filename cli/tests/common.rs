//! Test utilities for CLI crate integration tests.
#![allow(unused_crate_dependencies)]
#![allow(missing_docs)]
#![allow(dead_code)]

use std::process::{Command, Output};
use std::time::Duration;

/// Run the given future with a timeout, failing the test if it elapses.
///
/// # Panics
///
/// Panics if the timeout elapses before the future completes.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// Run the `brood` binary with `args`, stdin closed
pub fn brood(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_brood"))
        .args(args)
        .stdin(std::process::Stdio::null())
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run brood")
}
