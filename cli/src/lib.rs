//! The `brood` command-line runner
//!
//! Resolves a program on `PATH`, runs it through the brood engine with the
//! requested redirections and exits with its exit code.

#![allow(unused_crate_dependencies)]

pub mod args;
pub mod error;
pub mod foreground;
pub mod runner;

pub use error::{CliError, Result};
