//! IPC between the engine and the `brood-helper` process
//!
//! This crate holds both halves of the helper protocol that are not process
//! creation itself:
//!
//! - [`wire`]: the binary frame codec shared by client and helper
//! - [`fdpass`]: descriptor passing over Unix sockets
//! - [`client`]: launching the helper and talking to it

pub mod client;
pub mod error;
pub mod fdpass;
pub mod wire;


pub use client::{ExitSink, HelperClient, HelperConfig};
pub use error::{IpcError, Result};
pub use wire::{ExitNotification, SpawnRequest};
