//! Schema definitions for brood
//!
//! This crate contains the caller-facing data structures used across the
//! brood workspace: process creation options, redirection modes, creation
//! flags and signals. All types here implement JSON Schema generation for
//! external consumption.

pub mod options;

#[cfg(test)]
mod json_roundtrip_tests;

pub use options::*;

use schemars::schema_for;

/// Pretty-printed JSON Schema of [`ProcessOptions`]
pub fn process_options_schema() -> String {
    let schema = schema_for!(ProcessOptions);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
