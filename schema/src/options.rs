//! Process creation options
//!
//! This module contains the caller-facing description of a child process:
//! what to run, where, with which environment, and how its three standard
//! streams are wired.
//!
//! ## Redirection Modes
//!
//! Each standard stream takes one of:
//! - `Inherit`: Use this process's own stream
//! - `Pipe`: Create a pipe; the local end is handed back to the caller
//! - `File`: Open a file (truncate or append)
//! - `Fd`: Use a caller-owned descriptor verbatim
//! - `Null`: Connect to the null device
//!
//! Options are plain data. Validation of payloads (empty paths, negative
//! descriptors, conflicting modes for a shared file) happens in the engine
//! before any OS resource is acquired.

use bitflags::bitflags;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a single standard stream of the child is connected
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum Redirection {
    /// Inherit the corresponding stream of the current process
    #[default]
    Inherit,
    /// Create a pipe; the parent keeps the other end
    Pipe,
    /// Redirect to (or from, for stdin) a file
    File {
        /// Path of the file; must not be empty
        path: PathBuf,
        /// Append instead of truncating (ignored for stdin)
        #[serde(default)]
        append: bool,
    },
    /// Use a descriptor owned by the caller; it must stay open until the
    /// creation call returns
    Fd {
        /// Raw descriptor number; must not be negative
        fd: i32,
    },
    /// Connect to the null device
    Null,
}

impl Redirection {
    /// Shorthand for a truncating file redirection
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Redirection::File {
            path: path.into(),
            append: false,
        }
    }

    /// Shorthand for an appending file redirection
    pub fn append(path: impl Into<PathBuf>) -> Self {
        Redirection::File {
            path: path.into(),
            append: true,
        }
    }

    /// Short lowercase name of the mode, used in logs and error messages
    pub fn mode_name(&self) -> &'static str {
        match self {
            Redirection::Inherit => "inherit",
            Redirection::Pipe => "pipe",
            Redirection::File { append: false, .. } => "file",
            Redirection::File { append: true, .. } => "append",
            Redirection::Fd { .. } => "fd",
            Redirection::Null => "null",
        }
    }
}

bitflags! {
    /// Creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ProcessFlags: u32 {
        /// Keep the child attached to the current terminal and session.
        ///
        /// Without this flag the child is isolated on its own pseudo-terminal
        /// (or session) so that interrupt and termination signals can be
        /// delivered to it alone. With it, only `kill` is available.
        const ATTACH_TO_CURRENT_CONSOLE = 1 << 0;
        /// Expose the raw process descriptors (pidfd, process group) on the
        /// returned process object
        const ENABLE_HANDLE_EXPORT = 1 << 1;
        /// Do not tree-kill the child when the process object is dropped
        const DISABLE_KILL_ON_DISPOSE = 1 << 2;
        /// Start from an empty environment instead of the current one
        /// (ignored when an explicit base environment is given)
        const DISABLE_ENVIRONMENT_INHERITANCE = 1 << 3;
    }
}

/// Signal that can be delivered to a running child
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
#[repr(u32)]
pub enum Signal {
    /// Cooperative interrupt (Ctrl+C)
    Interrupt = 1,
    /// Cooperative termination request
    Termination = 2,
    /// Unconditional tree-kill
    Kill = 3,
}

impl Signal {
    /// Numeric value used on the wire
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a numeric wire value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Signal::Interrupt),
            2 => Some(Signal::Termination),
            3 => Some(Signal::Kill),
            _ => None,
        }
    }
}

/// A single environment patch entry.
///
/// `value == None` (or an empty string) removes the variable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// New value, or `None` to remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl EnvVar {
    /// Add or override a variable
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Remove a variable
    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// Complete description of a child process to create
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    /// Path of the executable. The engine never searches `PATH`; callers
    /// pass an already resolved path.
    pub file_name: PathBuf,

    /// Arguments, not including `argv[0]`
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Working directory; inherits the current one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Explicit base environment. When absent the base is the current
    /// process environment (or empty, see `DISABLE_ENVIRONMENT_INHERITANCE`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<EnvVar>>,

    /// Variables applied on top of the base environment, in order
    #[serde(default)]
    pub extra_environment: Vec<EnvVar>,

    /// Standard input redirection
    #[serde(default)]
    pub stdin: Redirection,

    /// Standard output redirection
    #[serde(default)]
    pub stdout: Redirection,

    /// Standard error redirection
    #[serde(default)]
    pub stderr: Redirection,

    /// Creation flags
    #[serde(default)]
    #[schemars(with = "String")]
    pub flags: ProcessFlags,
}

impl ProcessOptions {
    /// Options for running `file_name` with everything else defaulted
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            arguments: Vec::new(),
            working_directory: None,
            environment: None,
            extra_environment: Vec::new(),
            stdin: Redirection::Inherit,
            stdout: Redirection::Inherit,
            stderr: Redirection::Inherit,
            flags: ProcessFlags::empty(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn working_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add or override an environment variable
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_environment.push(EnvVar::set(name, value));
        self
    }

    /// Remove an environment variable
    pub fn env_remove(mut self, name: impl Into<String>) -> Self {
        self.extra_environment.push(EnvVar::remove(name));
        self
    }

    /// Replace the base environment
    pub fn base_environment(mut self, vars: Vec<EnvVar>) -> Self {
        self.environment = Some(vars);
        self
    }

    /// Set the stdin redirection
    pub fn stdin(mut self, redirection: Redirection) -> Self {
        self.stdin = redirection;
        self
    }

    /// Set the stdout redirection
    pub fn stdout(mut self, redirection: Redirection) -> Self {
        self.stdout = redirection;
        self
    }

    /// Set the stderr redirection
    pub fn stderr(mut self, redirection: Redirection) -> Self {
        self.stderr = redirection;
        self
    }

    /// Replace the creation flags
    pub fn flags(mut self, flags: ProcessFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether the child is isolated so that it can receive signals
    pub fn allows_signals(&self) -> bool {
        !self.flags.contains(ProcessFlags::ATTACH_TO_CURRENT_CONSOLE)
    }
}
