//! Core error types and utilities

use ipc::IpcError;
use nix::errno::Errno;
use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Failed to create process: {message} (errno {errno})")]
    ProcessSpawn { errno: i32, message: String },

    #[error("Failed to signal process: {0}")]
    ProcessSignal(String),

    #[error("Failed to wait for process: {0}")]
    ProcessWait(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Spawn helper crashed: {0}")]
    HelperCrashed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(IpcError),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::ProcessSpawn { .. } => "CORE004",
            CoreError::ProcessSignal(_) => "CORE005",
            CoreError::ProcessWait(_) => "CORE006",
            CoreError::InvalidState(_) => "CORE007",
            CoreError::Canceled => "CORE008",
            CoreError::HelperCrashed(_) => "CORE009",
            CoreError::Protocol(_) => "CORE010",
            CoreError::IoError(_) => "CORE011",
            CoreError::Ipc(_) => "CORE012",
        }
    }

    /// Creation failure carrying a native errno
    pub fn spawn_errno(errno: Errno, context: impl std::fmt::Display) -> Self {
        CoreError::ProcessSpawn {
            errno: errno as i32,
            message: format!("{}: {}", context, errno.desc()),
        }
    }

    /// Whether the spawn helper died, as opposed to the request itself
    /// failing
    pub fn is_helper_crashed(&self) -> bool {
        match self {
            CoreError::HelperCrashed(_) => true,
            CoreError::Ipc(e) => e.is_helper_crashed(),
            _ => false,
        }
    }

    /// Native errno behind this error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            CoreError::ProcessSpawn { errno, .. } => Some(*errno),
            CoreError::Ipc(IpcError::Native { errno, .. }) => Some(*errno),
            CoreError::IoError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<IpcError> for CoreError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::HelperCrashed(msg) => CoreError::HelperCrashed(msg),
            IpcError::Native { errno, message } => CoreError::ProcessSpawn { errno, message },
            IpcError::ProtocolError(msg) => CoreError::Protocol(msg),
            other => CoreError::Ipc(other),
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
