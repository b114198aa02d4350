//! IPC error types and utilities

use thiserror::Error;

/// IPC-specific error types
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to launch helper: {0}")]
    LaunchFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Failed to send request: {0}")]
    SendFailed(String),

    #[error("Failed to receive response: {0}")]
    ReceiveFailed(String),

    #[error("Helper process crashed: {0}")]
    HelperCrashed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Helper reported OS error {errno}: {message}")]
    Native { errno: i32, message: String },

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl IpcError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            IpcError::LaunchFailed(_) => "IPC001",
            IpcError::ConnectionFailed(_) => "IPC002",
            IpcError::HandshakeFailed(_) => "IPC003",
            IpcError::SendFailed(_) => "IPC004",
            IpcError::ReceiveFailed(_) => "IPC005",
            IpcError::HelperCrashed(_) => "IPC006",
            IpcError::ProtocolError(_) => "IPC007",
            IpcError::Native { .. } => "IPC008",
            IpcError::Timeout(_) => "IPC009",
        }
    }

    /// Build a [`IpcError::Native`] from a raw errno value
    pub fn native(errno: i32) -> Self {
        IpcError::Native {
            errno,
            message: nix::errno::Errno::from_raw(errno).desc().to_string(),
        }
    }

    /// Whether this error means the helper is gone rather than the request
    /// being bad
    pub fn is_helper_crashed(&self) -> bool {
        matches!(self, IpcError::HelperCrashed(_))
    }
}

/// IPC-specific result type
pub type Result<T> = std::result::Result<T, IpcError>;
