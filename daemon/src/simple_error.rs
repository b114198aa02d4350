//! Helper error types

use nix::errno::Errno;

#[derive(Debug)]
pub enum HelperError {
    UsageError(String),
    ConnectionError(String),
    ProtocolError(String),
    IoError(std::io::Error),
    SystemError(Errno),
}

impl std::fmt::Display for HelperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HelperError::UsageError(msg) => write!(f, "Usage error: {}", msg),
            HelperError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            HelperError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            HelperError::IoError(err) => write!(f, "I/O error: {}", err),
            HelperError::SystemError(errno) => write!(f, "System error: {}", errno),
        }
    }
}

impl std::error::Error for HelperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HelperError::IoError(err) => Some(err),
            HelperError::SystemError(errno) => Some(errno),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HelperError {
    fn from(err: std::io::Error) -> Self {
        HelperError::IoError(err)
    }
}

impl From<Errno> for HelperError {
    fn from(errno: Errno) -> Self {
        HelperError::SystemError(errno)
    }
}

pub type Result<T> = std::result::Result<T, HelperError>;
