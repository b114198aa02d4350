#[cfg(test)]
mod tests {
    use crate::{HelperError, Result};
    use nix::errno::Errno;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_helper_error_display() {
        let err = HelperError::UsageError("missing socket path".to_string());
        assert_eq!(err.to_string(), "Usage error: missing socket path");

        let err = HelperError::ConnectionError("refused".to_string());
        assert_eq!(err.to_string(), "Connection error: refused");

        let err = HelperError::ProtocolError("bad tag 7".to_string());
        assert_eq!(err.to_string(), "Protocol error: bad tag 7");

        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = HelperError::IoError(io_err);
        assert!(err.to_string().contains("access denied"));

        let err = HelperError::SystemError(Errno::ECHILD);
        assert!(err.to_string().starts_with("System error: "));
    }

    #[test]
    fn test_helper_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let helper_err: HelperError = io_err.into();

        if let HelperError::IoError(_) = helper_err {
            // Expected variant
        } else {
            panic!("Expected HelperError::IoError variant");
        }
    }

    #[test]
    fn test_helper_error_from_errno() {
        let helper_err: HelperError = Errno::EAGAIN.into();
        assert!(matches!(helper_err, HelperError::SystemError(Errno::EAGAIN)));
        assert!(helper_err.source().is_some());
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let helper_err = HelperError::IoError(io_err);
        assert!(helper_err.source().is_some());

        let helper_err = HelperError::ProtocolError("x".to_string());
        assert!(helper_err.source().is_none());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(42)
        }

        fn returns_err() -> Result<u32> {
            Err(HelperError::ProtocolError("test failure".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
