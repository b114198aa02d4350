//! JSON round-trip tests for schema types
//!
//! These tests verify that option types survive serialization and that
//! omitted fields pick up their documented defaults.

use crate::options::*;

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to test JSON round-trip for any serializable type
    fn test_json_roundtrip<T>(original: &T)
    where
        T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let json = serde_json::to_string(original).expect("Failed to serialize to JSON");
        let deserialized: T = serde_json::from_str(&json).expect("Failed to deserialize from JSON");
        assert_eq!(*original, deserialized, "Round-trip failed for JSON: {}", json);
    }

    #[test]
    fn test_process_options_json_roundtrip() {
        let opts = ProcessOptions::new("/bin/sh")
            .args(["-c", "echo hi"])
            .working_directory("/tmp")
            .env("FOO", "bar")
            .env_remove("HOME")
            .stdin(Redirection::Null)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::append("/tmp/err.log"))
            .flags(ProcessFlags::DISABLE_KILL_ON_DISPOSE | ProcessFlags::ENABLE_HANDLE_EXPORT);
        test_json_roundtrip(&opts);
    }

    #[test]
    fn test_minimal_options_use_defaults() {
        let opts: ProcessOptions =
            serde_json::from_str(r#"{"fileName":"/usr/bin/env"}"#).unwrap();
        assert!(opts.arguments.is_empty());
        assert!(opts.environment.is_none());
        assert_eq!(opts.stdout, Redirection::Inherit);
        assert!(opts.flags.is_empty());
    }

    #[test]
    fn test_fd_redirection_roundtrip() {
        test_json_roundtrip(&Redirection::Fd { fd: 7 });
    }

    #[test]
    fn test_env_var_remove_omits_value() {
        let json = serde_json::to_string(&EnvVar::remove("PATH")).unwrap();
        assert_eq!(json, r#"{"name":"PATH"}"#);
    }
}
