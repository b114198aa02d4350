//! Child process lifecycle engine
//!
//! Creates child processes with control over stdio redirection, environment,
//! working directory and signal delivery, and waits for their exit without
//! parking a thread per wait. Processes are created either directly
//! (fork/exec in this process) or by the `brood-helper` process reached over
//! a Unix socket.
//!
//! ```no_run
//! # async fn demo() -> brood_core::Result<()> {
//! use brood_core::{Engine, ProcessOptions, Redirection};
//!
//! let engine = Engine::global()?;
//! let child = engine
//!     .start(&ProcessOptions::new("/bin/echo").arg("hi").stdout(Redirection::Null))
//!     .await?;
//! assert_eq!(child.wait().await?, 0);
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod handles;
pub mod process;
pub mod stdio;
pub mod wait;


// Re-export schema types for convenience
pub use schema::*;

pub use child::{ChildProcess, RawHandles};
pub use config::{
    load_engine_config_from_toml_path, load_engine_config_from_toml_str, EngineConfig,
    SpawnStrategyKind,
};
pub use engine::Engine;
pub use env::{CaseRule, EnvEntry, EnvironmentList};
pub use error::{CoreError, Result};
pub use stdio::{ChildStderr, ChildStdin, ChildStdout};
pub use tokio_util::sync::CancellationToken;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
