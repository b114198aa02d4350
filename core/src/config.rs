//! Engine configuration loading and validation
//!
//! The engine is configured from a small TOML document, from environment
//! variables, or both (environment wins). Validation errors carry the field
//! path that failed.
//!
//! ```toml
//! strategy = "helper"
//! helperPath = "/usr/libexec/brood-helper"
//! maxSubchannels = 8
//! handshakeTimeoutMs = 5000
//! spawnRetryAttempts = 5
//! ```

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the helper executable
pub const HELPER_BINARY_NAME: &str = "brood-helper";

/// Selects the strategy with [`SpawnStrategyKind`]
pub const ENV_STRATEGY: &str = "BROOD_SPAWN_STRATEGY";
/// Overrides [`EngineConfig::helper_path`]
pub const ENV_HELPER_PATH: &str = "BROOD_HELPER_PATH";
/// Overrides [`EngineConfig::max_subchannels`]
pub const ENV_MAX_SUBCHANNELS: &str = "BROOD_MAX_SUBCHANNELS";

/// How processes are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpawnStrategyKind {
    /// Fork/exec in this process
    Direct,
    /// Delegate to a long-lived `brood-helper`
    #[default]
    Helper,
}

impl std::str::FromStr for SpawnStrategyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(SpawnStrategyKind::Direct),
            "helper" => Ok(SpawnStrategyKind::Helper),
            other => Err(CoreError::ConfigurationError(format!(
                "strategy: unknown value '{other}' (expected 'direct' or 'helper')"
            ))),
        }
    }
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_spawn_retry_attempts() -> u32 {
    5
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Spawn strategy, fixed for the engine's lifetime
    #[serde(default)]
    pub strategy: SpawnStrategyKind,

    /// Explicit helper executable; discovered next to the current
    /// executable when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_path: Option<PathBuf>,

    /// Size of the helper subchannel pool; available parallelism when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_subchannels: Option<usize>,

    /// How long the helper has to connect back and say hello
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Attempts for a direct spawn that keeps failing with `EAGAIN`
    #[serde(default = "default_spawn_retry_attempts")]
    pub spawn_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SpawnStrategyKind::default(),
            helper_path: None,
            max_subchannels: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            spawn_retry_attempts: default_spawn_retry_attempts(),
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Apply `BROOD_*` environment overrides on top of this configuration
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(ENV_STRATEGY) {
            self.strategy = value.parse()?;
        }
        if let Some(value) = std::env::var_os(ENV_HELPER_PATH) {
            if !value.is_empty() {
                self.helper_path = Some(PathBuf::from(value));
            }
        }
        if let Ok(value) = std::env::var(ENV_MAX_SUBCHANNELS) {
            let n = value.trim().parse::<usize>().map_err(|e| {
                CoreError::ConfigurationError(format!(
                    "{ENV_MAX_SUBCHANNELS}: invalid value '{value}': {e}"
                ))
            })?;
            self.max_subchannels = Some(n);
        }
        self.validate()
    }

    /// Validate the configuration with field-path error messages
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.helper_path {
            if path.as_os_str().is_empty() {
                return Err(CoreError::ValidationError(
                    "helperPath: cannot be empty".to_string(),
                ));
            }
        }
        if self.max_subchannels == Some(0) {
            return Err(CoreError::ValidationError(
                "maxSubchannels: must be > 0".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(CoreError::ValidationError(
                "handshakeTimeoutMs: must be > 0".to_string(),
            ));
        }
        if self.spawn_retry_attempts == 0 {
            return Err(CoreError::ValidationError(
                "spawnRetryAttempts: must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Handshake timeout as a [`Duration`]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Subchannel pool size
    pub fn subchannels(&self) -> usize {
        self.max_subchannels.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    /// Locate the helper executable.
    ///
    /// Order: the configured path, then `brood-helper` next to the current
    /// executable, then one directory up (test binaries live in `deps/`).
    pub fn resolve_helper_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.helper_path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe().map_err(|e| {
            CoreError::ConfigurationError(format!("helperPath: cannot locate current executable: {e}"))
        })?;
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(d) = dir else { break };
            let candidate = d.join(HELPER_BINARY_NAME);
            if candidate.is_file() {
                debug!("Found helper at {:?}", candidate);
                return Ok(candidate);
            }
            dir = d.parent();
        }
        Err(CoreError::ConfigurationError(format!(
            "helperPath: {HELPER_BINARY_NAME} not found next to {:?}; set {ENV_HELPER_PATH}",
            exe
        )))
    }
}

/// Load engine config from a TOML file path
pub fn load_engine_config_from_toml_path(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_engine_config_from_toml_str(&data)
}

/// Load engine config from a TOML string
pub fn load_engine_config_from_toml_str(input: &str) -> Result<EngineConfig> {
    let cfg: EngineConfig = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
