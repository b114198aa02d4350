//! `brood run` and `brood env`

use crate::args::{EnvArgs, RunArgs};
use crate::foreground::ForegroundGuard;
use crate::{CliError, Result};
use brood_core::env::{merge, CaseRule, EnvironmentList};
use brood_core::{load_engine_config_from_toml_path, CancellationToken, Engine, EngineConfig};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a child gets between termination and kill
const GRACE_PERIOD: Duration = Duration::from_secs(5);

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `program` against `path` (a `PATH`-style list). Names containing
/// a slash are used as given.
pub fn resolve_program(program: &str, path: Option<&OsStr>) -> Result<PathBuf> {
    if program.is_empty() {
        return Err(CliError::InvalidArgument("empty program name".to_string()));
    }
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    let path = path.unwrap_or_default();
    std::env::split_paths(path)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| CliError::ProgramNotFound(program.to_string()))
}

/// Engine configuration: the file if given, else defaults; environment
/// overrides and `--strategy` on top
pub fn engine_config(args: &RunArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => load_engine_config_from_toml_path(path)
            .map_err(|e| CliError::ConfigError(e.to_string()))?,
        None => EngineConfig::default(),
    };
    config
        .apply_env()
        .map_err(|e| CliError::ConfigError(e.to_string()))?;
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    Ok(config)
}

fn pump<R, W>(mut from: R, mut to: W) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
            debug!("Stream copy ended: {}", e);
        }
        let _ = to.flush().await;
    })
}

/// Run the program described by `args` and return its exit code
pub async fn run(args: &RunArgs) -> Result<i32> {
    let program = resolve_program(args.program(), std::env::var_os("PATH").as_deref())?;
    let options = args.to_options(program);
    let engine = Engine::new(&engine_config(args)?)?;

    let mut child = engine.start(&options).await?;
    info!("Started {:?} as pid {}", options.file_name, child.pid());

    let foreground = if options.allows_signals() {
        None
    } else {
        ForegroundGuard::acquire(child.pid())
    };

    // stdin is not awaited: it would block until our own stdin closes
    if let Some(stdin) = child.take_stdin() {
        pump(tokio::io::stdin(), stdin);
    }
    let mut outputs = Vec::new();
    if let Some(stdout) = child.take_stdout() {
        outputs.push(pump(stdout, tokio::io::stdout()));
    }
    if let Some(stderr) = child.take_stderr() {
        outputs.push(pump(stderr, tokio::io::stderr()));
    }

    let never = CancellationToken::new();
    let timeout = args.timeout.map(Duration::from_secs);
    let exited = tokio::select! {
        exited = child.wait_for_exit_async(timeout, &never) => exited?,
        _ = tokio::signal::ctrl_c() => {
            if child.can_signal() {
                debug!("Forwarding interrupt to pid {}", child.pid());
                child.signal_interrupt().await?;
            } else {
                child.kill().await?;
            }
            child.wait_for_exit_async(Some(GRACE_PERIOD), &never).await?
        }
    };

    if !exited {
        warn!("pid {} did not exit in time, terminating", child.pid());
        if child.can_signal() {
            child.signal_termination().await?;
            if !child
                .wait_for_exit_async(Some(GRACE_PERIOD), &never)
                .await?
            {
                child.kill().await?;
            }
        } else {
            child.kill().await?;
        }
    }
    let code = child.wait().await?;
    drop(foreground);

    for output in outputs {
        let _ = output.await;
    }
    debug!("pid {} exited with {}", child.pid(), code);
    Ok(code)
}

/// Environment produced by applying the patch in `args` to the current (or
/// an empty) environment
pub fn merged_environment(args: &EnvArgs) -> Result<EnvironmentList> {
    let rule = CaseRule::platform();
    let base = if args.env.clear_env {
        EnvironmentList::empty(rule)
    } else {
        EnvironmentList::snapshot_current(rule)
    };
    Ok(merge(&base, &args.env.patch())?)
}
