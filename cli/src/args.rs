//! Command-line arguments

use brood_core::SpawnStrategyKind;
use clap::{Args, Parser, Subcommand};
use schema::{EnvVar, ProcessFlags, ProcessOptions, Redirection};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "brood")]
#[command(about = "Run programs through the brood process engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run PROGRAM and exit with its exit code
    Run(RunArgs),
    /// Print the environment a child would receive
    Env(EnvArgs),
    /// Print the JSON schema of the process options
    Schema,
}

/// Stream redirection as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMode {
    Inherit,
    Pipe,
    Null,
    File(PathBuf),
    Fd(i32),
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inherit" => Ok(StreamMode::Inherit),
            "pipe" => Ok(StreamMode::Pipe),
            "null" => Ok(StreamMode::Null),
            _ => {
                if let Some(path) = s.strip_prefix("file:") {
                    if path.is_empty() {
                        return Err("file: needs a path".to_string());
                    }
                    Ok(StreamMode::File(PathBuf::from(path)))
                } else if let Some(fd) = s.strip_prefix("fd:") {
                    fd.parse::<i32>()
                        .ok()
                        .filter(|fd| *fd >= 0)
                        .map(StreamMode::Fd)
                        .ok_or_else(|| format!("invalid descriptor '{fd}'"))
                } else {
                    Err(format!(
                        "unknown mode '{s}' (expected inherit, pipe, null, file:PATH or fd:N)"
                    ))
                }
            }
        }
    }
}

impl StreamMode {
    /// Engine redirection; `append` applies to file targets
    pub fn to_redirection(&self, append: bool) -> Redirection {
        match self {
            StreamMode::Inherit => Redirection::Inherit,
            StreamMode::Pipe => Redirection::Pipe,
            StreamMode::Null => Redirection::Null,
            StreamMode::File(path) if append => Redirection::append(path),
            StreamMode::File(path) => Redirection::file(path),
            StreamMode::Fd(fd) => Redirection::Fd { fd: *fd },
        }
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Environment patch options shared by `run` and `env`
#[derive(Args, Debug, Default)]
pub struct EnvPatchArgs {
    /// Set a variable (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE", value_parser = parse_env_pair)]
    pub set: Vec<(String, String)>,

    /// Remove a variable (repeatable, applied after --env)
    #[arg(long = "unset", value_name = "NAME")]
    pub unset: Vec<String>,

    /// Start from an empty environment instead of the current one
    #[arg(long)]
    pub clear_env: bool,
}

impl EnvPatchArgs {
    /// Patch list in application order
    pub fn patch(&self) -> Vec<EnvVar> {
        self.set
            .iter()
            .map(|(name, value)| EnvVar::set(name.clone(), value.clone()))
            .chain(self.unset.iter().map(|name| EnvVar::remove(name.clone())))
            .collect()
    }
}

#[derive(Args, Debug)]
pub struct EnvArgs {
    #[command(flatten)]
    pub env: EnvPatchArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub env: EnvPatchArgs,

    /// stdin mode: inherit, pipe, null, file:PATH or fd:N
    #[arg(long, default_value = "inherit")]
    pub stdin: StreamMode,

    /// stdout mode: inherit, pipe, null, file:PATH or fd:N
    #[arg(long, default_value = "inherit")]
    pub stdout: StreamMode,

    /// stderr mode: inherit, pipe, null, file:PATH or fd:N
    #[arg(long, default_value = "inherit")]
    pub stderr: StreamMode,

    /// Append to file targets instead of truncating them
    #[arg(long)]
    pub append: bool,

    /// Working directory of the child
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Spawn strategy: direct or helper
    #[arg(long, value_name = "S")]
    pub strategy: Option<SpawnStrategyKind>,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Terminate the child after SECS seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run the child on its own terminal so it can be interrupted
    #[arg(long)]
    pub isolate: bool,

    /// Program and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Program name as given
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Creation options for the already resolved `program`
    pub fn to_options(&self, program: PathBuf) -> ProcessOptions {
        let mut flags = ProcessFlags::empty();
        if !self.isolate {
            flags |= ProcessFlags::ATTACH_TO_CURRENT_CONSOLE;
        }
        if self.env.clear_env {
            flags |= ProcessFlags::DISABLE_ENVIRONMENT_INHERITANCE;
        }

        let mut options = ProcessOptions::new(program)
            .args(self.command.iter().skip(1).cloned())
            .stdin(self.stdin.to_redirection(self.append))
            .stdout(self.stdout.to_redirection(self.append))
            .stderr(self.stderr.to_redirection(self.append))
            .flags(flags);
        options.extra_environment = self.env.patch();
        if let Some(dir) = &self.cwd {
            options = options.working_directory(dir);
        }
        options
    }
}
