//! The process engine
//!
//! An [`Engine`] fixes the spawn strategy for its lifetime and turns
//! [`ProcessOptions`] into running [`ChildProcess`]es:
//!
//! 1. validate everything that can be validated without the OS
//! 2. build the environment (snapshot or explicit base, then the patch)
//! 3. resolve the stdio redirections
//! 4. hand the plan to the strategy
//! 5. detach the local pipe ends into the returned process object
//!
//! Most programs use the lazily created [`Engine::global`].

use crate::child::ChildProcess;
use crate::config::{EngineConfig, SpawnStrategyKind};
use crate::env::{self, CaseRule, EnvironmentList};
use crate::process::direct::DirectSpawner;
use crate::process::helper::HelperBackend;
use crate::process::SpawnPlan;
use crate::stdio;
use crate::wait::ExitWaitScheduler;
use crate::{CoreError, Result};
use schema::{ProcessFlags, ProcessOptions};
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

/// Strategy selected at engine creation
#[derive(Debug)]
pub enum Strategy {
    /// fork/exec in this process
    Direct(DirectSpawner),
    /// Delegate to `brood-helper`
    Helper(Arc<HelperBackend>),
}

#[derive(Debug)]
struct EngineInner {
    strategy: Strategy,
    scheduler: ExitWaitScheduler,
    case_rule: CaseRule,
}

/// Creates child processes; cheap to clone
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

static GLOBAL: OnceLock<Engine> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

impl Engine {
    /// Create an engine. For the helper strategy this launches the helper.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let strategy = match config.strategy {
            SpawnStrategyKind::Direct => {
                Strategy::Direct(DirectSpawner::new(config.spawn_retry_attempts))
            }
            SpawnStrategyKind::Helper => Strategy::Helper(HelperBackend::launch(config)?),
        };
        info!("Process engine created with {:?} strategy", config.strategy);
        Ok(Self {
            inner: Arc::new(EngineInner {
                strategy,
                scheduler: ExitWaitScheduler::new(),
                case_rule: CaseRule::platform(),
            }),
        })
    }

    /// The process-wide engine, configured from the environment on first
    /// use
    pub fn global() -> Result<Self> {
        if let Some(engine) = GLOBAL.get() {
            return Ok(engine.clone());
        }
        let _guard = GLOBAL_INIT.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(engine) = GLOBAL.get() {
            return Ok(engine.clone());
        }
        let engine = Self::new(&EngineConfig::from_env()?)?;
        Ok(GLOBAL.get_or_init(|| engine).clone())
    }

    /// Strategy this engine uses
    pub fn strategy(&self) -> &Strategy {
        &self.inner.strategy
    }

    /// Kind of strategy this engine uses
    pub fn strategy_kind(&self) -> SpawnStrategyKind {
        match self.inner.strategy {
            Strategy::Direct(_) => SpawnStrategyKind::Direct,
            Strategy::Helper(_) => SpawnStrategyKind::Helper,
        }
    }

    /// Exit-wait scheduler shared by this engine's processes
    pub fn scheduler(&self) -> &ExitWaitScheduler {
        &self.inner.scheduler
    }

    /// Environment the child of `options` would receive
    pub fn environment_for(&self, options: &ProcessOptions) -> Result<EnvironmentList> {
        let rule = self.inner.case_rule;
        let base = match &options.environment {
            Some(vars) => EnvironmentList::from_vars(vars, rule)?,
            None if options
                .flags
                .contains(ProcessFlags::DISABLE_ENVIRONMENT_INHERITANCE) =>
            {
                EnvironmentList::empty(rule)
            }
            None => EnvironmentList::snapshot_current(rule),
        };
        env::merge(&base, &options.extra_environment)
    }

    /// Validate `options` and encode them, without acquiring OS resources
    fn plan(&self, options: &ProcessOptions) -> Result<SpawnPlan> {
        let file_name = options.file_name.as_os_str().as_bytes().to_vec();
        if file_name.is_empty() {
            return Err(CoreError::ValidationError(
                "fileName: cannot be empty".to_string(),
            ));
        }
        stdio::validate(&options.stdin, &options.stdout, &options.stderr)?;

        let mut argv = Vec::with_capacity(options.arguments.len() + 1);
        argv.push(file_name.clone());
        for (i, arg) in options.arguments.iter().enumerate() {
            if arg.contains('\0') {
                return Err(CoreError::ValidationError(format!(
                    "arguments[{i}]: contains a NUL byte"
                )));
            }
            argv.push(arg.as_bytes().to_vec());
        }
        if file_name.contains(&0) {
            return Err(CoreError::ValidationError(
                "fileName: contains a NUL byte".to_string(),
            ));
        }

        let working_directory = match &options.working_directory {
            Some(dir) if dir.as_os_str().is_empty() => {
                return Err(CoreError::ValidationError(
                    "workingDirectory: cannot be empty".to_string(),
                ))
            }
            Some(dir) => Some(dir.as_os_str().as_bytes().to_vec()),
            None => None,
        };

        let env = self.environment_for(options)?.to_block();

        Ok(SpawnPlan {
            file_name,
            argv,
            env,
            working_directory,
            isolate: options.allows_signals(),
            kill_on_drop: !options.flags.contains(ProcessFlags::DISABLE_KILL_ON_DISPOSE),
        })
    }

    /// Create a child process
    pub async fn start(&self, options: &ProcessOptions) -> Result<ChildProcess> {
        let plan = self.plan(options)?;
        let resolved = stdio::resolve(
            &options.stdin,
            &options.stdout,
            &options.stderr,
            plan.isolate,
        )?;
        debug!(
            "Starting {:?} (stdin={}, stdout={}, stderr={})",
            options.file_name,
            options.stdin.mode_name(),
            options.stdout.mode_name(),
            options.stderr.mode_name()
        );

        let native = match &self.inner.strategy {
            Strategy::Direct(spawner) => spawner
                .spawn(&plan, resolved.child_fds())
                .await
                .map(crate::child::NativeProcess::Direct)?,
            Strategy::Helper(backend) => backend
                .spawn(&plan, resolved.child_fds())
                .await
                .map(crate::child::NativeProcess::Delegated)?,
        };
        let pipes = resolved.detach()?;

        Ok(ChildProcess::new(
            native,
            self.clone(),
            pipes,
            options.flags.contains(ProcessFlags::ENABLE_HANDLE_EXPORT),
        ))
    }
}
