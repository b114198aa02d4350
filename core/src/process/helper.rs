//! Delegated strategy: processes are created by `brood-helper`
//!
//! The backend owns the helper connection and a correlation table mapping
//! tokens to [`ProcessState`]s. A state is entered into the table before the
//! spawn request is sent, so an exit notification that overtakes the spawn
//! acknowledgement still finds it. The notification reader removes the
//! entry when the exit arrives; a failed spawn removes it immediately. When
//! the helper dies, every remaining state is marked helper-lost so its
//! waiters fail instead of waiting for a notification that cannot come.
//!
//! The helper keeps signalling a token's process group after the lead
//! process exits, so [`DelegatedProcess::signal`] with kill reaches
//! descendants left behind. Dropping the process object releases the token.

use super::{ProcessState, SpawnPlan};
use crate::config::EngineConfig;
use crate::{CoreError, Result};
use ipc::wire::SPAWN_FLAG_NEW_SESSION;
use ipc::{ExitNotification, ExitSink, HelperClient, HelperConfig, SpawnRequest};
use schema::Signal;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Token -> state of every helper child whose exit has not been seen yet
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<u64, Arc<ProcessState>>>,
    helper_lost: AtomicBool,
}

impl CorrelationTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Arc<ProcessState>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, token: u64, state: Arc<ProcessState>) {
        let mut entries = self.entries();
        if self.is_helper_lost() {
            drop(entries);
            state.set_helper_lost();
            return;
        }
        entries.insert(token, state);
    }

    fn remove(&self, token: u64) -> Option<Arc<ProcessState>> {
        self.entries().remove(&token)
    }

    /// Number of children still awaiting an exit notification
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no child is awaiting an exit notification
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Whether the helper's notification stream has ended
    pub fn is_helper_lost(&self) -> bool {
        self.helper_lost.load(Ordering::SeqCst)
    }
}

impl ExitSink for CorrelationTable {
    fn on_exit(&self, notification: ExitNotification) {
        match self.remove(notification.token) {
            Some(state) => {
                debug!(
                    "Token {} (pid {}) exited with {}",
                    notification.token, notification.pid, notification.status
                );
                state.set_exited(notification.status);
            }
            None => debug!(
                "Ignoring exit notification for unknown token {}",
                notification.token
            ),
        }
    }

    fn on_helper_lost(&self) {
        let orphaned: Vec<_> = {
            let mut entries = self.entries();
            self.helper_lost.store(true, Ordering::SeqCst);
            entries.drain().map(|(_, state)| state).collect()
        };
        if !orphaned.is_empty() {
            error!(
                "Helper lost with {} running children; their exit codes will never arrive",
                orphaned.len()
            );
        }
        for state in orphaned {
            state.set_helper_lost();
        }
    }
}

/// Connection to the helper plus token bookkeeping
#[derive(Debug)]
pub struct HelperBackend {
    client: HelperClient,
    table: Arc<CorrelationTable>,
    next_token: AtomicU64,
}

impl HelperBackend {
    /// Launch the helper described by `config` and start reading its exit
    /// notifications
    pub fn launch(config: &EngineConfig) -> Result<Arc<Self>> {
        let helper_config = HelperConfig {
            helper_path: config.resolve_helper_path()?,
            max_subchannels: config.subchannels(),
            handshake_timeout: config.handshake_timeout(),
        };
        let client = HelperClient::launch(&helper_config)?;
        let table = Arc::new(CorrelationTable::default());
        client.start_notification_reader(Arc::clone(&table) as Arc<dyn ExitSink>)?;
        info!(
            "Spawn helper {} ready at {:?}",
            client.helper_pid(),
            helper_config.helper_path
        );
        Ok(Arc::new(Self {
            client,
            table,
            next_token: AtomicU64::new(1),
        }))
    }

    /// Correlation table, for diagnostics
    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    /// Process id of the helper
    pub fn helper_pid(&self) -> u32 {
        self.client.helper_pid()
    }

    /// Whether the helper has died
    pub fn is_crashed(&self) -> bool {
        self.client.is_crashed()
    }

    /// Ask the helper to create a child with `stdio` as its standard streams
    pub async fn spawn(
        self: &Arc<Self>,
        plan: &SpawnPlan,
        stdio: [BorrowedFd<'_>; 3],
    ) -> Result<DelegatedProcess> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let state = ProcessState::delegated(token, plan.isolate);
        let request = SpawnRequest {
            token,
            flags: if plan.isolate { SPAWN_FLAG_NEW_SESSION } else { 0 },
            working_directory: plan.working_directory.clone(),
            file_name: plan.file_name.clone(),
            argv: plan.argv.clone(),
            env: plan.env.clone(),
        };

        self.table.insert(token, Arc::clone(&state));
        match self.client.spawn(&request, stdio).await {
            Ok(pid) => {
                state.set_process_id(pid);
                Ok(DelegatedProcess {
                    state,
                    backend: Arc::clone(self),
                    kill_on_drop: plan.kill_on_drop,
                })
            }
            Err(e) => {
                self.table.remove(token);
                state.set_spawn_failed();
                let err = CoreError::from(e);
                if let CoreError::ProcessSpawn { errno, message } = err {
                    return Err(CoreError::ProcessSpawn {
                        errno,
                        message: format!(
                            "failed to start {:?}: {}",
                            String::from_utf8_lossy(&plan.file_name),
                            message
                        ),
                    });
                }
                Err(err)
            }
        }
    }

    async fn release(&self, token: u64) -> Result<()> {
        Ok(self.client.release(token).await?)
    }

    async fn signal(&self, token: u64, signal: Signal) -> Result<()> {
        self.client.signal(token, signal).await.map_err(|e| match CoreError::from(e) {
            CoreError::ProcessSpawn { errno, message } => {
                CoreError::ProcessSignal(format!("{message} (errno {errno})"))
            }
            other => other,
        })
    }
}

/// A child created by the helper
#[derive(Debug)]
pub struct DelegatedProcess {
    state: Arc<ProcessState>,
    backend: Arc<HelperBackend>,
    kill_on_drop: bool,
}

impl DelegatedProcess {
    /// Shared process state
    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Deliver `signal` through the helper
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let token = self
            .state
            .token()
            .ok_or_else(|| CoreError::InvalidState("delegated process without token".into()))?;
        if signal != Signal::Kill {
            if !self.state.can_signal() {
                return Err(CoreError::InvalidState(format!(
                    "{signal:?} requires a process that is not attached to the current console"
                )));
            }
            if !self.state.accepts_signals() {
                return Err(CoreError::InvalidState(format!(
                    "{signal:?} requires a running process"
                )));
            }
        }
        self.backend.signal(token, signal).await
    }
}

impl Drop for DelegatedProcess {
    fn drop(&mut self) {
        if self.backend.is_crashed() {
            return;
        }
        let Some(token) = self.state.token() else {
            return;
        };
        let kill = self.kill_on_drop;
        let backend = Arc::clone(&self.backend);
        let cleanup = async move {
            // The lead may be gone while its group is not
            if kill {
                if let Err(e) = backend.signal(token, Signal::Kill).await {
                    warn!("Kill on drop for token {} failed: {}", token, e);
                }
            }
            if let Err(e) = backend.release(token).await {
                debug!("Releasing token {} failed: {}", token, e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("brood-kill".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(rt) => rt.block_on(cleanup),
                            Err(e) => warn!("Failed to build runtime for kill on drop: {}", e),
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to start kill-on-drop thread: {}", e);
                }
            }
        }
    }
}
