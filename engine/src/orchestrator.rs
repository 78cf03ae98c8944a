//! Strategy state machine and public operation surface.
//!
//! One orchestrator owns every strategy's status and sandbox handle. A
//! per-strategy lock serializes transitions: `start` try-locks and loses a
//! race with `Conflict`; `stop`, `pause` and `resume` wait their turn and
//! re-read the persisted state before acting. The persisted state is written
//! only after the corresponding environment-manager call has succeeded, so a
//! runtime failure never leaves a phantom Running strategy behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::models::{BrokerKind, CredentialBundle, RunStatus, StrategyStatus};
use shared::templates::render_strategy;
use shared::Config;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use crate::environment::{self, EnvironmentManager};
use crate::error::EngineError;
use crate::runtime::{ContainerRuntime, LogChunk};
use crate::store::{
    CredentialError, CredentialStore, NewRunRecord, RunOutcome, RunStore, StrategyRecord,
    StrategyStore,
};
use crate::streaming::OutputHub;

/// Result of a `stop` call. Stopping an already-stopped strategy is a
/// successful no-op, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

pub struct OrchestratorOptions {
    pub runner_image: String,
    pub run_once_timeout: Duration,
    pub log_channel_capacity: usize,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            runner_image: config.runner_image.clone(),
            run_once_timeout: Duration::from_secs(config.run_once_timeout_secs),
            log_channel_capacity: config.log_channel_capacity,
        }
    }
}

pub struct StrategyOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    environments: EnvironmentManager,
    strategies: Arc<dyn StrategyStore>,
    credentials: Arc<dyn CredentialStore>,
    runs: Arc<dyn RunStore>,
    hub: Arc<OutputHub>,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    run_once_timeout: Duration,
}

impl StrategyOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        strategies: Arc<dyn StrategyStore>,
        credentials: Arc<dyn CredentialStore>,
        runs: Arc<dyn RunStore>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            environments: EnvironmentManager::new(runtime.clone(), options.runner_image),
            runtime,
            strategies,
            credentials,
            runs,
            hub: Arc::new(OutputHub::new(options.log_channel_capacity)),
            locks: std::sync::Mutex::new(HashMap::new()),
            run_once_timeout: options.run_once_timeout,
        }
    }

    /// Start a Stopped strategy: render its code, spin up the sandbox, open a
    /// run record, attach the capture task, then persist Running.
    pub async fn start(&self, owner: Uuid, strategy_id: Uuid) -> Result<(), EngineError> {
        let guard = self.guard(strategy_id);
        let Ok(_held) = guard.try_lock() else {
            return Err(EngineError::Conflict);
        };

        let strategy = self.load(owner, strategy_id).await?;
        if strategy.status != StrategyStatus::Stopped {
            return Err(EngineError::InvalidStateTransition {
                state: strategy.status,
                action: "start",
            });
        }

        let bundle = self.resolve_credentials(owner, strategy.broker).await?;
        let code = render_strategy(&strategy.code, strategy.broker)
            .map_err(|e| anyhow::anyhow!("failed to render strategy code: {}", e))?;

        let handle = self
            .environments
            .create_and_start(strategy_id, code, bundle.env_vars())
            .await?;

        let run_id = match self
            .runs
            .create(NewRunRecord {
                user_id: owner,
                strategy_id: Some(strategy_id),
                strategy_name: strategy.name.clone(),
                broker: strategy.broker,
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                self.environments.discard(&handle.name).await;
                return Err(err.into());
            }
        };

        let stream = match self.environments.attach(&handle.name).await {
            Ok(stream) => stream,
            Err(err) => {
                self.environments.discard(&handle.name).await;
                self.finalize_quietly(
                    run_id,
                    RunStatus::Error,
                    String::new(),
                    Some("failed to attach to sandbox output".to_string()),
                )
                .await;
                return Err(err);
            }
        };

        let buffer = self.hub.open_run(strategy_id).await;
        self.hub.spawn_capture(
            self.runtime.clone(),
            self.runs.clone(),
            stream,
            handle.clone(),
            run_id,
            buffer,
        );

        if let Err(err) = self
            .strategies
            .update_execution_state(strategy_id, StrategyStatus::Running, Some(handle.name.clone()))
            .await
        {
            // Roll the sandbox back; the capture task will observe the
            // removal and finalize the record as stopped.
            self.environments.discard(&handle.name).await;
            return Err(err.into());
        }

        info!("Strategy {} started in sandbox {}", strategy_id, handle.name);
        Ok(())
    }

    /// Stop a strategy, idempotently. Waits for the per-strategy lock so a
    /// stop issued during an in-flight start acts on the final state instead
    /// of racing sandbox creation.
    pub async fn stop(&self, owner: Uuid, strategy_id: Uuid) -> Result<StopOutcome, EngineError> {
        let guard = self.guard(strategy_id);
        let _held = guard.lock().await;

        let strategy = self.load(owner, strategy_id).await?;
        if strategy.status == StrategyStatus::Stopped {
            return Ok(StopOutcome::AlreadyStopped);
        }

        let name = strategy
            .sandbox_id
            .clone()
            .unwrap_or_else(|| environment::sandbox_name(strategy_id));
        self.environments.remove(&name, true).await?;

        let output = self.hub.take_buffer(strategy_id).await.unwrap_or_default();
        self.runs
            .finalize_open(
                strategy_id,
                RunOutcome {
                    status: RunStatus::Stopped,
                    output,
                    error_message: None,
                    stopped_at: Utc::now(),
                },
            )
            .await?;

        self.strategies
            .update_execution_state(strategy_id, StrategyStatus::Stopped, None)
            .await?;

        info!("Strategy {} stopped", strategy_id);
        Ok(StopOutcome::Stopped)
    }

    /// Freeze a Running strategy's sandbox without discarding it.
    pub async fn pause(&self, owner: Uuid, strategy_id: Uuid) -> Result<(), EngineError> {
        let guard = self.guard(strategy_id);
        let _held = guard.lock().await;

        let strategy = self.load(owner, strategy_id).await?;
        if strategy.status != StrategyStatus::Running {
            return Err(EngineError::InvalidStateTransition {
                state: strategy.status,
                action: "pause",
            });
        }

        let name = strategy
            .sandbox_id
            .clone()
            .unwrap_or_else(|| environment::sandbox_name(strategy_id));
        self.environments.pause(&name).await?;

        self.strategies
            .update_execution_state(strategy_id, StrategyStatus::Paused, Some(name))
            .await?;

        info!("Strategy {} paused", strategy_id);
        Ok(())
    }

    /// Thaw a Paused strategy. The same sandbox keeps running; no new one is
    /// created.
    pub async fn resume(&self, owner: Uuid, strategy_id: Uuid) -> Result<(), EngineError> {
        let guard = self.guard(strategy_id);
        let _held = guard.lock().await;

        let strategy = self.load(owner, strategy_id).await?;
        if strategy.status != StrategyStatus::Paused {
            return Err(EngineError::InvalidStateTransition {
                state: strategy.status,
                action: "resume",
            });
        }

        let name = strategy
            .sandbox_id
            .clone()
            .unwrap_or_else(|| environment::sandbox_name(strategy_id));
        self.environments.resume(&name).await?;

        self.strategies
            .update_execution_state(strategy_id, StrategyStatus::Running, Some(name))
            .await?;

        info!("Strategy {} resumed", strategy_id);
        Ok(())
    }

    /// Run ad-hoc code in a one-shot sandbox and return its captured output.
    /// The attempt is recorded in the run history with no strategy id.
    pub async fn run_once(
        &self,
        owner: Uuid,
        code: &str,
        broker: BrokerKind,
    ) -> Result<String, EngineError> {
        let bundle = self.resolve_credentials(owner, broker).await?;
        let rendered = render_strategy(code, broker)
            .map_err(|e| anyhow::anyhow!("failed to render code: {}", e))?;

        let run_id = self
            .runs
            .create(NewRunRecord {
                user_id: owner,
                strategy_id: None,
                strategy_name: "ad-hoc".to_string(),
                broker,
            })
            .await?;

        match self
            .environments
            .run_once(rendered, bundle.env_vars(), self.run_once_timeout)
            .await
        {
            Ok((output, 0)) => {
                self.finalize_quietly(run_id, RunStatus::Success, output.clone(), None)
                    .await;
                Ok(output)
            }
            Ok((output, code)) => {
                self.finalize_quietly(
                    run_id,
                    RunStatus::Error,
                    output.clone(),
                    Some(format!("sandbox exited with code {}", code)),
                )
                .await;
                Ok(output)
            }
            Err(EngineError::Timeout {
                deadline_secs,
                output,
            }) => {
                self.finalize_quietly(
                    run_id,
                    RunStatus::Error,
                    output.clone(),
                    Some(format!("run exceeded its deadline of {}s", deadline_secs)),
                )
                .await;
                Err(EngineError::Timeout {
                    deadline_secs,
                    output,
                })
            }
            Err(err) => {
                self.finalize_quietly(run_id, RunStatus::Error, String::new(), Some(err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// Live output stream for a strategy. Not retroactive: only chunks
    /// emitted after subscribing are delivered.
    pub async fn subscribe(&self, strategy_id: Uuid) -> broadcast::Receiver<LogChunk> {
        self.hub.subscribe(strategy_id).await
    }

    /// Called when a streaming client disconnects.
    pub async fn unsubscribe(&self, strategy_id: Uuid) {
        self.hub.unsubscribe(strategy_id).await
    }

    async fn load(&self, owner: Uuid, strategy_id: Uuid) -> Result<StrategyRecord, EngineError> {
        self.strategies
            .fetch(owner, strategy_id)
            .await?
            .ok_or(EngineError::StrategyNotFound)
    }

    async fn resolve_credentials(
        &self,
        owner: Uuid,
        broker: BrokerKind,
    ) -> Result<CredentialBundle, EngineError> {
        let bundle = self
            .credentials
            .resolve(owner, broker)
            .await
            .map_err(|err| match err {
                CredentialError::NotFound => EngineError::CredentialsMissing,
                CredentialError::DecryptionFailed | CredentialError::Empty => {
                    EngineError::CredentialsInvalid {
                        reason: err.to_string(),
                    }
                }
            })?;

        if bundle.is_empty() {
            return Err(EngineError::CredentialsInvalid {
                reason: "empty client id or access token".to_string(),
            });
        }
        Ok(bundle)
    }

    /// Background-path finalization: log on failure instead of propagating.
    async fn finalize_quietly(
        &self,
        run_id: Uuid,
        status: RunStatus,
        output: String,
        error_message: Option<String>,
    ) {
        let outcome = RunOutcome {
            status,
            output,
            error_message,
            stopped_at: Utc::now(),
        };
        if let Err(err) = self.runs.finalize(run_id, outcome).await {
            error!("Failed to finalize run {}: {}", run_id, err);
        }
    }

    /// Per-strategy transition lock, created on first use. The registry is
    /// the only cross-strategy shared state besides the broadcast channels.
    fn guard(&self, strategy_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(strategy_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
