//! Execution environment manager.
//!
//! Creates and drives isolated sandboxes for strategy code. Sandbox names are
//! a deterministic function of the strategy id, so the runtime itself
//! guarantees at most one sandbox per strategy; any same-named leftover from
//! a prior crash is removed before a new one is created.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::runtime::{ContainerRuntime, LogStream, RuntimeError, SandboxSpec};

const SANDBOX_PREFIX: &str = "algorun-strategy-";
const ONESHOT_PREFIX: &str = "algorun-oneshot-";

/// Deterministic sandbox name for a strategy.
pub fn sandbox_name(strategy_id: Uuid) -> String {
    format!("{}{}", SANDBOX_PREFIX, strategy_id)
}

/// A live sandbox tied to a strategy. Ephemeral: only the name survives in
/// the strategy record while the strategy is not Stopped.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub runtime_id: String,
    pub name: String,
    pub strategy_id: Uuid,
    pub started_at: DateTime<Utc>,
}

pub struct EnvironmentManager {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
}

impl EnvironmentManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image: String) -> Self {
        Self { runtime, image }
    }

    /// Create and start a persistent sandbox for a strategy. The sandbox is
    /// not auto-removed on exit so it can be paused and resumed.
    ///
    /// A failed create leaves nothing behind; a failed start removes the
    /// just-created sandbox best-effort before returning.
    pub async fn create_and_start(
        &self,
        strategy_id: Uuid,
        code: String,
        env: Vec<String>,
    ) -> Result<SandboxHandle, EngineError> {
        let name = sandbox_name(strategy_id);

        // Crash recovery: a sandbox with this name may have survived an
        // unclean shutdown. Remove it first; absent is the normal case.
        match self.runtime.remove(&name, true).await {
            Ok(()) => info!("Removed stale sandbox: {}", name),
            Err(RuntimeError::NotFound { .. }) => {}
            Err(err) => warn!("Error checking for stale sandbox {}: {}", name, err),
        }

        let spec = SandboxSpec {
            name: name.clone(),
            image: self.image.clone(),
            cmd: python_cmd(code),
            env,
        };

        let runtime_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(EngineError::EnvironmentCreateFailed)?;

        if let Err(err) = self.runtime.start(&name).await {
            self.discard(&name).await;
            return Err(EngineError::EnvironmentStartFailed(err));
        }

        Ok(SandboxHandle {
            runtime_id,
            name,
            strategy_id,
            started_at: Utc::now(),
        })
    }

    /// Run ad-hoc code in a one-shot sandbox, bounded by `deadline`. Returns
    /// the captured output and the exit code; the sandbox is removed either
    /// way. Exceeding the deadline force-removes the sandbox and returns
    /// whatever output was captured so far inside the Timeout error.
    pub async fn run_once(
        &self,
        code: String,
        env: Vec<String>,
        deadline: Duration,
    ) -> Result<(String, i64), EngineError> {
        let name = format!("{}{}", ONESHOT_PREFIX, Uuid::new_v4());
        let spec = SandboxSpec {
            name: name.clone(),
            image: self.image.clone(),
            cmd: python_cmd(code),
            env,
        };

        self.runtime
            .create(&spec)
            .await
            .map_err(EngineError::EnvironmentCreateFailed)?;

        // Attach before start so no output is missed.
        let mut stream = match self.runtime.attach(&name).await {
            Ok(stream) => stream,
            Err(err) => {
                self.discard(&name).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.runtime.start(&name).await {
            self.discard(&name).await;
            return Err(EngineError::EnvironmentStartFailed(err));
        }

        let mut output = String::new();
        let drained = drain_into(&mut stream, &mut output);

        if tokio::time::timeout(deadline, drained).await.is_err() {
            warn!("One-shot sandbox {} exceeded its deadline, removing", name);
            self.discard(&name).await;
            return Err(EngineError::Timeout {
                deadline_secs: deadline.as_secs(),
                output,
            });
        }

        let exit_code = match self.runtime.wait(&name).await {
            Ok(code) => code,
            Err(err) => {
                self.discard(&name).await;
                return Err(err.into());
            }
        };

        self.discard(&name).await;
        Ok((output, exit_code))
    }

    pub async fn attach(&self, name: &str) -> Result<LogStream, EngineError> {
        Ok(self.runtime.attach(name).await?)
    }

    pub async fn pause(&self, name: &str) -> Result<(), EngineError> {
        Ok(self.runtime.pause(name).await?)
    }

    pub async fn resume(&self, name: &str) -> Result<(), EngineError> {
        Ok(self.runtime.unpause(name).await?)
    }

    /// Terminate and remove a sandbox. Already-gone counts as success; stop
    /// and removal happen in one step.
    pub async fn remove(&self, name: &str, force: bool) -> Result<(), EngineError> {
        match self.runtime.remove(name, force).await {
            Ok(()) => Ok(()),
            Err(RuntimeError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Best-effort removal used on failure paths and one-shot cleanup.
    pub async fn discard(&self, name: &str) {
        match self.runtime.remove(name, true).await {
            Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
            Err(err) => warn!("Failed to remove sandbox {}: {}", name, err),
        }
    }
}

async fn drain_into(stream: &mut LogStream, output: &mut String) {
    while let Some(chunk) = stream.next().await {
        output.push_str(&chunk.text);
    }
}

fn python_cmd(code: String) -> Vec<String> {
    vec!["python".into(), "-u".into(), "-c".into(), code]
}
