//! Container runtime seam.
//!
//! The orchestration core drives these primitives; the engine behind them
//! (Docker) is consumed, not reimplemented. Keeping the seam object-safe lets
//! the tests script a fake runtime without a daemon.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;

pub mod docker;

pub use docker::DockerRuntime;

/// Which half of the combined sandbox stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
}

/// One demultiplexed piece of sandbox output, in emission order.
#[derive(Debug, Clone, Serialize)]
pub struct LogChunk {
    pub timestamp: DateTime<Utc>,
    pub channel: LogChannel,
    pub text: String,
}

/// Everything needed to create a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
}

/// Ordered stream of a sandbox's combined stdout+stderr. Ends when the
/// sandbox exits or is removed.
pub type LogStream = Pin<Box<dyn Stream<Item = LogChunk> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such sandbox: {name}")]
    NotFound { name: String },

    #[error("container runtime error: {reason}")]
    Api { reason: String },
}

/// Primitive operations of the sandbox engine. All calls are awaited by the
/// caller; `attach` hands back a long-lived stream read by a background task.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a sandbox and return its runtime-assigned id. Fails if a
    /// sandbox with the same name already exists.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn pause(&self, name: &str) -> Result<(), RuntimeError>;

    async fn unpause(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    /// Block until the sandbox is no longer running, returning its exit code.
    async fn wait(&self, name: &str) -> Result<i64, RuntimeError>;

    async fn attach(&self, name: &str) -> Result<LogStream, RuntimeError>;
}
