//! Persistence seams consumed by the orchestrator.
//!
//! The strategy and run stores have SeaORM implementations in [`db`]; the
//! credential store stays a trait only — decrypting stored credentials is the
//! collaborator's concern, this core merely requires a resolvable bundle.

use chrono::{DateTime, Utc};
use shared::models::{BrokerKind, CredentialBundle, RunStatus, StrategyStatus};
use uuid::Uuid;

pub mod db;

pub use db::{DbRunStore, DbStrategyStore};

/// Snapshot of a strategy as the orchestrator sees it.
#[derive(Debug, Clone)]
pub struct StrategyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub code: String,
    pub broker: BrokerKind,
    pub status: StrategyStatus,
    pub sandbox_id: Option<String>,
}

#[async_trait::async_trait]
pub trait StrategyStore: Send + Sync {
    async fn fetch(
        &self,
        user_id: Uuid,
        strategy_id: Uuid,
    ) -> anyhow::Result<Option<StrategyRecord>>;

    /// Persist a transition. Callers write this only after the corresponding
    /// environment-manager call has succeeded.
    async fn update_execution_state(
        &self,
        strategy_id: Uuid,
        status: StrategyStatus,
        sandbox_id: Option<String>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credentials stored for this broker")]
    NotFound,

    #[error("stored credentials could not be decrypted")]
    DecryptionFailed,

    #[error("stored credentials are empty")]
    Empty,
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve the decrypted bundle for (owner, broker).
    async fn resolve(
        &self,
        user_id: Uuid,
        broker: BrokerKind,
    ) -> Result<CredentialBundle, CredentialError>;
}

/// Fields a run record needs at creation time; everything else is filled in
/// at finalization.
#[derive(Debug, Clone)]
pub struct NewRunRecord {
    pub user_id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub strategy_name: String,
    pub broker: BrokerKind,
}

/// Finalization payload for a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error_message: Option<String>,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub strategy_name: String,
    pub broker: BrokerKind,
    pub terminal_output: String,
    pub status: RunStatus,
    pub execution_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// One record per execution attempt. Finalization is conditional: only a
/// record still `running` can be finalized, so the explicit-stop path and the
/// capture task can race without clobbering each other.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, record: NewRunRecord) -> anyhow::Result<Uuid>;

    /// Finalize a run if it is still running. Returns whether this call won
    /// the write.
    async fn finalize(&self, run_id: Uuid, outcome: RunOutcome) -> anyhow::Result<bool>;

    /// Finalize the open run of a strategy, if any.
    async fn finalize_open(&self, strategy_id: Uuid, outcome: RunOutcome) -> anyhow::Result<bool>;

    /// Runs for one strategy, newest first. Pages are zero-based.
    async fn list_for_strategy(
        &self,
        strategy_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<Vec<RunRecord>>;

    /// All runs of an owner across strategies, newest first.
    async fn list_for_owner(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> anyhow::Result<Vec<RunRecord>>;
}
