//! Failure taxonomy for the orchestration core.
//!
//! Failures that happen before any persisted state change surface directly to
//! the caller with the entity untouched; background streaming/finalization
//! failures are recorded into the run record and logged instead.

use shared::models::StrategyStatus;

use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("strategy not found")]
    StrategyNotFound,

    #[error("no broker credentials on file; set your broker credentials first")]
    CredentialsMissing,

    #[error("broker credentials are unusable: {reason}")]
    CredentialsInvalid { reason: String },

    #[error("cannot {action} a strategy that is {state}")]
    InvalidStateTransition {
        state: StrategyStatus,
        action: &'static str,
    },

    #[error("another transition for this strategy is already in flight")]
    Conflict,

    #[error("failed to create sandbox")]
    EnvironmentCreateFailed(#[source] RuntimeError),

    #[error("failed to start sandbox")]
    EnvironmentStartFailed(#[source] RuntimeError),

    /// One-shot deadline exceeded. Carries whatever output the sandbox
    /// produced before it was force-removed.
    #[error("run exceeded its deadline of {deadline_secs}s")]
    Timeout { deadline_secs: u64, output: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
