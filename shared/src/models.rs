use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Brokers a strategy can trade through. The discriminator decides which
/// client preamble the template engine renders and which credential shape
/// the bundle carries; the broker REST APIs themselves live elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Dhan,
    Zerodha,
    Upstox,
    AngelOne,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Dhan => "dhan",
            BrokerKind::Zerodha => "zerodha",
            BrokerKind::Upstox => "upstox",
            BrokerKind::AngelOne => "angelone",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhan" => Ok(BrokerKind::Dhan),
            "zerodha" => Ok(BrokerKind::Zerodha),
            "upstox" => Ok(BrokerKind::Upstox),
            "angelone" => Ok(BrokerKind::AngelOne),
            other => Err(anyhow::anyhow!("unknown broker: {}", other)),
        }
    }
}

/// Lifecycle state of a strategy. A strategy holds a sandbox id exactly
/// while it is not Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Stopped,
    Running,
    Paused,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Stopped => "Stopped",
            StrategyStatus::Running => "Running",
            StrategyStatus::Paused => "Paused",
        }
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Stopped" => Ok(StrategyStatus::Stopped),
            "Running" => Ok(StrategyStatus::Running),
            "Paused" => Ok(StrategyStatus::Paused),
            other => Err(anyhow::anyhow!("unknown strategy status: {}", other)),
        }
    }
}

/// Terminal and in-flight states of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(anyhow::anyhow!("unknown run status: {}", other)),
        }
    }
}

/// Decrypted broker login material. Lives only for the duration of a single
/// start or run-once call and travels into the sandbox as environment
/// variables, never as source text.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub client_id: String,
    pub access_token: String,
    pub broker: BrokerKind,
}

impl CredentialBundle {
    pub fn is_empty(&self) -> bool {
        self.client_id.trim().is_empty() || self.access_token.trim().is_empty()
    }

    /// Environment entries in `KEY=value` form, ready for a container spec.
    pub fn env_vars(&self) -> Vec<String> {
        vec![
            format!("ALGORUN_CLIENT_ID={}", self.client_id),
            format!("ALGORUN_ACCESS_TOKEN={}", self.access_token),
            format!("ALGORUN_BROKER={}", self.broker),
        ]
    }
}
