pub mod config;
pub mod database;
pub mod entity;
pub mod models;
pub mod templates;

pub use config::Config;
pub use database::get_db_connection;
pub use models::{BrokerKind, CredentialBundle, RunStatus, StrategyStatus};
pub use templates::render_strategy;
