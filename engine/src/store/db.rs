//! SeaORM-backed stores over the `strategies` and `strategy_runs` tables.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder,
};
use shared::entity::{strategies, strategy_runs};
use shared::models::{BrokerKind, RunStatus, StrategyStatus};
use uuid::Uuid;

use super::{NewRunRecord, RunOutcome, RunRecord, RunStore, StrategyRecord, StrategyStore};

pub struct DbStrategyStore {
    db: Arc<DatabaseConnection>,
}

impl DbStrategyStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl StrategyStore for DbStrategyStore {
    async fn fetch(
        &self,
        user_id: Uuid,
        strategy_id: Uuid,
    ) -> Result<Option<StrategyRecord>> {
        let found = strategies::Entity::find_by_id(strategy_id)
            .filter(strategies::Column::UserId.eq(user_id))
            .one(self.db.as_ref())
            .await
            .context("Failed to fetch strategy")?;

        found.map(record_from_model).transpose()
    }

    async fn update_execution_state(
        &self,
        strategy_id: Uuid,
        status: StrategyStatus,
        sandbox_id: Option<String>,
    ) -> Result<()> {
        let active = strategies::ActiveModel {
            id: Set(strategy_id),
            status: Set(status.as_str().to_owned()),
            sandbox_id: Set(sandbox_id),
            ..Default::default()
        };
        active
            .update(self.db.as_ref())
            .await
            .context("Failed to persist strategy transition")?;
        Ok(())
    }
}

fn record_from_model(model: strategies::Model) -> Result<StrategyRecord> {
    Ok(StrategyRecord {
        id: model.id,
        user_id: model.user_id,
        name: model.name,
        code: model.code,
        broker: BrokerKind::from_str(&model.broker)?,
        status: StrategyStatus::from_str(&model.status)?,
        sandbox_id: model.sandbox_id,
    })
}

pub struct DbRunStore {
    db: Arc<DatabaseConnection>,
}

impl DbRunStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl RunStore for DbRunStore {
    async fn create(&self, record: NewRunRecord) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let active = strategy_runs::ActiveModel {
            id: Set(run_id),
            user_id: Set(record.user_id),
            strategy_id: Set(record.strategy_id),
            strategy_name: Set(record.strategy_name),
            broker: Set(record.broker.as_str().to_owned()),
            terminal_output: Set(String::new()),
            status: Set(RunStatus::Running.as_str().to_owned()),
            created_at: Set(Some(Utc::now())),
            ..Default::default()
        };
        active
            .insert(self.db.as_ref())
            .await
            .context("Failed to create run record")?;
        Ok(run_id)
    }

    async fn finalize(&self, run_id: Uuid, outcome: RunOutcome) -> Result<bool> {
        let existing = strategy_runs::Entity::find_by_id(run_id)
            .one(self.db.as_ref())
            .await
            .context("Failed to load run record")?;

        let Some(existing) = existing else {
            return Ok(false);
        };
        if existing.status != RunStatus::Running.as_str() {
            return Ok(false);
        }

        let execution_ms = existing
            .created_at
            .map(|started| (outcome.stopped_at - started).num_milliseconds());

        // Conditional on status so a concurrent finalizer cannot clobber a
        // terminal record.
        let result = strategy_runs::Entity::update_many()
            .col_expr(
                strategy_runs::Column::Status,
                Expr::value(outcome.status.as_str()),
            )
            .col_expr(
                strategy_runs::Column::TerminalOutput,
                Expr::value(outcome.output),
            )
            .col_expr(
                strategy_runs::Column::ErrorMessage,
                Expr::value(outcome.error_message),
            )
            .col_expr(
                strategy_runs::Column::StopTime,
                Expr::value(outcome.stopped_at),
            )
            .col_expr(
                strategy_runs::Column::ExecutionMs,
                Expr::value(execution_ms),
            )
            .filter(strategy_runs::Column::Id.eq(run_id))
            .filter(strategy_runs::Column::Status.eq(RunStatus::Running.as_str()))
            .exec(self.db.as_ref())
            .await
            .context("Failed to finalize run record")?;

        Ok(result.rows_affected > 0)
    }

    async fn finalize_open(&self, strategy_id: Uuid, outcome: RunOutcome) -> Result<bool> {
        let open = strategy_runs::Entity::find()
            .filter(strategy_runs::Column::StrategyId.eq(strategy_id))
            .filter(strategy_runs::Column::Status.eq(RunStatus::Running.as_str()))
            .order_by_desc(strategy_runs::Column::CreatedAt)
            .one(self.db.as_ref())
            .await
            .context("Failed to look up open run")?;

        match open {
            Some(row) => self.finalize(row.id, outcome).await,
            None => Ok(false),
        }
    }

    async fn list_for_strategy(
        &self,
        strategy_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<RunRecord>> {
        let rows = strategy_runs::Entity::find()
            .filter(strategy_runs::Column::StrategyId.eq(strategy_id))
            .order_by_desc(strategy_runs::Column::CreatedAt)
            .paginate(self.db.as_ref(), per_page)
            .fetch_page(page)
            .await
            .context("Failed to list runs for strategy")?;

        rows.into_iter().map(run_from_model).collect()
    }

    async fn list_for_owner(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<Vec<RunRecord>> {
        let rows = strategy_runs::Entity::find()
            .filter(strategy_runs::Column::UserId.eq(user_id))
            .order_by_desc(strategy_runs::Column::CreatedAt)
            .paginate(self.db.as_ref(), per_page)
            .fetch_page(page)
            .await
            .context("Failed to list runs for owner")?;

        rows.into_iter().map(run_from_model).collect()
    }
}

fn run_from_model(model: strategy_runs::Model) -> Result<RunRecord> {
    Ok(RunRecord {
        id: model.id,
        user_id: model.user_id,
        strategy_id: model.strategy_id,
        strategy_name: model.strategy_name,
        broker: BrokerKind::from_str(&model.broker)?,
        terminal_output: model.terminal_output,
        status: RunStatus::from_str(&model.status)?,
        execution_ms: model.execution_ms,
        error_message: model.error_message,
        started_at: model.created_at.unwrap_or_else(Utc::now),
        stopped_at: model.stop_time,
    })
}
