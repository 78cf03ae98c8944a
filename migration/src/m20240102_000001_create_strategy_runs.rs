use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StrategyRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(StrategyRuns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(StrategyRuns::UserId).uuid().not_null())
                    .col(ColumnDef::new(StrategyRuns::StrategyId).uuid().null()) // null for ad-hoc runs
                    .col(ColumnDef::new(StrategyRuns::StrategyName).string().not_null())
                    .col(ColumnDef::new(StrategyRuns::Broker).string().not_null())
                    .col(ColumnDef::new(StrategyRuns::TerminalOutput).text().not_null())
                    .col(ColumnDef::new(StrategyRuns::Status).string().not_null()) // "running", "success", "error", "stopped"
                    .col(ColumnDef::new(StrategyRuns::ExecutionMs).big_integer().null())
                    .col(ColumnDef::new(StrategyRuns::StopTime).timestamp().null())
                    .col(ColumnDef::new(StrategyRuns::ErrorMessage).text().null())
                    .col(ColumnDef::new(StrategyRuns::CreatedAt).timestamp().default(Expr::cust("CURRENT_TIMESTAMP")))
                    .col(ColumnDef::new(StrategyRuns::UpdatedAt).timestamp().default(Expr::cust("CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP")))
                    .index(
                        Index::create()
                            .name("idx_strategy_runs_user_created")
                            .table(StrategyRuns::Table)
                            .col(StrategyRuns::UserId)
                            .col(StrategyRuns::CreatedAt)
                    )
                    .index(
                        Index::create()
                            .name("idx_strategy_runs_strategy_created")
                            .table(StrategyRuns::Table)
                            .col(StrategyRuns::StrategyId)
                            .col(StrategyRuns::CreatedAt)
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_strategy_runs_strategy")
                            .from(StrategyRuns::Table, StrategyRuns::StrategyId)
                            .to(Strategies::Table, Strategies::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StrategyRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum StrategyRuns {
    Table,
    Id,
    UserId,
    StrategyId,
    StrategyName,
    Broker,
    TerminalOutput,
    Status,
    ExecutionMs,
    StopTime,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Strategies {
    Table,
    Id,
}
