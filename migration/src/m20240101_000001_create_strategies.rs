use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Strategies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Strategies::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Strategies::UserId).uuid().not_null())
                    .col(ColumnDef::new(Strategies::Name).string().not_null())
                    .col(ColumnDef::new(Strategies::Code).text().not_null())
                    .col(ColumnDef::new(Strategies::Broker).string().not_null()) // "dhan", "zerodha", "upstox", "angelone"
                    .col(ColumnDef::new(Strategies::Status).string().not_null().default("Stopped")) // "Stopped", "Running", "Paused"
                    .col(ColumnDef::new(Strategies::SandboxId).text().null())
                    .col(ColumnDef::new(Strategies::CreatedAt).timestamp().default(Expr::cust("CURRENT_TIMESTAMP")))
                    .col(ColumnDef::new(Strategies::UpdatedAt).timestamp().default(Expr::cust("CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP")))
                    .index(
                        Index::create()
                            .name("idx_strategies_user_name")
                            .table(Strategies::Table)
                            .col(Strategies::UserId)
                            .col(Strategies::Name)
                            .unique()
                    )
                    .index(
                        Index::create()
                            .name("idx_strategies_user_status")
                            .table(Strategies::Table)
                            .col(Strategies::UserId)
                            .col(Strategies::Status)
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Strategies::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Strategies {
    Table,
    Id,
    UserId,
    Name,
    Code,
    Broker,
    Status,
    SandboxId,
    CreatedAt,
    UpdatedAt,
}
