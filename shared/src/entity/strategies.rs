//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "strategies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[sea_orm(column_type = "Text")]
    pub code: String,
    pub broker: String, // "dhan", "zerodha", "upstox", "angelone"
    pub status: String, // "Stopped", "Running", "Paused"
    #[sea_orm(column_type = "Text", nullable)]
    pub sandbox_id: Option<String>, // set iff status != Stopped
    pub created_at: Option<DateTimeUtc>,
    pub updated_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::strategy_runs::Entity")]
    StrategyRuns,
}

impl Related<super::strategy_runs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StrategyRuns.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
