use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Provider-scoped model row; `config` overrides the global model's pricing.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub global_model_id: i64,
    pub provider_id: i64,
    pub config: Json,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
