use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Data-driven extraction rule for one billing dimension.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dimension_collectors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub api_format: String,
    pub task_type: String,
    pub dimension_name: String,
    /// request | response | metadata | computed
    pub source_type: String,
    pub source_path: Option<String>,
    /// int | float | string
    pub value_type: String,
    pub transform_expression: Option<String>,
    pub default_value: Option<String>,
    pub priority: i32,
    pub is_enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
