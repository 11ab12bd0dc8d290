use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_request_id")]
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub model: String,
    pub api_format: String,
    pub request_type: String,
    pub is_stream: bool,
    /// pending | completed | failed
    pub status: String,
    pub status_code: Option<i32>,
    pub provider_name: Option<String>,
    pub provider_id: Option<i64>,
    pub provider_endpoint_id: Option<i64>,
    pub provider_api_key_id: Option<i64>,
    pub endpoint_api_format: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub total_cost: f64,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    /// Carries `billing_snapshot` and `billing_shadow` audit payloads.
    pub request_metadata: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
