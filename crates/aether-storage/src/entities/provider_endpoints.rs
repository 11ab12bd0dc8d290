use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_endpoints")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub api_family: String,
    pub endpoint_kind: String,
    pub base_url: String,
    /// `{enabled, accept_formats, reject_formats, stream_conversion}`.
    pub format_acceptance_config: Option<Json>,
    /// Rewrite directives applied to outbound bodies.
    pub body_rules: Option<Json>,
    pub extra_headers: Option<Json>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
