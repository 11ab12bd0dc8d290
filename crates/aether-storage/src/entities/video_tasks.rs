use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "video_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique_key = "video_task_short_id")]
    pub short_id: String,
    pub request_id: String,
    /// Upstream id (`operations/...` for Gemini, a job id for OpenAI).
    /// Never exposed to clients.
    #[sea_orm(unique_key = "video_task_external_id")]
    pub external_task_id: Option<String>,
    pub user_id: i64,
    pub api_key_id: i64,
    pub provider_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub key_id: Option<i64>,
    pub client_api_format: String,
    pub provider_api_format: Option<String>,
    pub format_converted: bool,
    pub model: String,
    pub prompt: String,
    pub original_request_body: Option<Json>,
    pub converted_request_body: Option<Json>,
    pub duration_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub aspect_ratio: Option<String>,
    pub status: String,
    pub progress_percent: i32,
    pub progress_message: Option<String>,
    pub poll_interval_seconds: i64,
    pub next_poll_at: Option<OffsetDateTime>,
    pub poll_count: i32,
    pub max_poll_count: i32,
    pub retry_count: i32,
    pub video_url: Option<String>,
    pub video_urls: Option<Json>,
    pub video_expires_at: Option<OffsetDateTime>,
    pub video_duration_seconds: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Candidate keys, frozen billing rule, sanitized request headers,
    /// raw poll payloads.
    pub request_metadata: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub submitted_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
