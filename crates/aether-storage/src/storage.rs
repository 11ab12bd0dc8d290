use async_trait::async_trait;
use time::OffsetDateTime;

use crate::entities::{
    api_keys, dimension_collectors, global_models, models, provider_api_keys, provider_endpoints,
    providers, usage, users, video_tasks,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(&'static str),
}

/// One provider with its active endpoints and credentials, as the scheduler
/// consumes it.
#[derive(Debug, Clone)]
pub struct ProviderBundle {
    pub provider: providers::Model,
    pub endpoints: Vec<provider_endpoints::Model>,
    pub keys: Vec<provider_api_keys::Model>,
}

#[derive(Debug, Clone)]
pub struct CollectorInput {
    pub api_format: String,
    pub task_type: String,
    pub dimension_name: String,
    pub source_type: String,
    pub source_path: Option<String>,
    pub value_type: String,
    pub transform_expression: Option<String>,
    pub default_value: Option<String>,
    pub priority: i32,
    pub is_enabled: bool,
}

/// Persistence seam for the gateway.
///
/// The request path touches storage at the edges only (auth, usage insert and
/// finalize); streaming never holds a connection. The poller follows the
/// prepare/HTTP/update discipline with short-lived calls on both sides.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync; idempotent, safe to run at every bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    // -- auth --
    async fn find_user_key(
        &self,
        api_key: &str,
    ) -> StorageResult<Option<(users::Model, api_keys::Model)>>;

    // -- scheduling --
    async fn load_provider_bundles(&self) -> StorageResult<Vec<ProviderBundle>>;
    async fn provider_endpoint(&self, id: i64)
    -> StorageResult<Option<provider_endpoints::Model>>;
    async fn provider_api_key(&self, id: i64)
    -> StorageResult<Option<provider_api_keys::Model>>;

    // -- models / billing config --
    async fn global_model(&self, name: &str) -> StorageResult<Option<global_models::Model>>;
    async fn provider_model(
        &self,
        provider_id: i64,
        global_model_id: i64,
    ) -> StorageResult<Option<models::Model>>;

    // -- dimension collectors --
    async fn enabled_collectors(
        &self,
        api_format: &str,
        task_type: &str,
    ) -> StorageResult<Vec<dimension_collectors::Model>>;
    async fn find_collector(
        &self,
        api_format: &str,
        task_type: &str,
        dimension_name: &str,
        priority: i32,
    ) -> StorageResult<Option<dimension_collectors::Model>>;
    async fn insert_collector(&self, input: CollectorInput) -> StorageResult<()>;
    async fn update_collector(&self, id: i64, input: CollectorInput) -> StorageResult<()>;

    // -- video tasks --
    /// Fails with `Conflict` when the upstream id was already recorded.
    async fn insert_video_task(&self, task: video_tasks::Model) -> StorageResult<()>;
    async fn video_task(&self, id: &str) -> StorageResult<Option<video_tasks::Model>>;
    async fn video_task_by_short_id(
        &self,
        short_id: &str,
        user_id: i64,
    ) -> StorageResult<Option<video_tasks::Model>>;
    async fn list_video_tasks(
        &self,
        user_id: i64,
        limit: u64,
    ) -> StorageResult<Vec<video_tasks::Model>>;
    /// Ids of pollable tasks due at `now`, ordered by `next_poll_at`.
    async fn due_video_task_ids(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> StorageResult<Vec<String>>;
    async fn update_video_task(&self, task: video_tasks::Model) -> StorageResult<()>;

    // -- usage --
    async fn insert_usage(&self, row: usage::Model) -> StorageResult<()>;
    async fn usage_by_request_id(&self, request_id: &str)
    -> StorageResult<Option<usage::Model>>;
    async fn update_usage(&self, row: usage::Model) -> StorageResult<()>;
}
