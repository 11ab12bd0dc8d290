use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseBackend, DatabaseConnection, EntityTrait, ExprTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Schema, SqlErr,
};
use time::OffsetDateTime;

use crate::entities;
use crate::entities::{
    api_keys, dimension_collectors, global_models, models, provider_api_keys, provider_endpoints,
    usage, users, video_tasks,
};
use crate::storage::{
    CollectorInput, ProviderBundle, Storage, StorageError, StorageResult,
};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = crate::db::connect_shared(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            use sea_orm::ConnectionTrait;
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn map_insert_err(err: sea_orm::DbErr) -> StorageError {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        StorageError::Conflict("duplicate key".to_string())
    } else {
        StorageError::Db(err)
    }
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::Providers)
            .register(entities::ProviderEndpoints)
            .register(entities::ProviderApiKeys)
            .register(entities::GlobalModels)
            .register(entities::Models)
            .register(entities::VideoTasks)
            .register(entities::Usage)
            .register(entities::DimensionCollectors)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn find_user_key(
        &self,
        api_key: &str,
    ) -> StorageResult<Option<(users::Model, api_keys::Model)>> {
        let Some(key) = entities::ApiKeys::find()
            .filter(api_keys::Column::Key.eq(api_key))
            .filter(api_keys::Column::IsActive.eq(true))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let Some(user) = entities::Users::find_by_id(key.user_id)
            .filter(users::Column::IsActive.eq(true))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((user, key)))
    }

    async fn load_provider_bundles(&self) -> StorageResult<Vec<ProviderBundle>> {
        let providers = entities::Providers::find()
            .filter(crate::entities::providers::Column::IsActive.eq(true))
            .order_by_asc(crate::entities::providers::Column::Id)
            .all(&self.db)
            .await?;

        let mut bundles = Vec::with_capacity(providers.len());
        for provider in providers {
            let endpoints = entities::ProviderEndpoints::find()
                .filter(provider_endpoints::Column::ProviderId.eq(provider.id))
                .filter(provider_endpoints::Column::IsActive.eq(true))
                .order_by_asc(provider_endpoints::Column::Id)
                .all(&self.db)
                .await?;
            let keys = entities::ProviderApiKeys::find()
                .filter(provider_api_keys::Column::ProviderId.eq(provider.id))
                .filter(provider_api_keys::Column::IsActive.eq(true))
                .order_by_asc(provider_api_keys::Column::InternalPriority)
                .all(&self.db)
                .await?;
            bundles.push(ProviderBundle {
                provider,
                endpoints,
                keys,
            });
        }
        Ok(bundles)
    }

    async fn provider_endpoint(
        &self,
        id: i64,
    ) -> StorageResult<Option<provider_endpoints::Model>> {
        Ok(entities::ProviderEndpoints::find_by_id(id).one(&self.db).await?)
    }

    async fn provider_api_key(
        &self,
        id: i64,
    ) -> StorageResult<Option<provider_api_keys::Model>> {
        Ok(entities::ProviderApiKeys::find_by_id(id).one(&self.db).await?)
    }

    async fn global_model(&self, name: &str) -> StorageResult<Option<global_models::Model>> {
        Ok(entities::GlobalModels::find()
            .filter(global_models::Column::Name.eq(name))
            .filter(global_models::Column::IsActive.eq(true))
            .one(&self.db)
            .await?)
    }

    async fn provider_model(
        &self,
        provider_id: i64,
        global_model_id: i64,
    ) -> StorageResult<Option<models::Model>> {
        Ok(entities::Models::find()
            .filter(models::Column::ProviderId.eq(provider_id))
            .filter(models::Column::GlobalModelId.eq(global_model_id))
            .filter(models::Column::IsActive.eq(true))
            .one(&self.db)
            .await?)
    }

    async fn enabled_collectors(
        &self,
        api_format: &str,
        task_type: &str,
    ) -> StorageResult<Vec<dimension_collectors::Model>> {
        Ok(entities::DimensionCollectors::find()
            .filter(dimension_collectors::Column::ApiFormat.eq(api_format))
            .filter(dimension_collectors::Column::TaskType.eq(task_type))
            .filter(dimension_collectors::Column::IsEnabled.eq(true))
            .order_by_desc(dimension_collectors::Column::Priority)
            .all(&self.db)
            .await?)
    }

    async fn find_collector(
        &self,
        api_format: &str,
        task_type: &str,
        dimension_name: &str,
        priority: i32,
    ) -> StorageResult<Option<dimension_collectors::Model>> {
        Ok(entities::DimensionCollectors::find()
            .filter(dimension_collectors::Column::ApiFormat.eq(api_format))
            .filter(dimension_collectors::Column::TaskType.eq(task_type))
            .filter(dimension_collectors::Column::DimensionName.eq(dimension_name))
            .filter(dimension_collectors::Column::Priority.eq(priority))
            .one(&self.db)
            .await?)
    }

    async fn insert_collector(&self, input: CollectorInput) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let row = dimension_collectors::ActiveModel {
            api_format: sea_orm::ActiveValue::Set(input.api_format),
            task_type: sea_orm::ActiveValue::Set(input.task_type),
            dimension_name: sea_orm::ActiveValue::Set(input.dimension_name),
            source_type: sea_orm::ActiveValue::Set(input.source_type),
            source_path: sea_orm::ActiveValue::Set(input.source_path),
            value_type: sea_orm::ActiveValue::Set(input.value_type),
            transform_expression: sea_orm::ActiveValue::Set(input.transform_expression),
            default_value: sea_orm::ActiveValue::Set(input.default_value),
            priority: sea_orm::ActiveValue::Set(input.priority),
            is_enabled: sea_orm::ActiveValue::Set(input.is_enabled),
            created_at: sea_orm::ActiveValue::Set(now),
            updated_at: sea_orm::ActiveValue::Set(now),
            ..Default::default()
        };
        row.insert(&self.db).await.map_err(map_insert_err)?;
        Ok(())
    }

    async fn update_collector(&self, id: i64, input: CollectorInput) -> StorageResult<()> {
        let Some(existing) = entities::DimensionCollectors::find_by_id(id).one(&self.db).await?
        else {
            return Err(StorageError::NotFound("dimension_collector"));
        };
        let mut row = existing.into_active_model();
        row.source_type = sea_orm::ActiveValue::Set(input.source_type);
        row.source_path = sea_orm::ActiveValue::Set(input.source_path);
        row.value_type = sea_orm::ActiveValue::Set(input.value_type);
        row.transform_expression = sea_orm::ActiveValue::Set(input.transform_expression);
        row.default_value = sea_orm::ActiveValue::Set(input.default_value);
        row.is_enabled = sea_orm::ActiveValue::Set(input.is_enabled);
        row.updated_at = sea_orm::ActiveValue::Set(OffsetDateTime::now_utc());
        row.update(&self.db).await?;
        Ok(())
    }

    async fn insert_video_task(&self, task: video_tasks::Model) -> StorageResult<()> {
        let row = task.into_active_model().reset_all();
        row.insert(&self.db).await.map_err(map_insert_err)?;
        Ok(())
    }

    async fn video_task(&self, id: &str) -> StorageResult<Option<video_tasks::Model>> {
        Ok(entities::VideoTasks::find_by_id(id).one(&self.db).await?)
    }

    async fn video_task_by_short_id(
        &self,
        short_id: &str,
        user_id: i64,
    ) -> StorageResult<Option<video_tasks::Model>> {
        Ok(entities::VideoTasks::find()
            .filter(video_tasks::Column::ShortId.eq(short_id))
            .filter(video_tasks::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?)
    }

    async fn list_video_tasks(
        &self,
        user_id: i64,
        limit: u64,
    ) -> StorageResult<Vec<video_tasks::Model>> {
        Ok(entities::VideoTasks::find()
            .filter(video_tasks::Column::UserId.eq(user_id))
            .order_by_desc(video_tasks::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn due_video_task_ids(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> StorageResult<Vec<String>> {
        let rows = entities::VideoTasks::find()
            .filter(
                video_tasks::Column::Status
                    .is_in(["submitted", "queued", "processing"]),
            )
            .filter(video_tasks::Column::NextPollAt.lte(now))
            .filter(
                sea_orm::sea_query::Expr::col(video_tasks::Column::PollCount)
                    .lt(sea_orm::sea_query::Expr::col(video_tasks::Column::MaxPollCount)),
            )
            .order_by_asc(video_tasks::Column::NextPollAt)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|t| t.id).collect())
    }

    async fn update_video_task(&self, task: video_tasks::Model) -> StorageResult<()> {
        let row = task.into_active_model().reset_all();
        row.update(&self.db).await?;
        Ok(())
    }

    async fn insert_usage(&self, row: usage::Model) -> StorageResult<()> {
        let mut active = row.into_active_model().reset_all();
        // Autoincrement key: the caller leaves id at 0.
        active.id = sea_orm::ActiveValue::NotSet;
        active.insert(&self.db).await.map_err(map_insert_err)?;
        Ok(())
    }

    async fn usage_by_request_id(
        &self,
        request_id: &str,
    ) -> StorageResult<Option<usage::Model>> {
        Ok(entities::Usage::find()
            .filter(usage::Column::RequestId.eq(request_id))
            .one(&self.db)
            .await?)
    }

    async fn update_usage(&self, row: usage::Model) -> StorageResult<()> {
        let active = row.into_active_model().reset_all();
        active.update(&self.db).await?;
        Ok(())
    }
}
