use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use aether_billing::{
    BillingService, CostBreakdown, DimensionCollectInput, ShadowBillingService,
    normalize_input_tokens_for_billing,
};
use aether_common::{GatewayConfig, GatewayResult, sanitize_error_message};
use aether_storage::entities::{usage, video_tasks};
use aether_storage::{Storage, StorageResult};
use aether_transform::InternalUsage;

use crate::stream::StreamContext;

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Writes and settles usage rows. The only component that persists billing
/// outcomes; the billing crate itself never writes.
pub struct UsageService<'a> {
    storage: &'a dyn Storage,
    config: &'a GatewayConfig,
}

#[derive(Debug, Clone)]
pub struct PendingUsageInput {
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub model: String,
    pub api_format: String,
    pub request_type: String,
    pub is_stream: bool,
}

impl<'a> UsageService<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a GatewayConfig) -> Self {
        Self { storage, config }
    }

    /// Insert a pending row up front so async work is visible immediately.
    pub async fn create_pending(&self, input: PendingUsageInput) -> StorageResult<()> {
        let at = now();
        self.storage
            .insert_usage(usage::Model {
                id: 0,
                request_id: input.request_id,
                user_id: input.user_id,
                api_key_id: input.api_key_id,
                model: input.model,
                api_format: input.api_format,
                request_type: input.request_type,
                is_stream: input.is_stream,
                status: "pending".to_string(),
                status_code: None,
                provider_name: None,
                provider_id: None,
                provider_endpoint_id: None,
                provider_api_key_id: None,
                endpoint_api_format: None,
                input_tokens: 0,
                output_tokens: 0,
                cache_read_input_tokens: 0,
                cache_creation_input_tokens: 0,
                total_cost: 0.0,
                response_time_ms: None,
                error_message: None,
                request_metadata: None,
                created_at: at,
                updated_at: at,
            })
            .await
    }

    /// Stamp provider info onto a pending row once the upstream accepted an
    /// async submit. Cost stays zero until the poller settles the task.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_submitted(
        &self,
        request_id: &str,
        provider_name: &str,
        provider_id: i64,
        endpoint_id: i64,
        key_id: i64,
        endpoint_api_format: &str,
        status_code: u16,
        response_time_ms: i64,
    ) -> StorageResult<()> {
        let Some(mut row) = self.storage.usage_by_request_id(request_id).await? else {
            return Ok(());
        };
        row.provider_name = Some(provider_name.to_string());
        row.provider_id = Some(provider_id);
        row.provider_endpoint_id = Some(endpoint_id);
        row.provider_api_key_id = Some(key_id);
        row.endpoint_api_format = Some(endpoint_api_format.to_string());
        row.status_code = Some(i32::from(status_code));
        row.response_time_ms = Some(response_time_ms);
        row.updated_at = now();
        self.storage.update_usage(row).await
    }

    /// Legacy-engine arithmetic: plain float math over model pricing. Kept
    /// deliberately separate from the decimal engine it reconciles against.
    async fn legacy_breakdown(
        &self,
        model: &str,
        provider_id: Option<i64>,
        usage: InternalUsage,
        is_failed: bool,
    ) -> CostBreakdown {
        let Some(global_model) = self
            .storage
            .global_model(model)
            .await
            .ok()
            .flatten()
        else {
            return CostBreakdown::default();
        };
        let provider_model = match provider_id {
            Some(provider_id) => self
                .storage
                .provider_model(provider_id, global_model.id)
                .await
                .ok()
                .flatten(),
            None => None,
        };

        let price = |path: &str| -> f64 {
            aether_billing::rules::get_nested(provider_model.as_ref().map(|m| &m.config), path)
                .or_else(|| aether_billing::rules::get_nested(Some(&global_model.config), path))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };

        let input_cost = usage.input_tokens as f64 * price("billing.price.input_per_1m") / 1e6;
        let output_cost = usage.output_tokens as f64 * price("billing.price.output_per_1m") / 1e6;
        let cache_read_cost =
            usage.cache_read_tokens as f64 * price("billing.price.cache_read_per_1m") / 1e6;
        let cache_creation_cost = usage.cache_creation_tokens as f64
            * price("billing.price.cache_creation_per_1m")
            / 1e6;
        let request_cost = if is_failed {
            0.0
        } else {
            price("billing.price.per_request")
        };

        CostBreakdown {
            input_cost,
            output_cost,
            cache_creation_cost,
            cache_read_cost,
            request_cost,
            total_cost: input_cost + output_cost + cache_creation_cost + cache_read_cost
                + request_cost,
        }
    }

    /// Settle a finished (or failed) chat/cli request from its stream context.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_chat(
        &self,
        request_id: &str,
        user_id: i64,
        api_key_id: i64,
        task_type: &str,
        ctx: &StreamContext,
        response_time_ms: i64,
    ) -> GatewayResult<()> {
        let is_failed = !ctx.is_success();
        let billing_format = ctx
            .provider_api_format
            .clone()
            .unwrap_or_else(|| ctx.api_format.clone());

        let mut usage = ctx.usage();
        usage.input_tokens = normalize_input_tokens_for_billing(
            Some(billing_format.as_str()),
            usage.input_tokens,
            usage.cache_read_tokens,
        );

        let legacy = self
            .legacy_breakdown(&ctx.model, ctx.provider_id, usage, is_failed)
            .await;

        let provider_label = ctx.provider_name.clone().unwrap_or_default();
        let shadow = ShadowBillingService::new(self.storage, self.config)
            .calculate_with_shadow(
                &provider_label,
                ctx.provider_id,
                &ctx.model,
                task_type,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_tokens,
                usage.cache_read_tokens,
                legacy,
                is_failed,
            )
            .await?;

        let mut metadata = Map::new();
        metadata.insert(
            "billing_shadow".to_string(),
            json!({
                "engine_mode": shadow.engine_mode.as_str(),
                "truth_engine": shadow.truth_engine.as_str(),
                "was_fallback": shadow.was_fallback,
                "comparison": Value::Object(shadow.comparison.clone()),
            }),
        );
        if let Some(snapshot) = &shadow.shadow_snapshot {
            metadata.insert("billing_snapshot".to_string(), snapshot.to_value());
        }

        let at = now();
        let total_cost = shadow.truth_breakdown.total_cost;

        let row = usage::Model {
            id: 0,
            request_id: request_id.to_string(),
            user_id,
            api_key_id,
            model: ctx.model.clone(),
            api_format: ctx.api_format.clone(),
            request_type: task_type.to_string(),
            is_stream: true,
            status: if is_failed { "failed" } else { "completed" }.to_string(),
            status_code: Some(i32::from(ctx.status_code)),
            provider_name: ctx.provider_name.clone(),
            provider_id: ctx.provider_id,
            provider_endpoint_id: ctx.endpoint_id,
            provider_api_key_id: ctx.key_id,
            endpoint_api_format: ctx.provider_api_format.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_tokens,
            cache_creation_input_tokens: usage.cache_creation_tokens,
            total_cost,
            response_time_ms: Some(response_time_ms),
            error_message: ctx
                .error_message
                .as_deref()
                .map(sanitize_error_message),
            request_metadata: Some(Value::Object(metadata)),
            created_at: at,
            updated_at: at,
        };

        if let Err(err) = self.storage.insert_usage(row).await {
            tracing::warn!(request_id, error = %err, "failed to persist usage row");
        }
        Ok(())
    }

    /// Settle a terminal video task through the billing engine and update its
    /// pending usage row. Runs inside the poller's update session.
    pub async fn finalize_video_task(&self, task: &video_tasks::Model) -> GatewayResult<()> {
        let metadata = json!({
            "task": {
                "size": task.resolution,
                "resolution": task.resolution,
                "duration_seconds": task.duration_seconds,
                "video_duration_seconds": task.video_duration_seconds,
            }
        });

        let mut base_dimensions = Map::new();
        let effective_duration = task
            .video_duration_seconds
            .or(task.duration_seconds)
            .unwrap_or(0.0);
        base_dimensions.insert(
            "duration_seconds".to_string(),
            Value::from(effective_duration),
        );
        base_dimensions.insert(
            "request_count".to_string(),
            Value::from(i64::from(task.status == "completed")),
        );

        let billing_format = task
            .provider_api_format
            .clone()
            .unwrap_or_else(|| task.client_api_format.clone());

        let billing = BillingService::new(self.storage, self.config);
        let result = billing
            .calculate_from_response(
                "video",
                &task.model,
                task.provider_id,
                Some(billing_format.as_str()),
                DimensionCollectInput {
                    request: None,
                    response: None,
                    metadata: Some(&metadata),
                    base_dimensions: Some(&base_dimensions),
                },
                None,
            )
            .await?;

        let Some(mut row) = self
            .storage
            .usage_by_request_id(&task.request_id)
            .await
            .ok()
            .flatten()
        else {
            return Ok(());
        };

        let mut row_metadata = row
            .request_metadata
            .take()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        row_metadata.insert("billing_snapshot".to_string(), result.snapshot.to_value());

        row.status = if task.status == "completed" {
            "completed"
        } else {
            "failed"
        }
        .to_string();
        row.total_cost = if task.status == "completed" {
            result.cost
        } else {
            0.0
        };
        row.error_message = task.error_message.as_deref().map(sanitize_error_message);
        row.request_metadata = Some(Value::Object(row_metadata));
        row.updated_at = now();

        if let Err(err) = self.storage.update_usage(row).await {
            tracing::warn!(task_id = %task.id, error = %err, "failed to settle video usage");
        }
        Ok(())
    }
}
