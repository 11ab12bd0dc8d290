use async_trait::async_trait;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

use aether_billing::{
    BillingService, BillingStatus, CostBreakdown, EngineMode, ShadowBillingService,
};
use aether_common::GatewayConfig;
use aether_storage::entities::{
    api_keys, dimension_collectors, global_models, models, provider_api_keys, provider_endpoints,
    usage, users, video_tasks,
};
use aether_storage::{CollectorInput, ProviderBundle, Storage, StorageResult};

/// Minimal in-memory storage: one global model with pricing, nothing else.
struct StubStorage {
    global_model: Option<global_models::Model>,
}

impl StubStorage {
    fn with_pricing(config: Value) -> Self {
        Self {
            global_model: Some(global_models::Model {
                id: 1,
                name: "gpt-4o".to_string(),
                config,
                is_active: true,
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            }),
        }
    }
}

#[async_trait]
impl Storage for StubStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn find_user_key(
        &self,
        _api_key: &str,
    ) -> StorageResult<Option<(users::Model, api_keys::Model)>> {
        Ok(None)
    }

    async fn load_provider_bundles(&self) -> StorageResult<Vec<ProviderBundle>> {
        Ok(Vec::new())
    }

    async fn provider_endpoint(
        &self,
        _id: i64,
    ) -> StorageResult<Option<provider_endpoints::Model>> {
        Ok(None)
    }

    async fn provider_api_key(
        &self,
        _id: i64,
    ) -> StorageResult<Option<provider_api_keys::Model>> {
        Ok(None)
    }

    async fn global_model(&self, name: &str) -> StorageResult<Option<global_models::Model>> {
        Ok(self
            .global_model
            .as_ref()
            .filter(|m| m.name == name)
            .cloned())
    }

    async fn provider_model(
        &self,
        _provider_id: i64,
        _global_model_id: i64,
    ) -> StorageResult<Option<models::Model>> {
        Ok(None)
    }

    async fn enabled_collectors(
        &self,
        _api_format: &str,
        _task_type: &str,
    ) -> StorageResult<Vec<dimension_collectors::Model>> {
        Ok(Vec::new())
    }

    async fn find_collector(
        &self,
        _api_format: &str,
        _task_type: &str,
        _dimension_name: &str,
        _priority: i32,
    ) -> StorageResult<Option<dimension_collectors::Model>> {
        Ok(None)
    }

    async fn insert_collector(&self, _input: CollectorInput) -> StorageResult<()> {
        Ok(())
    }

    async fn update_collector(&self, _id: i64, _input: CollectorInput) -> StorageResult<()> {
        Ok(())
    }

    async fn insert_video_task(&self, _task: video_tasks::Model) -> StorageResult<()> {
        Ok(())
    }

    async fn video_task(&self, _id: &str) -> StorageResult<Option<video_tasks::Model>> {
        Ok(None)
    }

    async fn video_task_by_short_id(
        &self,
        _short_id: &str,
        _user_id: i64,
    ) -> StorageResult<Option<video_tasks::Model>> {
        Ok(None)
    }

    async fn list_video_tasks(
        &self,
        _user_id: i64,
        _limit: u64,
    ) -> StorageResult<Vec<video_tasks::Model>> {
        Ok(Vec::new())
    }

    async fn due_video_task_ids(
        &self,
        _now: OffsetDateTime,
        _limit: u64,
    ) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn update_video_task(&self, _task: video_tasks::Model) -> StorageResult<()> {
        Ok(())
    }

    async fn insert_usage(&self, _row: usage::Model) -> StorageResult<()> {
        Ok(())
    }

    async fn usage_by_request_id(
        &self,
        _request_id: &str,
    ) -> StorageResult<Option<usage::Model>> {
        Ok(None)
    }

    async fn update_usage(&self, _row: usage::Model) -> StorageResult<()> {
        Ok(())
    }
}

fn pricing() -> Value {
    json!({"billing": {"price": {"input_per_1m": 3.0, "output_per_1m": 15.0}}})
}

fn legacy(total: f64) -> CostBreakdown {
    CostBreakdown {
        input_cost: total,
        total_cost: total,
        ..Default::default()
    }
}

#[tokio::test]
async fn legacy_mode_skips_new_engine_and_keeps_truth() {
    aether_billing::invalidate_all();
    let storage = StubStorage { global_model: None };
    let config = GatewayConfig {
        billing_engine: "legacy".to_string(),
        ..Default::default()
    };

    let service = ShadowBillingService::new(&storage, &config);
    let result = service
        .calculate_with_shadow(
            "openai",
            Some(1),
            "gpt-4o",
            "chat",
            1,
            1,
            0,
            0,
            legacy(0.3),
            false,
        )
        .await
        .unwrap();

    assert_eq!(result.engine_mode, EngineMode::Legacy);
    assert_eq!(result.truth_engine.as_str(), "legacy");
    assert!(result.shadow_snapshot.is_none());
    assert!((result.truth_breakdown.total_cost - 0.3).abs() < f64::EPSILON);
}

#[tokio::test]
async fn shadow_mode_records_snapshot_and_diff_but_keeps_legacy_truth() {
    aether_billing::invalidate_all();
    let storage = StubStorage::with_pricing(pricing());
    let config = GatewayConfig {
        billing_engine: "shadow".to_string(),
        ..Default::default()
    };

    // Legacy says 0.004; new engine prices 1M input tokens at 3.0 => 3.0.
    let service = ShadowBillingService::new(&storage, &config);
    let result = service
        .calculate_with_shadow(
            "openai",
            Some(1),
            "gpt-4o",
            "chat",
            1_000_000,
            0,
            0,
            0,
            legacy(0.004),
            false,
        )
        .await
        .unwrap();

    assert_eq!(result.engine_mode, EngineMode::Shadow);
    assert_eq!(result.truth_engine.as_str(), "legacy");
    assert!((result.truth_breakdown.total_cost - 0.004).abs() < f64::EPSILON);
    let snapshot = result.shadow_snapshot.expect("snapshot in shadow mode");
    assert_eq!(snapshot.status, BillingStatus::Complete);
    assert!(result.comparison.contains_key("diff_usd"));
    let diff = result.comparison["diff_usd"].as_f64().unwrap();
    assert!(diff > config.billing_diff_threshold_usd);
}

#[tokio::test]
async fn new_with_fallback_reverts_to_legacy_on_large_diff() {
    aether_billing::invalidate_all();
    let storage = StubStorage::with_pricing(pricing());
    let config = GatewayConfig {
        billing_engine: "new_with_fallback".to_string(),
        ..Default::default()
    };

    let service = ShadowBillingService::new(&storage, &config);
    let result = service
        .calculate_with_shadow(
            "openai",
            Some(1),
            "gpt-4o",
            "chat",
            1_000_000,
            0,
            0,
            0,
            legacy(0.004),
            false,
        )
        .await
        .unwrap();

    // |3.0 - 0.004| is far beyond 10x the default threshold.
    assert!(result.was_fallback);
    assert_eq!(result.truth_engine.as_str(), "legacy");
    assert!((result.truth_breakdown.total_cost - 0.004).abs() < f64::EPSILON);
}

#[tokio::test]
async fn snapshot_invariant_total_equals_component_sum() {
    aether_billing::invalidate_all();
    let storage = StubStorage::with_pricing(pricing());
    let config = GatewayConfig::default();
    let service = BillingService::new(&storage, &config);

    let mut dims = Map::new();
    dims.insert("input_tokens".to_string(), Value::from(12_345));
    dims.insert("output_tokens".to_string(), Value::from(678));
    let result = service
        .calculate("chat", "gpt-4o", Some(1), &dims, None)
        .await
        .unwrap();

    assert_eq!(result.status, BillingStatus::Complete);
    let sum: f64 = result
        .snapshot
        .cost_breakdown
        .values()
        .filter_map(Value::as_f64)
        .sum();
    assert!((result.snapshot.total_cost - sum).abs() <= 1e-8);
    assert!(result.cost > 0.0);
}

#[tokio::test]
async fn missing_model_yields_no_rule() {
    aether_billing::invalidate_all();
    let storage = StubStorage { global_model: None };
    let config = GatewayConfig::default();
    let service = BillingService::new(&storage, &config);

    let result = service
        .calculate("chat", "unknown-model", Some(1), &Map::new(), None)
        .await
        .unwrap();
    assert_eq!(result.status, BillingStatus::NoRule);
    assert!((result.cost - 0.0).abs() < f64::EPSILON);
}
