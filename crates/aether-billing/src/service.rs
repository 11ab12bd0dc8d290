use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use aether_common::{GatewayConfig, GatewayResult};
use aether_storage::Storage;

use crate::collector::{DimensionCollectInput, DimensionCollectorService};
use crate::formula::FormulaEngine;
use crate::precision::{quantize_cost, to_decimal};
use crate::rule_service::BillingRuleService;
use crate::schema::{BILLING_SNAPSHOT_SCHEMA_VERSION, BillingSnapshot, BillingStatus, CostResult};

fn dim_i64(dims: &Map<String, Value>, key: &str) -> i64 {
    dims.get(key)
        .and_then(to_decimal)
        .and_then(|d| d.to_i64())
        .unwrap_or(0)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Billing calculation orchestrator: dimensions -> rule -> cost -> snapshot.
///
/// Reads rules and collectors; never writes usage rows itself.
pub struct BillingService<'a> {
    storage: &'a dyn Storage,
    config: &'a GatewayConfig,
    engine: FormulaEngine,
}

impl<'a> BillingService<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a GatewayConfig) -> Self {
        Self {
            storage,
            config,
            engine: FormulaEngine::new(),
        }
    }

    pub async fn collect_dimensions(
        &self,
        api_format: Option<&str>,
        task_type: Option<&str>,
        inp: DimensionCollectInput<'_>,
    ) -> Map<String, Value> {
        DimensionCollectorService::new(self.storage)
            .collect_dimensions(api_format, task_type, inp)
            .await
    }

    pub async fn calculate(
        &self,
        task_type: &str,
        model: &str,
        provider_id: Option<i64>,
        dimensions: &Map<String, Value>,
        strict_mode: Option<bool>,
    ) -> GatewayResult<CostResult> {
        let strict = strict_mode.unwrap_or(self.config.billing_strict_mode);

        // Normalize and enrich without mutating the caller's map.
        let mut dims = dimensions.clone();
        if !dims.contains_key("cache_creation_tokens")
            && let Some(value) = dims.get("cache_creation_input_tokens").cloned()
        {
            dims.insert("cache_creation_tokens".to_string(), value);
        }
        if !dims.contains_key("cache_read_tokens")
            && let Some(value) = dims.get("cache_read_input_tokens").cloned()
        {
            dims.insert("cache_read_tokens".to_string(), value);
        }
        if !dims.contains_key("request_count") {
            dims.insert("request_count".to_string(), Value::from(1));
        }
        // Tier key for context-length pricing: input + both cache classes.
        if !dims.contains_key("total_input_context") {
            let total = dim_i64(&dims, "input_tokens")
                + dim_i64(&dims, "cache_creation_tokens")
                + dim_i64(&dims, "cache_read_tokens");
            dims.insert("total_input_context".to_string(), Value::from(total));
        }

        let lookup = BillingRuleService::find_rule(
            self.storage,
            self.config,
            provider_id,
            model,
            task_type,
        )
        .await;

        let Some(lookup) = lookup else {
            tracing::warn!(task_type, model, ?provider_id, "no billing rule for task");
            let snapshot = BillingSnapshot {
                resolved_dimensions: dims,
                status: BillingStatus::NoRule,
                calculated_at: now_rfc3339(),
                ..Default::default()
            };
            return Ok(CostResult {
                cost: 0.0,
                status: BillingStatus::NoRule,
                snapshot,
            });
        };

        let rule = &lookup.rule;
        let outcome = self.engine.evaluate(
            &rule.expression,
            &rule.variables,
            &dims,
            &rule.dimension_mappings,
            strict,
        )?;

        // Components quantize first; the persisted total is the sum of the
        // quantized components, so the audit invariant holds exactly.
        let quantized: Vec<(String, Decimal)> = outcome
            .cost_breakdown
            .iter()
            .map(|(name, value)| (name.clone(), quantize_cost(*value)))
            .collect();
        let total = if quantized.is_empty() {
            quantize_cost(outcome.cost)
        } else {
            quantize_cost(quantized.iter().map(|(_, v)| *v).sum())
        };

        let mut cost_breakdown = Map::new();
        for (name, value) in &quantized {
            cost_breakdown.insert(name.clone(), Value::from(value.to_f64().unwrap_or(0.0)));
        }

        let total_cost = if outcome.status == BillingStatus::Complete {
            total.to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        // Variables exclude dimension names and *_cost components; those live
        // in resolved_dimensions and cost_breakdown respectively.
        let mut resolved_variables = Map::new();
        for (name, value) in &outcome.resolved_variables {
            if outcome.resolved_dimensions.contains_key(name) || name.ends_with("_cost") {
                continue;
            }
            resolved_variables.insert(name.clone(), value.clone());
        }

        let snapshot = BillingSnapshot {
            schema_version: BILLING_SNAPSHOT_SCHEMA_VERSION.to_string(),
            rule_id: Some(rule.id.clone()),
            rule_name: Some(rule.name.clone()),
            scope: Some(lookup.scope.clone()),
            expression: Some(rule.expression.clone()),
            resolved_dimensions: outcome.resolved_dimensions,
            resolved_variables,
            cost_breakdown,
            total_cost,
            tier_index: outcome.tier_index,
            tier_info: outcome.tier_info,
            missing_required: outcome.missing_required,
            status: outcome.status,
            calculated_at: now_rfc3339(),
            engine_version: "2.0".to_string(),
        };

        Ok(CostResult {
            cost: total_cost,
            status: outcome.status,
            snapshot,
        })
    }

    /// Collect dimensions from raw payloads, then calculate.
    #[allow(clippy::too_many_arguments)]
    pub async fn calculate_from_response(
        &self,
        task_type: &str,
        model: &str,
        provider_id: Option<i64>,
        api_format: Option<&str>,
        inp: DimensionCollectInput<'_>,
        strict_mode: Option<bool>,
    ) -> GatewayResult<CostResult> {
        let dims = self
            .collect_dimensions(api_format, Some(task_type), inp)
            .await;
        self.calculate(task_type, model, provider_id, &dims, strict_mode)
            .await
    }
}
