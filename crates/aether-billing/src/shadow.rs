use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use glob::Pattern;
use serde_json::{Map, Value};

use aether_common::{GatewayConfig, GatewayResult};
use aether_storage::Storage;

use crate::schema::BillingSnapshot;
use crate::service::BillingService;

/// Requests billed, by resolved mode and truth engine (labels flattened).
pub static BILLING_REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static BILLING_DIFF_EXCEEDS_THRESHOLD_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static BILLING_FALLBACK_TOTAL: AtomicU64 = AtomicU64::new(0);
pub static BILLING_INVARIANT_VIOLATION_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Legacy,
    Shadow,
    NewWithFallback,
    New,
}

impl EngineMode {
    pub fn parse(value: &str) -> EngineMode {
        match value.trim().to_ascii_lowercase().as_str() {
            "shadow" => EngineMode::Shadow,
            "new_with_fallback" => EngineMode::NewWithFallback,
            "new" => EngineMode::New,
            // Unknown values behave like legacy.
            _ => EngineMode::Legacy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineMode::Legacy => "legacy",
            EngineMode::Shadow => "shadow",
            EngineMode::NewWithFallback => "new_with_fallback",
            EngineMode::New => "new",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruthEngine {
    Legacy,
    New,
}

impl TruthEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            TruthEngine::Legacy => "legacy",
            TruthEngine::New => "new",
        }
    }
}

#[derive(Debug)]
struct CompiledOverrides {
    exact: HashMap<String, EngineMode>,
    patterns: Vec<(Pattern, EngineMode)>,
}

fn compile_overrides(raw: &str) -> CompiledOverrides {
    let mut exact = HashMap::new();
    let mut patterns = Vec::new();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        for (key, value) in map {
            let mode = EngineMode::parse(value.as_str().unwrap_or_default());
            if key.contains(['*', '?', '[']) {
                if let Ok(pattern) = Pattern::new(&key) {
                    patterns.push((pattern, mode));
                }
            } else {
                exact.insert(key, mode);
            }
        }
    }
    CompiledOverrides { exact, patterns }
}

static OVERRIDE_CACHE: LazyLock<Mutex<HashMap<String, Arc<CompiledOverrides>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn compiled_overrides(raw: &str) -> Arc<CompiledOverrides> {
    if let Ok(mut guard) = OVERRIDE_CACHE.lock() {
        if let Some(found) = guard.get(raw) {
            return found.clone();
        }
        let compiled = Arc::new(compile_overrides(raw));
        // Override strings come from config; a handful of variants at most.
        if guard.len() > 32 {
            guard.clear();
        }
        guard.insert(raw.to_string(), compiled.clone());
        return compiled;
    }
    Arc::new(compile_overrides(raw))
}

/// Resolve the engine mode for `provider/model`: exact override, then
/// fnmatch-style patterns, then the base mode. Pure, no DB.
pub fn resolve_engine_mode(config: &GatewayConfig, provider: &str, model: &str) -> EngineMode {
    let base = EngineMode::parse(&config.billing_engine);
    let overrides = compiled_overrides(&config.billing_engine_overrides);
    let key = format!("{provider}/{model}");
    if let Some(mode) = overrides.exact.get(&key) {
        return *mode;
    }
    for (pattern, mode) in &overrides.patterns {
        if pattern.matches(&key) {
            return *mode;
        }
    }
    base
}

/// Cost breakdown written into usage rows (the billable truth).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub request_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn cache_cost(&self) -> f64 {
        self.cache_creation_cost + self.cache_read_cost
    }

    /// `total == Σ components` within 1e-8. Exact for the new engine (it
    /// sums quantized components); legacy floats get the epsilon.
    pub fn validate(&self) -> bool {
        let computed = self.input_cost
            + self.output_cost
            + self.cache_creation_cost
            + self.cache_read_cost
            + self.request_cost;
        (computed - self.total_cost).abs() < 1e-8
    }
}

#[derive(Debug, Clone)]
pub struct ShadowBillingResult {
    /// Written into the usage row.
    pub truth_breakdown: CostBreakdown,
    /// Persisted only under `request_metadata.billing_shadow`.
    pub shadow_snapshot: Option<BillingSnapshot>,
    /// Reconciliation data (totals, diff, per-component deltas).
    pub comparison: Map<String, Value>,
    pub engine_mode: EngineMode,
    pub truth_engine: TruthEngine,
    pub was_fallback: bool,
}

/// Runs the new billing engine alongside the legacy outcome.
///
/// Truth and shadow stay strictly separated; callers decide how to persist
/// each. Never writes rows.
pub struct ShadowBillingService<'a> {
    storage: &'a dyn Storage,
    config: &'a GatewayConfig,
}

impl<'a> ShadowBillingService<'a> {
    pub fn new(storage: &'a dyn Storage, config: &'a GatewayConfig) -> Self {
        Self { storage, config }
    }

    pub fn engine_mode(&self, provider: &str, model: &str) -> EngineMode {
        resolve_engine_mode(self.config, provider, model)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn calculate_with_shadow(
        &self,
        provider: &str,
        provider_id: Option<i64>,
        model: &str,
        task_type: &str,
        input_tokens: i64,
        output_tokens: i64,
        cache_creation_input_tokens: i64,
        cache_read_input_tokens: i64,
        legacy_truth: CostBreakdown,
        is_failed_request: bool,
    ) -> GatewayResult<ShadowBillingResult> {
        let engine_mode = resolve_engine_mode(self.config, provider, model);

        if engine_mode == EngineMode::Legacy {
            BILLING_REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);
            let mut comparison = Map::new();
            comparison.insert(
                "engine_mode".to_string(),
                Value::from(engine_mode.as_str()),
            );
            return Ok(ShadowBillingResult {
                truth_breakdown: legacy_truth,
                shadow_snapshot: None,
                comparison,
                engine_mode,
                truth_engine: TruthEngine::Legacy,
                was_fallback: false,
            });
        }

        // Failed requests do not bill the per-request component.
        let request_count = i64::from(!is_failed_request);
        let mut dimensions = Map::new();
        dimensions.insert("input_tokens".to_string(), Value::from(input_tokens.max(0)));
        dimensions.insert("output_tokens".to_string(), Value::from(output_tokens.max(0)));
        dimensions.insert(
            "cache_creation_input_tokens".to_string(),
            Value::from(cache_creation_input_tokens.max(0)),
        );
        dimensions.insert(
            "cache_read_input_tokens".to_string(),
            Value::from(cache_read_input_tokens.max(0)),
        );
        dimensions.insert("request_count".to_string(), Value::from(request_count));

        let task = {
            let normalized = task_type.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "chat" | "cli" | "video" | "image" | "audio" => normalized,
                _ => "chat".to_string(),
            }
        };

        let new_result = BillingService::new(self.storage, self.config)
            .calculate(&task, model, provider_id, &dimensions, Some(false))
            .await?;
        let shadow_snapshot = new_result.snapshot;

        let component = |name: &str| -> f64 {
            shadow_snapshot
                .cost_breakdown
                .get(name)
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        let new_breakdown = CostBreakdown {
            input_cost: component("input_cost"),
            output_cost: component("output_cost"),
            cache_creation_cost: component("cache_creation_cost"),
            cache_read_cost: component("cache_read_cost"),
            request_cost: component("request_cost"),
            total_cost: shadow_snapshot.total_cost,
        };

        let diff = (new_breakdown.total_cost - legacy_truth.total_cost).abs();
        let diff_pct = if legacy_truth.total_cost > 0.0 {
            diff / legacy_truth.total_cost * 100.0
        } else {
            0.0
        };

        let mut comparison = Map::new();
        comparison.insert("engine_mode".to_string(), Value::from(engine_mode.as_str()));
        comparison.insert("old_total".to_string(), Value::from(legacy_truth.total_cost));
        comparison.insert("new_total".to_string(), Value::from(new_breakdown.total_cost));
        comparison.insert("diff_usd".to_string(), Value::from(diff));
        comparison.insert("diff_pct".to_string(), Value::from(diff_pct));
        let mut breakdown_diff = Map::new();
        breakdown_diff.insert(
            "input_cost".to_string(),
            Value::from(new_breakdown.input_cost - legacy_truth.input_cost),
        );
        breakdown_diff.insert(
            "output_cost".to_string(),
            Value::from(new_breakdown.output_cost - legacy_truth.output_cost),
        );
        breakdown_diff.insert(
            "cache_creation_cost".to_string(),
            Value::from(new_breakdown.cache_creation_cost - legacy_truth.cache_creation_cost),
        );
        breakdown_diff.insert(
            "cache_read_cost".to_string(),
            Value::from(new_breakdown.cache_read_cost - legacy_truth.cache_read_cost),
        );
        breakdown_diff.insert(
            "request_cost".to_string(),
            Value::from(new_breakdown.request_cost - legacy_truth.request_cost),
        );
        comparison.insert("breakdown_diff".to_string(), Value::Object(breakdown_diff));

        let threshold = if self.config.billing_diff_threshold_usd > 0.0 {
            self.config.billing_diff_threshold_usd
        } else {
            0.0001
        };
        if diff > threshold {
            BILLING_DIFF_EXCEEDS_THRESHOLD_TOTAL.fetch_add(1, Ordering::Relaxed);
            let message = format!(
                "billing diff detected: provider={provider} model={model} old={:.8} new={:.8} diff={diff:.8} ({diff_pct:.4}%) mode={}",
                legacy_truth.total_cost,
                new_breakdown.total_cost,
                engine_mode.as_str()
            );
            match self.config.billing_shadow_log_level.to_ascii_lowercase().as_str() {
                "debug" => tracing::debug!("{message}"),
                "warn" | "warning" => tracing::warn!("{message}"),
                "error" => tracing::error!("{message}"),
                _ => tracing::info!("{message}"),
            }
        }

        let (truth_engine, truth, was_fallback) = match engine_mode {
            EngineMode::Shadow => (TruthEngine::Legacy, legacy_truth, false),
            EngineMode::New => (TruthEngine::New, new_breakdown, false),
            EngineMode::NewWithFallback => {
                if diff > threshold * 10.0 {
                    BILLING_FALLBACK_TOTAL.fetch_add(1, Ordering::Relaxed);
                    (TruthEngine::Legacy, legacy_truth, true)
                } else {
                    (TruthEngine::New, new_breakdown, false)
                }
            }
            EngineMode::Legacy => (TruthEngine::Legacy, legacy_truth, false),
        };

        BILLING_REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);

        if !truth.validate() {
            BILLING_INVARIANT_VIOLATION_TOTAL.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                provider,
                model,
                engine_mode = engine_mode.as_str(),
                truth_engine = truth_engine.as_str(),
                truth_total = truth.total_cost,
                "billing invariant violation"
            );
        }

        Ok(ShadowBillingResult {
            truth_breakdown: truth,
            shadow_snapshot: Some(shadow_snapshot),
            comparison,
            engine_mode,
            truth_engine,
            was_fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_common::GatewayConfig;

    fn config_with(engine: &str, overrides: &str) -> GatewayConfig {
        GatewayConfig {
            billing_engine: engine.to_string(),
            billing_engine_overrides: overrides.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exact_and_wildcard_overrides_resolve() {
        let config = config_with(
            "legacy",
            r#"{"anthropic/*": "shadow", "openai/gpt-4o": "new"}"#,
        );
        assert_eq!(
            resolve_engine_mode(&config, "openai", "gpt-4o"),
            EngineMode::New
        );
        assert_eq!(
            resolve_engine_mode(&config, "anthropic", "claude-3-5-sonnet"),
            EngineMode::Shadow
        );
        assert_eq!(
            resolve_engine_mode(&config, "other", "x"),
            EngineMode::Legacy
        );
    }

    #[test]
    fn unknown_modes_behave_like_legacy() {
        let config = config_with("turbo", "{}");
        assert_eq!(resolve_engine_mode(&config, "p", "m"), EngineMode::Legacy);
    }

    #[test]
    fn breakdown_validation_uses_epsilon() {
        let good = CostBreakdown {
            input_cost: 0.1,
            output_cost: 0.2,
            total_cost: 0.3,
            ..Default::default()
        };
        assert!(good.validate());
        let bad = CostBreakdown {
            input_cost: 0.1,
            total_cost: 0.3,
            ..Default::default()
        };
        assert!(!bad.validate());
    }
}
