use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};

use aether_common::{GatewayError, GatewayResult};

use crate::expr;
use crate::precision::to_decimal;
use crate::rule_defs::universal::normalize_resolution_key;
use crate::rules::{DimensionMapping, MappingSource};
use crate::schema::BillingStatus;

#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub cost: Decimal,
    pub status: BillingStatus,
    /// Resolved `*_cost` components, pre-quantization, in mapping order.
    pub cost_breakdown: Vec<(String, Decimal)>,
    pub resolved_dimensions: Map<String, Value>,
    pub resolved_variables: Map<String, Value>,
    pub missing_required: Vec<String>,
    pub tier_index: Option<i64>,
    pub tier_info: Option<Value>,
}

/// Stateless rule-expression evaluator. All arithmetic is decimal; the
/// expression language is the sandboxed subset in `expr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormulaEngine;

impl FormulaEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
        dimensions: &Map<String, Value>,
        dimension_mappings: &[(String, DimensionMapping)],
        strict_mode: bool,
    ) -> GatewayResult<EvalOutcome> {
        let mut scope: BTreeMap<String, Decimal> = BTreeMap::new();
        for (name, value) in variables {
            if let Some(decimal) = to_decimal(value) {
                scope.insert(name.clone(), decimal);
            }
        }
        for (name, value) in dimensions {
            if let Some(decimal) = to_decimal(value) {
                scope.insert(name.clone(), decimal);
            }
        }

        let mut resolved_dimensions: Map<String, Value> = dimensions.clone();
        let mut resolved_variables: Map<String, Value> = variables.clone();
        let mut cost_breakdown: Vec<(String, Decimal)> = Vec::new();
        let mut missing_required: Vec<String> = Vec::new();

        for (name, mapping) in dimension_mappings {
            let resolved = match mapping.source {
                MappingSource::Dimension => {
                    let key = mapping.key.as_deref().unwrap_or(name);
                    match dimensions.get(key).filter(|v| !v.is_null()) {
                        Some(value) => to_decimal(value),
                        None => {
                            if mapping.required && !mapping.allow_zero {
                                missing_required.push(name.clone());
                            }
                            mapping.default.as_ref().and_then(to_decimal)
                        }
                    }
                }
                MappingSource::Matrix => {
                    let lookup = mapping
                        .key
                        .as_deref()
                        .and_then(|key| dimensions.get(key))
                        .and_then(|value| match value {
                            Value::String(s) => Some(s.clone()),
                            other => other.as_i64().map(|i| i.to_string()),
                        });
                    let hit = lookup.as_deref().and_then(|raw| {
                        let map = mapping.map.as_ref()?;
                        map.get(raw)
                            .or_else(|| map.get(&normalize_resolution_key(raw)))
                    });
                    match hit {
                        Some(value) => to_decimal(value),
                        None => {
                            if mapping.required && !mapping.allow_zero {
                                missing_required.push(name.clone());
                            }
                            mapping.default.as_ref().and_then(to_decimal)
                        }
                    }
                }
                MappingSource::Computed => {
                    let outcome = mapping
                        .expression
                        .as_deref()
                        .and_then(|source| expr::evaluate_str(source, &scope).ok());
                    match outcome {
                        Some(value) => Some(value),
                        None => {
                            if mapping.required && !mapping.allow_zero {
                                missing_required.push(name.clone());
                            }
                            mapping.default.as_ref().and_then(to_decimal)
                        }
                    }
                }
            };

            let value = resolved.unwrap_or(Decimal::ZERO);
            scope.insert(name.clone(), value);
            match mapping.source {
                MappingSource::Dimension => {
                    resolved_dimensions.insert(name.clone(), decimal_to_value(value));
                }
                MappingSource::Matrix | MappingSource::Computed => {
                    resolved_variables.insert(name.clone(), Value::String(value.to_string()));
                }
            }
            if name.ends_with("_cost") {
                cost_breakdown.push((name.clone(), value));
            }
        }

        if !missing_required.is_empty() {
            if strict_mode {
                return Err(GatewayError::BillingIncomplete(missing_required));
            }
            return Ok(EvalOutcome {
                cost: Decimal::ZERO,
                status: BillingStatus::Incomplete,
                cost_breakdown,
                resolved_dimensions,
                resolved_variables,
                missing_required,
                tier_index: None,
                tier_info: None,
            });
        }

        let cost = match expr::evaluate_str(expression, &scope) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(expression, error = %err, "billing expression failed to evaluate");
                if strict_mode {
                    return Err(GatewayError::BillingIncomplete(vec![err.to_string()]));
                }
                return Ok(EvalOutcome {
                    cost: Decimal::ZERO,
                    status: BillingStatus::Incomplete,
                    cost_breakdown,
                    resolved_dimensions,
                    resolved_variables,
                    missing_required: vec![err.to_string()],
                    tier_index: None,
                    tier_info: None,
                });
            }
        };

        Ok(EvalOutcome {
            cost,
            status: BillingStatus::Complete,
            cost_breakdown,
            resolved_dimensions,
            resolved_variables,
            missing_required: Vec::new(),
            tier_index: None,
            tier_info: None,
        })
    }
}

fn decimal_to_value(value: Decimal) -> Value {
    if value.fract().is_zero()
        && let Some(int) = value.to_i64()
    {
        return Value::from(int);
    }
    value
        .to_f64()
        .map(Value::from)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_templates::{RuleTemplateContext, resolve_template_rule};
    use serde_json::json;

    fn dims(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn universal_rule(global: Value) -> crate::rules::VirtualBillingRule {
        resolve_template_rule(&RuleTemplateContext {
            global_config: global,
            model_config: None,
            provider_id: Some(1),
            model_name: "m".to_string(),
            task_type: "chat".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn token_costs_follow_per_million_prices() {
        let rule = universal_rule(json!({"billing": {"price": {
            "input_per_1m": 3.0, "output_per_1m": 15.0,
        }}}));
        let engine = FormulaEngine::new();
        let outcome = engine
            .evaluate(
                &rule.expression,
                &rule.variables,
                &dims(&[
                    ("input_tokens", json!(1_000_000)),
                    ("output_tokens", json!(200_000)),
                    ("request_count", json!(1)),
                ]),
                &rule.dimension_mappings,
                false,
            )
            .unwrap();
        assert_eq!(outcome.status, BillingStatus::Complete);
        assert_eq!(outcome.cost, "6".parse::<Decimal>().unwrap());
        let input_cost = outcome
            .cost_breakdown
            .iter()
            .find(|(n, _)| n == "input_cost")
            .unwrap();
        assert_eq!(input_cost.1, Decimal::from(3));
    }

    #[test]
    fn matrix_lookup_normalizes_resolution_keys() {
        let rule = universal_rule(json!({"billing": {"video": {
            "price_per_second": 0.1,
            "price_per_second_by_resolution": {"1080x1920": 0.25},
        }}}));
        let engine = FormulaEngine::new();
        let outcome = engine
            .evaluate(
                &rule.expression,
                &rule.variables,
                &dims(&[
                    ("duration_seconds", json!(8)),
                    ("video_resolution_key", json!("1920 × 1080")),
                    ("request_count", json!(1)),
                ]),
                &rule.dimension_mappings,
                false,
            )
            .unwrap();
        assert_eq!(outcome.cost, "2".parse::<Decimal>().unwrap());
    }

    #[test]
    fn matrix_miss_uses_default_unit_price() {
        let rule = universal_rule(json!({"billing": {"video": {"price_per_second": 0.1}}}));
        let engine = FormulaEngine::new();
        let outcome = engine
            .evaluate(
                &rule.expression,
                &rule.variables,
                &dims(&[
                    ("duration_seconds", json!(10)),
                    ("request_count", json!(1)),
                ]),
                &rule.dimension_mappings,
                false,
            )
            .unwrap();
        assert_eq!(outcome.cost, Decimal::ONE);
    }

    #[test]
    fn strict_mode_raises_on_missing_required() {
        let mut rule = universal_rule(json!({}));
        for (name, mapping) in rule.dimension_mappings.iter_mut() {
            if name == "input_tokens" {
                mapping.required = true;
                mapping.allow_zero = false;
                mapping.default = None;
            }
        }
        let engine = FormulaEngine::new();
        let err = engine
            .evaluate(
                &rule.expression,
                &rule.variables,
                &Map::new(),
                &rule.dimension_mappings,
                true,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "billing_incomplete");

        let outcome = engine
            .evaluate(
                &rule.expression,
                &rule.variables,
                &Map::new(),
                &rule.dimension_mappings,
                false,
            )
            .unwrap();
        assert_eq!(outcome.status, BillingStatus::Incomplete);
        assert_eq!(outcome.cost, Decimal::ZERO);
        assert_eq!(outcome.missing_required, vec!["input_tokens".to_string()]);
    }
}
