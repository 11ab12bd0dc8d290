use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Where a mapped value comes from during formula resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    /// Copy a collected dimension.
    Dimension,
    /// Look up a map by a key-dimension's value.
    Matrix,
    /// Evaluate a sub-expression over already-resolved values.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionMapping {
    pub source: MappingSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allow_zero: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl DimensionMapping {
    pub fn dimension(key: &str, default: Value) -> Self {
        Self {
            source: MappingSource::Dimension,
            key: Some(key.to_string()),
            required: false,
            allow_zero: true,
            default: Some(default),
            map: None,
            expression: None,
        }
    }

    pub fn computed(expression: &str) -> Self {
        Self {
            source: MappingSource::Computed,
            key: None,
            required: false,
            allow_zero: true,
            default: Some(json!(0)),
            map: None,
            expression: Some(expression.to_string()),
        }
    }
}

/// A synthesized billing rule; never persisted, always rebuilt from model
/// pricing so it cannot go stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualBillingRule {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub expression: String,
    pub variables: Map<String, Value>,
    /// Ordered: computed entries may reference anything resolved before them.
    pub dimension_mappings: Vec<(String, DimensionMapping)>,
    pub is_virtual: bool,
}

pub fn get_nested<'a>(config: Option<&'a Value>, path: &str) -> Option<&'a Value> {
    let mut cursor = config?;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        cursor = cursor.as_object()?.get(part)?;
    }
    Some(cursor)
}

fn price(model: Option<&Value>, global: &Value, path: &str) -> f64 {
    get_nested(model, path)
        .or_else(|| get_nested(Some(global), path))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

pub const DEFAULT_RULE_EXPRESSION: &str =
    "input_cost + output_cost + cache_creation_cost + cache_read_cost + request_cost";

/// Token + per-request rule derived from model pricing config.
///
/// Pricing lives under `billing.price.*` (per-million token prices and an
/// optional flat `per_request`); provider-level model config overrides the
/// global model field-by-field.
pub struct DefaultBillingRuleGenerator;

impl DefaultBillingRuleGenerator {
    pub fn generate(
        global_config: &Value,
        model_config: Option<&Value>,
        task_type: &str,
    ) -> VirtualBillingRule {
        let mut variables = Map::new();
        variables.insert(
            "input_price_per_1m".to_string(),
            json!(price(model_config, global_config, "billing.price.input_per_1m")),
        );
        variables.insert(
            "output_price_per_1m".to_string(),
            json!(price(model_config, global_config, "billing.price.output_per_1m")),
        );
        variables.insert(
            "cache_read_price_per_1m".to_string(),
            json!(price(model_config, global_config, "billing.price.cache_read_per_1m")),
        );
        variables.insert(
            "cache_creation_price_per_1m".to_string(),
            json!(price(
                model_config,
                global_config,
                "billing.price.cache_creation_per_1m"
            )),
        );
        variables.insert(
            "request_price".to_string(),
            json!(price(model_config, global_config, "billing.price.per_request")),
        );

        let dimension_mappings = vec![
            (
                "input_tokens".to_string(),
                DimensionMapping::dimension("input_tokens", json!(0)),
            ),
            (
                "output_tokens".to_string(),
                DimensionMapping::dimension("output_tokens", json!(0)),
            ),
            (
                "cache_creation_tokens".to_string(),
                DimensionMapping::dimension("cache_creation_tokens", json!(0)),
            ),
            (
                "cache_read_tokens".to_string(),
                DimensionMapping::dimension("cache_read_tokens", json!(0)),
            ),
            (
                "request_count".to_string(),
                DimensionMapping::dimension("request_count", json!(1)),
            ),
            (
                "input_cost".to_string(),
                DimensionMapping::computed("input_tokens * input_price_per_1m / 1000000"),
            ),
            (
                "output_cost".to_string(),
                DimensionMapping::computed("output_tokens * output_price_per_1m / 1000000"),
            ),
            (
                "cache_creation_cost".to_string(),
                DimensionMapping::computed(
                    "cache_creation_tokens * cache_creation_price_per_1m / 1000000",
                ),
            ),
            (
                "cache_read_cost".to_string(),
                DimensionMapping::computed(
                    "cache_read_tokens * cache_read_price_per_1m / 1000000",
                ),
            ),
            (
                "request_cost".to_string(),
                DimensionMapping::computed("request_count * request_price"),
            ),
        ];

        VirtualBillingRule {
            id: "__default__".to_string(),
            name: "Default Token Rule".to_string(),
            task_type: task_type.to_string(),
            expression: DEFAULT_RULE_EXPRESSION.to_string(),
            variables,
            dimension_mappings,
            is_virtual: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_model_config_overrides_global() {
        let global = json!({"billing": {"price": {"input_per_1m": 3.0, "output_per_1m": 15.0}}});
        let model = json!({"billing": {"price": {"input_per_1m": 2.5}}});
        let rule = DefaultBillingRuleGenerator::generate(&global, Some(&model), "chat");
        assert_eq!(rule.variables["input_price_per_1m"], json!(2.5));
        assert_eq!(rule.variables["output_price_per_1m"], json!(15.0));
        assert_eq!(rule.expression, DEFAULT_RULE_EXPRESSION);
    }

    #[test]
    fn missing_prices_default_to_zero() {
        let rule = DefaultBillingRuleGenerator::generate(&json!({}), None, "chat");
        assert_eq!(rule.variables["request_price"], json!(0.0));
    }
}
