use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};

use aether_storage::Storage;
use aether_storage::entities::dimension_collectors;

use crate::expr;
use crate::precision::to_decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorSource {
    Request,
    Response,
    Metadata,
    Computed,
}

impl CollectorSource {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "request" => Some(CollectorSource::Request),
            "response" => Some(CollectorSource::Response),
            "metadata" => Some(CollectorSource::Metadata),
            "computed" => Some(CollectorSource::Computed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectorSource::Request => "request",
            CollectorSource::Response => "response",
            CollectorSource::Metadata => "metadata",
            CollectorSource::Computed => "computed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorValueType {
    Int,
    Float,
    Str,
}

impl CollectorValueType {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "int" => CollectorValueType::Int,
            "string" | "str" => CollectorValueType::Str,
            _ => CollectorValueType::Float,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectorValueType::Int => "int",
            CollectorValueType::Float => "float",
            CollectorValueType::Str => "string",
        }
    }
}

/// One extraction rule for a billing dimension; data, not code.
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    pub api_format: String,
    pub task_type: String,
    pub dimension_name: String,
    pub source: CollectorSource,
    pub source_path: Option<String>,
    pub value_type: CollectorValueType,
    pub transform_expression: Option<String>,
    pub default_value: Option<String>,
    pub priority: i32,
    pub is_enabled: bool,
}

impl From<dimension_collectors::Model> for CollectorSpec {
    fn from(model: dimension_collectors::Model) -> Self {
        Self {
            api_format: model.api_format,
            task_type: model.task_type,
            dimension_name: model.dimension_name,
            source: CollectorSource::parse(&model.source_type)
                .unwrap_or(CollectorSource::Response),
            source_path: model.source_path,
            value_type: CollectorValueType::parse(&model.value_type),
            transform_expression: model.transform_expression,
            default_value: model.default_value,
            priority: model.priority,
            is_enabled: model.is_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionCollectInput<'a> {
    pub request: Option<&'a Value>,
    pub response: Option<&'a Value>,
    pub metadata: Option<&'a Value>,
    pub base_dimensions: Option<&'a Map<String, Value>>,
}

fn dot_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        cursor = cursor.as_object()?.get(part)?;
    }
    Some(cursor)
}

fn coerce(value: Value, value_type: CollectorValueType) -> Option<Value> {
    match value_type {
        CollectorValueType::Int => match &value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(|f| Value::from(f as i64)),
            _ => None,
        },
        CollectorValueType::Float => match &value {
            Value::Number(n) => n.as_f64().map(Value::from),
            Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
            _ => None,
        },
        CollectorValueType::Str => match value {
            Value::String(s) => Some(Value::String(s)),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
    }
}

fn coerce_default(raw: &str, value_type: CollectorValueType) -> Option<Value> {
    coerce(Value::String(raw.to_string()), value_type)
}

/// Pure extraction runtime: applies a collector set to one request's data and
/// produces a flat `{dimension_name -> value}` map.
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionCollectorRuntime;

impl DimensionCollectorRuntime {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(
        &self,
        collectors: &[CollectorSpec],
        inp: DimensionCollectInput<'_>,
    ) -> Map<String, Value> {
        let mut dims: Map<String, Value> = inp.base_dimensions.cloned().unwrap_or_default();

        let mut ordered: Vec<&CollectorSpec> =
            collectors.iter().filter(|c| c.is_enabled).collect();
        ordered.sort_by_key(|c| std::cmp::Reverse(c.priority));

        // Source-backed collectors resolve first so computed ones can see them.
        // Caller-supplied base dimensions and higher-priority hits win; a
        // lower-priority collector only runs while its dimension is unset.
        for phase_computed in [false, true] {
            for collector in ordered
                .iter()
                .filter(|c| (c.source == CollectorSource::Computed) == phase_computed)
            {
                if dims.contains_key(&collector.dimension_name) {
                    continue;
                }
                if let Some(value) = self.resolve(collector, &dims, inp) {
                    dims.insert(collector.dimension_name.clone(), value);
                }
            }
        }

        dims
    }

    fn resolve(
        &self,
        collector: &CollectorSpec,
        dims: &Map<String, Value>,
        inp: DimensionCollectInput<'_>,
    ) -> Option<Value> {
        let raw = match collector.source {
            CollectorSource::Computed => {
                let expression = collector.transform_expression.as_deref()?;
                let scope: BTreeMap<String, rust_decimal::Decimal> = dims
                    .iter()
                    .filter_map(|(k, v)| to_decimal(v).map(|d| (k.clone(), d)))
                    .collect();
                let value = expr::evaluate_str(expression, &scope).ok()?;
                Some(decimal_value(value))
            }
            source => {
                let root = match source {
                    CollectorSource::Request => inp.request,
                    CollectorSource::Response => inp.response,
                    CollectorSource::Metadata => inp.metadata,
                    CollectorSource::Computed => None,
                }?;
                let found = dot_path(root, collector.source_path.as_deref()?)
                    .filter(|v| !v.is_null())
                    .cloned()?;
                match collector.transform_expression.as_deref() {
                    Some(expression) => {
                        let mut scope = BTreeMap::new();
                        scope.insert("value".to_string(), to_decimal(&found)?);
                        let value = expr::evaluate_str(expression, &scope).ok()?;
                        Some(decimal_value(value))
                    }
                    None => Some(found),
                }
            }
        };

        match raw.and_then(|v| coerce(v, collector.value_type)) {
            Some(value) => Some(value),
            None => collector
                .default_value
                .as_deref()
                .and_then(|d| coerce_default(d, collector.value_type)),
        }
    }
}

fn decimal_value(value: rust_decimal::Decimal) -> Value {
    value.to_f64().map(Value::from).unwrap_or(Value::Null)
}

/// Storage-backed collector lookup with the built-in defaults merged in.
pub struct DimensionCollectorService<'a> {
    storage: &'a dyn Storage,
    runtime: DimensionCollectorRuntime,
}

impl<'a> DimensionCollectorService<'a> {
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self {
            storage,
            runtime: DimensionCollectorRuntime::new(),
        }
    }

    /// Enabled collectors for `(api_format, task_type)`, built-ins included.
    ///
    /// Video formats additionally pull the matching `family:chat` collectors:
    /// the shipped video defaults live under the chat format key.
    pub async fn list_enabled_collectors(
        &self,
        api_format: &str,
        task_type: &str,
    ) -> Vec<CollectorSpec> {
        let api_format = api_format.trim().to_ascii_lowercase();
        let task_type = task_type.trim().to_ascii_lowercase();

        let mut formats = vec![api_format.clone()];
        if let Ok(sig) = aether_protocol::parse_signature_key(&api_format)
            && sig.endpoint_kind == aether_protocol::EndpointKind::Video
        {
            formats.push(format!("{}:chat", sig.api_family.as_str()));
        }

        let mut out: Vec<CollectorSpec> = Vec::new();
        for format in &formats {
            if let Ok(rows) = self.storage.enabled_collectors(format, &task_type).await {
                out.extend(rows.into_iter().map(CollectorSpec::from));
            }
            out.extend(
                crate::collector_defs::builtin_collectors()
                    .into_iter()
                    .filter(|c| c.api_format == *format && c.task_type == task_type),
            );
        }
        out.sort_by_key(|c| std::cmp::Reverse(c.priority));
        out
    }

    pub async fn collect_dimensions(
        &self,
        api_format: Option<&str>,
        task_type: Option<&str>,
        inp: DimensionCollectInput<'_>,
    ) -> Map<String, Value> {
        let collectors = self
            .list_enabled_collectors(
                api_format.unwrap_or(""),
                task_type.unwrap_or("chat"),
            )
            .await;
        self.runtime.collect(&collectors, inp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(
        dimension: &str,
        source: CollectorSource,
        path: Option<&str>,
        value_type: CollectorValueType,
        priority: i32,
    ) -> CollectorSpec {
        CollectorSpec {
            api_format: "openai:chat".to_string(),
            task_type: "chat".to_string(),
            dimension_name: dimension.to_string(),
            source,
            source_path: path.map(str::to_string),
            value_type,
            transform_expression: None,
            default_value: None,
            priority,
            is_enabled: true,
        }
    }

    #[test]
    fn higher_priority_wins_then_falls_back() {
        let runtime = DimensionCollectorRuntime::new();
        let collectors = vec![
            spec(
                "input_tokens",
                CollectorSource::Response,
                Some("usage.prompt_tokens"),
                CollectorValueType::Int,
                10,
            ),
            spec(
                "input_tokens",
                CollectorSource::Response,
                Some("usageMetadata.promptTokenCount"),
                CollectorValueType::Int,
                5,
            ),
        ];
        let response = json!({"usageMetadata": {"promptTokenCount": 123}});
        let dims = runtime.collect(
            &collectors,
            DimensionCollectInput {
                response: Some(&response),
                ..Default::default()
            },
        );
        assert_eq!(dims["input_tokens"], json!(123));
    }

    #[test]
    fn transform_expression_applies_to_raw_value() {
        let runtime = DimensionCollectorRuntime::new();
        let mut collector = spec(
            "file_size_mb",
            CollectorSource::Metadata,
            Some("result.file_size_bytes"),
            CollectorValueType::Float,
            0,
        );
        collector.transform_expression = Some("value / 1024 / 1024".to_string());
        let metadata = json!({"result": {"file_size_bytes": 1048576}});
        let dims = runtime.collect(
            &[collector],
            DimensionCollectInput {
                metadata: Some(&metadata),
                ..Default::default()
            },
        );
        assert!((dims["file_size_mb"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn computed_collectors_see_resolved_dimensions() {
        let runtime = DimensionCollectorRuntime::new();
        let mut total = spec(
            "total_input_tokens",
            CollectorSource::Computed,
            None,
            CollectorValueType::Int,
            0,
        );
        total.transform_expression = Some("input_tokens + cache_read_tokens".to_string());
        let collectors = vec![
            spec(
                "input_tokens",
                CollectorSource::Request,
                Some("usage.input_tokens"),
                CollectorValueType::Int,
                0,
            ),
            spec(
                "cache_read_tokens",
                CollectorSource::Request,
                Some("usage.cache_read_tokens"),
                CollectorValueType::Int,
                0,
            ),
            total,
        ];
        let request = json!({"usage": {"input_tokens": 100, "cache_read_tokens": 20}});
        let dims = runtime.collect(
            &collectors,
            DimensionCollectInput {
                request: Some(&request),
                ..Default::default()
            },
        );
        assert_eq!(dims["total_input_tokens"], json!(120));
    }

    #[test]
    fn coercion_failure_falls_back_to_default_then_drops() {
        let runtime = DimensionCollectorRuntime::new();
        let mut with_default = spec(
            "count",
            CollectorSource::Response,
            Some("count"),
            CollectorValueType::Int,
            0,
        );
        with_default.default_value = Some("7".to_string());
        let response = json!({"count": {"not": "a number"}});
        let dims = runtime.collect(
            &[with_default],
            DimensionCollectInput {
                response: Some(&response),
                ..Default::default()
            },
        );
        assert_eq!(dims["count"], json!(7));

        let without_default = spec(
            "count",
            CollectorSource::Response,
            Some("count"),
            CollectorValueType::Int,
            0,
        );
        let dims = runtime.collect(
            &[without_default],
            DimensionCollectInput {
                response: Some(&response),
                ..Default::default()
            },
        );
        assert!(!dims.contains_key("count"));
    }
}
