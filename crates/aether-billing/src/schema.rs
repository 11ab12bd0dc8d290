use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BILLING_SNAPSHOT_SCHEMA_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Complete,
    Incomplete,
    NoRule,
    Legacy,
}

impl BillingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BillingStatus::Complete => "complete",
            BillingStatus::Incomplete => "incomplete",
            BillingStatus::NoRule => "no_rule",
            BillingStatus::Legacy => "legacy",
        }
    }
}

/// Immutable audit record persisted into `usage.request_metadata`.
///
/// Internal-only; must pass sanitization before any client ever sees it.
/// Invariant: with `status == complete`, `total_cost` equals the sum of the
/// quantized `cost_breakdown` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSnapshot {
    pub schema_version: String,
    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
    pub scope: Option<String>,
    pub expression: Option<String>,
    /// Final dimension values used (tokens, request_count, seconds, keys).
    pub resolved_dimensions: Map<String, Value>,
    /// Final variables used; decimals serialized as strings.
    pub resolved_variables: Map<String, Value>,
    /// Itemized quantized costs.
    pub cost_breakdown: Map<String, Value>,
    pub total_cost: f64,
    pub tier_index: Option<i64>,
    pub tier_info: Option<Value>,
    pub missing_required: Vec<String>,
    pub status: BillingStatus,
    /// ISO-8601 timestamp.
    pub calculated_at: String,
    pub engine_version: String,
}

impl Default for BillingSnapshot {
    fn default() -> Self {
        Self {
            schema_version: BILLING_SNAPSHOT_SCHEMA_VERSION.to_string(),
            rule_id: None,
            rule_name: None,
            scope: None,
            expression: None,
            resolved_dimensions: Map::new(),
            resolved_variables: Map::new(),
            cost_breakdown: Map::new(),
            total_cost: 0.0,
            tier_index: None,
            tier_info: None,
            missing_required: Vec::new(),
            status: BillingStatus::NoRule,
            calculated_at: String::new(),
            engine_version: "2.0".to_string(),
        }
    }
}

impl BillingSnapshot {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Billing calculation output.
#[derive(Debug, Clone, PartialEq)]
pub struct CostResult {
    pub cost: f64,
    pub status: BillingStatus,
    pub snapshot: BillingSnapshot,
}
