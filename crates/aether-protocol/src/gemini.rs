use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: i64,
    #[serde(default)]
    pub candidates_token_count: i64,
    #[serde(default)]
    pub total_token_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Long-running operation wrapper returned by `:predictLongRunning` and
/// polled via `/v1beta/operations/...`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Strip a `v1beta/` prefix and ensure the canonical `operations/` form.
pub fn normalize_operation_id(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('/');
    let trimmed = trimmed.strip_prefix("v1beta/").unwrap_or(trimmed);
    if trimmed.starts_with("operations/") || trimmed.contains("/operations/") {
        trimmed.to_string()
    } else {
        format!("operations/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_normalization() {
        assert_eq!(normalize_operation_id("operations/abc"), "operations/abc");
        assert_eq!(normalize_operation_id("v1beta/operations/abc"), "operations/abc");
        assert_eq!(normalize_operation_id("abc"), "operations/abc");
        assert_eq!(
            normalize_operation_id("models/veo-3/operations/abc"),
            "models/veo-3/operations/abc"
        );
    }
}
