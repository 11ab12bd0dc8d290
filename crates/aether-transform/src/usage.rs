use serde_json::Value;

fn as_i64(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

/// Extract cache-creation tokens from a Claude-shaped `usage` object.
///
/// Three accepted shapes, newest first:
/// 1. nested `cache_creation.ephemeral_5m_input_tokens` / `ephemeral_1h_input_tokens`
/// 2. flat `claude_cache_creation_5_m_tokens` / `claude_cache_creation_1_h_tokens`
/// 3. legacy `cache_creation_input_tokens`
///
/// A present-but-zero newer shape falls back to the legacy field.
pub fn extract_cache_creation_tokens(usage: &Value) -> i64 {
    let legacy = as_i64(usage.get("cache_creation_input_tokens"));

    if let Some(nested) = usage.get("cache_creation").filter(|v| v.is_object()) {
        let total = as_i64(nested.get("ephemeral_5m_input_tokens"))
            + as_i64(nested.get("ephemeral_1h_input_tokens"));
        if total > 0 {
            return total;
        }
        return legacy.max(0);
    }

    let has_flat = usage.get("claude_cache_creation_5_m_tokens").is_some()
        || usage.get("claude_cache_creation_1_h_tokens").is_some();
    if has_flat {
        let total = as_i64(usage.get("claude_cache_creation_5_m_tokens"))
            + as_i64(usage.get("claude_cache_creation_1_h_tokens"));
        if total > 0 {
            return total;
        }
        return legacy.max(0);
    }

    legacy.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_shape_wins() {
        let usage = json!({
            "cache_creation": {"ephemeral_5m_input_tokens": 30, "ephemeral_1h_input_tokens": 12},
            "cache_creation_input_tokens": 5,
        });
        assert_eq!(extract_cache_creation_tokens(&usage), 42);
    }

    #[test]
    fn zero_nested_falls_back_to_legacy() {
        let usage = json!({
            "cache_creation": {"ephemeral_5m_input_tokens": 0},
            "cache_creation_input_tokens": 7,
        });
        assert_eq!(extract_cache_creation_tokens(&usage), 7);
    }

    #[test]
    fn flat_shape_is_second_priority() {
        let usage = json!({
            "claude_cache_creation_5_m_tokens": 9,
            "claude_cache_creation_1_h_tokens": 1,
        });
        assert_eq!(extract_cache_creation_tokens(&usage), 10);
    }

    #[test]
    fn legacy_shape_still_works() {
        assert_eq!(
            extract_cache_creation_tokens(&json!({"cache_creation_input_tokens": 3})),
            3
        );
        assert_eq!(extract_cache_creation_tokens(&json!({})), 0);
    }
}
