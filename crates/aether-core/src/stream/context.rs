use serde_json::{Map, Value, json};

use aether_protocol::Headers;
use aether_transform::InternalUsage;

/// Mutable state for one streaming attempt.
///
/// Created at dispatch start, filled in by the scheduler and stream
/// processor, read by usage finalization, then dropped.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub model: String,
    pub api_format: String,

    // Filled in when a candidate is selected.
    pub provider_name: Option<String>,
    pub provider_id: Option<i64>,
    pub endpoint_id: Option<i64>,
    pub key_id: Option<i64>,
    pub attempt_id: Option<String>,
    pub provider_api_format: Option<String>,
    pub mapped_model: Option<String>,

    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,

    pub collected_text: String,

    pub status_code: u16,
    pub error_message: Option<String>,
    pub has_completion: bool,

    pub response_headers: Headers,
    pub provider_request_headers: Headers,
    pub provider_request_body: Option<Value>,

    pub data_count: u64,
    pub chunk_count: u64,
    pub parsed_chunks: Vec<Value>,
}

impl StreamContext {
    pub fn new(model: impl Into<String>, api_format: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_format: api_format.into(),
            status_code: 200,
            ..Default::default()
        }
    }

    /// Failover reset: keep only `model` and `api_format`, everything else
    /// returns to its initial value before the next attempt.
    pub fn reset_for_retry(&mut self) {
        let model = std::mem::take(&mut self.model);
        let api_format = std::mem::take(&mut self.api_format);
        *self = StreamContext::new(model, api_format);
    }

    pub fn update_provider_info(
        &mut self,
        provider_name: &str,
        provider_id: i64,
        endpoint_id: i64,
        key_id: i64,
        provider_api_format: Option<String>,
    ) {
        self.provider_name = Some(provider_name.to_string());
        self.provider_id = Some(provider_id);
        self.endpoint_id = Some(endpoint_id);
        self.key_id = Some(key_id);
        self.provider_api_format = provider_api_format;
    }

    /// Overlay usage counters; zero fields leave the current value alone
    /// (families report usage across several partial events).
    pub fn update_usage(&mut self, usage: InternalUsage) {
        if usage.input_tokens > 0 {
            self.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_tokens > 0 {
            self.cached_tokens = usage.cache_read_tokens;
        }
        if usage.cache_creation_tokens > 0 {
            self.cache_creation_tokens = usage.cache_creation_tokens;
        }
    }

    pub fn mark_failed(&mut self, status_code: u16, error_message: impl Into<String>) {
        self.status_code = status_code;
        self.error_message = Some(error_message.into());
    }

    pub fn is_success(&self) -> bool {
        self.status_code < 400
    }

    /// Metadata stored in the usage row's response body field.
    pub fn build_response_body(&self, response_time_ms: i64) -> Value {
        json!({
            "chunks": self.parsed_chunks,
            "metadata": {
                "stream": true,
                "total_chunks": self.parsed_chunks.len(),
                "data_count": self.data_count,
                "has_completion": self.has_completion,
                "response_time_ms": response_time_ms,
            },
        })
    }

    pub fn log_summary(&self, request_id: &str, response_time_ms: i64) -> String {
        let status = if self.is_success() { "OK" } else { "FAIL" };
        let request_short = &request_id[..request_id.len().min(8)];
        format!(
            "[{status}] {request_short} | {} | {} | {response_time_ms}ms | in:{} out:{}",
            self.model,
            self.provider_name.as_deref().unwrap_or("unknown"),
            self.input_tokens,
            self.output_tokens,
        )
    }

    pub fn usage(&self) -> InternalUsage {
        InternalUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_read_tokens: self.cached_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
        }
    }

    pub fn push_parsed_chunk(&mut self, chunk: Map<String, Value>) {
        self.parsed_chunks.push(Value::Object(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_preserves_only_model_and_format() {
        let mut ctx = StreamContext::new("gpt-4o", "openai:chat");
        ctx.update_provider_info("p1", 1, 2, 3, Some("openai:chat".to_string()));
        ctx.update_usage(InternalUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_creation_tokens: 1,
        });
        ctx.collected_text.push_str("hello");
        ctx.mark_failed(502, "bad gateway");
        ctx.chunk_count = 7;
        ctx.data_count = 4;
        ctx.has_completion = true;
        ctx.parsed_chunks.push(json!({"a": 1}));

        ctx.reset_for_retry();

        assert_eq!(ctx.model, "gpt-4o");
        assert_eq!(ctx.api_format, "openai:chat");
        assert_eq!(ctx.status_code, 200);
        assert_eq!(ctx.error_message, None);
        assert_eq!(ctx.input_tokens, 0);
        assert_eq!(ctx.output_tokens, 0);
        assert_eq!(ctx.cached_tokens, 0);
        assert_eq!(ctx.cache_creation_tokens, 0);
        assert!(ctx.collected_text.is_empty());
        assert!(ctx.parsed_chunks.is_empty());
        assert_eq!(ctx.chunk_count, 0);
        assert_eq!(ctx.data_count, 0);
        assert!(!ctx.has_completion);
        assert_eq!(ctx.provider_name, None);
        assert_eq!(ctx.endpoint_id, None);
    }

    #[test]
    fn usage_overlay_keeps_earlier_nonzero_fields() {
        let mut ctx = StreamContext::new("m", "claude:chat");
        ctx.update_usage(InternalUsage {
            input_tokens: 100,
            ..Default::default()
        });
        ctx.update_usage(InternalUsage {
            output_tokens: 9,
            ..Default::default()
        });
        assert_eq!(ctx.input_tokens, 100);
        assert_eq!(ctx.output_tokens, 9);
    }
}
