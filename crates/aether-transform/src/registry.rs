use serde_json::Value;

use aether_protocol::{ApiFamily, EndpointKind, EndpointSignature, can_passthrough_endpoint};

use crate::internal::{InternalStreamEvent, InternalUsage};
use crate::normalizer::{Normalizer, TransformError, TransformResult};

/// Conversion capabilities between endpoint signatures.
///
/// Normalizers are selected per family; the registry answers capability
/// queries and drives body/stream translation between two signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversionRegistry;

impl ConversionRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn normalizer_for(&self, sig: EndpointSignature) -> Normalizer {
        Normalizer::for_family(sig.api_family)
    }

    /// Whether a full request+response conversion (and, when asked, a stream
    /// conversion) exists from `client` to `provider`.
    pub fn can_convert_full(
        &self,
        client: EndpointSignature,
        provider: EndpointSignature,
        require_stream: bool,
    ) -> bool {
        if client == provider || can_passthrough_endpoint(client, provider) {
            return true;
        }
        let client_base = client.base();
        let provider_base = provider.base();
        match (client_base.endpoint_kind, provider_base.endpoint_kind) {
            // Chat payloads convert freely across the three families.
            (EndpointKind::Chat, EndpointKind::Chat) => true,
            // Video submit bodies convert between the two async-video families,
            // but there is no stream variant.
            (EndpointKind::Video, EndpointKind::Video) => {
                !require_stream
                    && client_base.api_family != ApiFamily::Claude
                    && provider_base.api_family != ApiFamily::Claude
            }
            _ => false,
        }
    }

    pub fn convert_chat_request(
        &self,
        body: &Value,
        client: EndpointSignature,
        provider: EndpointSignature,
    ) -> TransformResult<Value> {
        if client.api_family == provider.api_family {
            return Ok(body.clone());
        }
        let internal = self.normalizer_for(client).chat_request_to_internal(body)?;
        Ok(self.normalizer_for(provider).chat_request_from_internal(&internal))
    }

    pub fn convert_chat_response(
        &self,
        body: &Value,
        provider: EndpointSignature,
        client: EndpointSignature,
    ) -> Value {
        if client.api_family == provider.api_family {
            return body.clone();
        }
        let internal = self.normalizer_for(provider).chat_response_to_internal(body);
        self.normalizer_for(client).chat_response_from_internal(&internal)
    }

    pub fn convert_video_request(
        &self,
        body: &Value,
        client: EndpointSignature,
        provider: EndpointSignature,
    ) -> TransformResult<Value> {
        if client.api_family == provider.api_family {
            return Ok(body.clone());
        }
        if !self.can_convert_full(client, provider, false) {
            return Err(TransformError::UnsupportedPair {
                src: client.key(),
                dst: provider.key(),
            });
        }
        let internal = self.normalizer_for(client).video_request_to_internal(body)?;
        self.normalizer_for(provider).video_request_from_internal(&internal)
    }

    pub fn stream_converter(
        &self,
        provider: EndpointSignature,
        client: EndpointSignature,
    ) -> StreamConverter {
        StreamConverter::new(self.normalizer_for(provider), self.normalizer_for(client))
    }
}

/// Piecewise SSE translator from one family's stream to another's.
///
/// Terminal frames (finish reason, usage, `[DONE]`/`message_stop`) are held
/// until `finish()` so late usage chunks still land in the closing sequence.
#[derive(Debug)]
pub struct StreamConverter {
    src: Normalizer,
    dst: Normalizer,
    started: bool,
    finished: bool,
    id: Option<String>,
    model: Option<String>,
    usage: InternalUsage,
    finish_reason: Option<String>,
}

impl StreamConverter {
    fn new(src: Normalizer, dst: Normalizer) -> Self {
        Self {
            src,
            dst,
            started: false,
            finished: false,
            id: None,
            model: None,
            usage: InternalUsage::default(),
            finish_reason: None,
        }
    }

    /// Translate one upstream SSE event into zero or more downstream frames.
    pub fn convert_event(&mut self, event_name: Option<&str>, data_str: &str) -> Vec<String> {
        if data_str.is_empty() || data_str == "[DONE]" {
            return Vec::new();
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data_str) else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        for event in self.src.decode_stream_chunk(event_name, &chunk) {
            match event {
                InternalStreamEvent::Start { id, model } => {
                    self.id = id;
                    self.model = model;
                    if !self.started {
                        self.started = true;
                        frames.extend(self.start_frames());
                    }
                }
                InternalStreamEvent::TextDelta(text) => {
                    if !self.started {
                        self.started = true;
                        frames.extend(self.start_frames());
                    }
                    frames.extend(self.delta_frames(&text));
                }
                InternalStreamEvent::Usage(usage) => {
                    merge_usage(&mut self.usage, usage);
                }
                InternalStreamEvent::Done { finish_reason } => {
                    if finish_reason.is_some() {
                        self.finish_reason = finish_reason;
                    }
                    self.finished = true;
                }
            }
        }
        frames
    }

    /// Emit the destination family's closing sequence.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.started && !self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.end_frames()
    }

    pub fn usage(&self) -> InternalUsage {
        self.usage
    }

    fn chunk_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| "aether-stream".to_string())
    }

    fn start_frames(&self) -> Vec<String> {
        match self.dst {
            Normalizer::OpenAI => {
                let chunk = serde_json::json!({
                    "id": self.chunk_id(),
                    "object": "chat.completion.chunk",
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {"role": "assistant", "content": ""},
                        "finish_reason": Value::Null,
                    }],
                });
                vec![data_frame(&chunk)]
            }
            Normalizer::Claude => {
                let start = serde_json::json!({
                    "type": "message_start",
                    "message": {
                        "id": self.chunk_id(),
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "usage": {"input_tokens": self.usage.input_tokens, "output_tokens": 0},
                    },
                });
                let block = serde_json::json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""},
                });
                vec![
                    event_frame("message_start", &start),
                    event_frame("content_block_start", &block),
                ]
            }
            Normalizer::Gemini => Vec::new(),
        }
    }

    fn delta_frames(&self, text: &str) -> Vec<String> {
        match self.dst {
            Normalizer::OpenAI => {
                let chunk = serde_json::json!({
                    "id": self.chunk_id(),
                    "object": "chat.completion.chunk",
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {"content": text},
                        "finish_reason": Value::Null,
                    }],
                });
                vec![data_frame(&chunk)]
            }
            Normalizer::Claude => {
                let delta = serde_json::json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": text},
                });
                vec![event_frame("content_block_delta", &delta)]
            }
            Normalizer::Gemini => {
                let chunk = serde_json::json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": text}]},
                        "index": 0,
                    }],
                });
                vec![data_frame(&chunk)]
            }
        }
    }

    fn end_frames(&self) -> Vec<String> {
        match self.dst {
            Normalizer::OpenAI => {
                let finish = serde_json::json!({
                    "id": self.chunk_id(),
                    "object": "chat.completion.chunk",
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": map_openai_finish(self.finish_reason.as_deref()),
                    }],
                });
                let mut frames = vec![data_frame(&finish)];
                if !self.usage.is_empty() {
                    let usage_chunk = serde_json::json!({
                        "id": self.chunk_id(),
                        "object": "chat.completion.chunk",
                        "model": self.model,
                        "choices": [],
                        "usage": crate::normalizer::openai::usage_from_internal(&self.usage),
                    });
                    frames.push(data_frame(&usage_chunk));
                }
                frames.push("data: [DONE]\n\n".to_string());
                frames
            }
            Normalizer::Claude => {
                let block_stop = serde_json::json!({"type": "content_block_stop", "index": 0});
                let message_delta = serde_json::json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": map_claude_finish(self.finish_reason.as_deref()),
                        "stop_sequence": Value::Null,
                    },
                    "usage": crate::normalizer::claude::usage_from_internal(&self.usage),
                });
                let message_stop = serde_json::json!({"type": "message_stop"});
                vec![
                    event_frame("content_block_stop", &block_stop),
                    event_frame("message_delta", &message_delta),
                    event_frame("message_stop", &message_stop),
                ]
            }
            Normalizer::Gemini => {
                let chunk = serde_json::json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": ""}]},
                        "finishReason": map_gemini_finish(self.finish_reason.as_deref()),
                        "index": 0,
                    }],
                    "usageMetadata": crate::normalizer::gemini::usage_from_internal(&self.usage),
                });
                vec![data_frame(&chunk)]
            }
        }
    }
}

fn merge_usage(into: &mut InternalUsage, from: InternalUsage) {
    if from.input_tokens > 0 {
        into.input_tokens = from.input_tokens;
    }
    if from.output_tokens > 0 {
        into.output_tokens = from.output_tokens;
    }
    if from.cache_read_tokens > 0 {
        into.cache_read_tokens = from.cache_read_tokens;
    }
    if from.cache_creation_tokens > 0 {
        into.cache_creation_tokens = from.cache_creation_tokens;
    }
}

fn map_openai_finish(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") | Some("length") | Some("MAX_TOKENS") => "length",
        _ => "stop",
    }
}

fn map_claude_finish(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

fn map_gemini_finish(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => "MAX_TOKENS",
        _ => "STOP",
    }
}

fn data_frame(value: &Value) -> String {
    format!("data: {value}\n\n")
}

fn event_frame(event: &str, value: &Value) -> String {
    format!("event: {event}\ndata: {value}\n\n")
}
