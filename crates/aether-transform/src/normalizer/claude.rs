use serde_json::{Map, Value, json};

use aether_protocol::claude::Usage;

use crate::internal::{
    InternalChatRequest, InternalChatResponse, InternalMessage, InternalStreamEvent,
    InternalUsage, MessageRole,
};
use crate::normalizer::{ParsedError, TransformError, TransformResult};
use crate::usage::extract_cache_creation_tokens;

const CONSUMED_REQUEST_KEYS: &[&str] = &[
    "model",
    "system",
    "messages",
    "max_tokens",
    "temperature",
    "top_p",
    "stop_sequences",
    "stream",
];

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    block.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

pub fn chat_request_to_internal(body: &Value) -> TransformResult<InternalChatRequest> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("model"))?
        .to_string();
    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or(TransformError::MissingField("messages"))?;

    let system = body.get("system").map(content_text).filter(|s| !s.is_empty());

    let messages = raw_messages
        .iter()
        .map(|message| {
            let role = if message.get("role").and_then(Value::as_str) == Some("assistant") {
                MessageRole::Assistant
            } else {
                MessageRole::User
            };
            InternalMessage {
                role,
                text: content_text(message.get("content").unwrap_or(&Value::Null)),
            }
        })
        .collect();

    let stop = body
        .get("stop_sequences")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let extra: Map<String, Value> = body
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !CONSUMED_REQUEST_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ok(InternalChatRequest {
        model,
        system,
        messages,
        max_tokens: body.get("max_tokens").and_then(Value::as_i64),
        temperature: body.get("temperature").and_then(Value::as_f64),
        top_p: body.get("top_p").and_then(Value::as_f64),
        stop,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        extra,
    })
}

pub fn chat_request_from_internal(req: &InternalChatRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            json!({"role": role, "content": message.text})
        })
        .collect();

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(req.model.clone()));
    out.insert("messages".to_string(), Value::Array(messages));
    // max_tokens is mandatory on the Claude surface.
    out.insert("max_tokens".to_string(), json!(req.max_tokens.unwrap_or(4096)));
    if let Some(system) = &req.system {
        out.insert("system".to_string(), Value::String(system.clone()));
    }
    if let Some(temperature) = req.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        out.insert("top_p".to_string(), json!(top_p));
    }
    if !req.stop.is_empty() {
        out.insert("stop_sequences".to_string(), json!(req.stop));
    }
    if req.stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }
    Value::Object(out)
}

pub fn chat_response_to_internal(body: &Value) -> InternalChatResponse {
    InternalChatResponse {
        id: body.get("id").and_then(Value::as_str).map(str::to_string),
        model: body.get("model").and_then(Value::as_str).map(str::to_string),
        text: body.get("content").map(content_text).unwrap_or_default(),
        finish_reason: body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: extract_usage(body).unwrap_or_default(),
    }
}

pub fn chat_response_from_internal(resp: &InternalChatResponse) -> Value {
    json!({
        "id": resp.id.clone().unwrap_or_else(|| "msg_aether".to_string()),
        "type": "message",
        "role": "assistant",
        "model": resp.model,
        "content": [{"type": "text", "text": resp.text}],
        "stop_reason": map_finish_reason(resp.finish_reason.as_deref()),
        "stop_sequence": Value::Null,
        "usage": usage_from_internal(&resp.usage),
    })
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") | Some("max_tokens") => "max_tokens",
        Some("stop_sequence") => "stop_sequence",
        _ => "end_turn",
    }
}

pub fn usage_from_internal(usage: &InternalUsage) -> Value {
    json!({
        "input_tokens": usage.input_tokens,
        "output_tokens": usage.output_tokens,
        "cache_read_input_tokens": usage.cache_read_tokens,
        "cache_creation_input_tokens": usage.cache_creation_tokens,
    })
}

pub fn extract_usage(body: &Value) -> Option<InternalUsage> {
    // message_start wraps the usage inside `message`.
    let raw = body
        .get("usage")
        .or_else(|| body.get("message").and_then(|m| m.get("usage")))?;
    let usage: Usage = serde_json::from_value(raw.clone()).ok()?;
    Some(InternalUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation_tokens: extract_cache_creation_tokens(raw),
    })
}

pub fn extract_text(body: &Value) -> Option<String> {
    // Stream delta first, then full-response content blocks.
    if let Some(delta) = body.get("delta")
        && delta.get("type").and_then(Value::as_str) == Some("text_delta")
    {
        return delta
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    let text = body.get("content").map(content_text)?;
    if text.is_empty() { None } else { Some(text) }
}

pub fn is_error_response(body: &Value) -> bool {
    body.get("type").and_then(Value::as_str) == Some("error")
        || body.get("error").is_some_and(|e| !e.is_null())
}

pub fn parse_error(body: &Value, status: u16) -> ParsedError {
    let error = body.get("error").cloned().unwrap_or_else(|| body.clone());
    ParsedError {
        error_type: error
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string(),
        code: if status >= 400 { Some(status as i64) } else { None },
    }
}

pub fn decode_stream_chunk(event_name: Option<&str>, chunk: &Value) -> Vec<InternalStreamEvent> {
    let event_type = event_name
        .map(str::to_string)
        .or_else(|| chunk.get("type").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let mut out = Vec::new();
    match event_type.as_str() {
        "message_start" => {
            let message = chunk.get("message");
            out.push(InternalStreamEvent::Start {
                id: message
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                model: message
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
            if let Some(usage) = extract_usage(chunk) {
                out.push(InternalStreamEvent::Usage(usage));
            }
        }
        "content_block_delta" => {
            if let Some(text) = extract_text(chunk) {
                out.push(InternalStreamEvent::TextDelta(text));
            }
        }
        "message_delta" => {
            if let Some(usage) = chunk.get("usage") {
                out.push(InternalStreamEvent::Usage(InternalUsage {
                    input_tokens: usage
                        .get("input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    output_tokens: usage
                        .get("output_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    cache_read_tokens: usage
                        .get("cache_read_input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    cache_creation_tokens: extract_cache_creation_tokens(usage),
                }));
            }
            if let Some(reason) = chunk
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
            {
                out.push(InternalStreamEvent::Done {
                    finish_reason: Some(reason.to_string()),
                });
            }
        }
        "message_stop" => {
            out.push(InternalStreamEvent::Done {
                finish_reason: None,
            });
        }
        _ => {}
    }
    out
}
