use serde_json::{Map, Value, json};

use aether_protocol::openai::{CompletionUsage, VideoJob};

use crate::internal::{
    InternalChatRequest, InternalChatResponse, InternalMessage, InternalStreamEvent,
    InternalUsage, InternalVideoPollResult, InternalVideoRequest, MessageRole, VideoStatus,
};
use crate::normalizer::{ParsedError, TransformError, TransformResult};

/// Request keys with a canonical internal representation; everything else is
/// carried through `extra`.
const CONSUMED_REQUEST_KEYS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "stop",
    "stream",
];

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    part.get("text").and_then(Value::as_str)
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

    let mut system: Option<String> = None;
    let mut messages = Vec::with_capacity(raw_messages.len());
    for message in raw_messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = content_text(message.get("content").unwrap_or(&Value::Null));
        match role {
            "system" | "developer" => {
                system = Some(match system.take() {
                    Some(prev) => format!("{prev}\n{text}"),
                    None => text,
                });
            }
            "assistant" => messages.push(InternalMessage {
                role: MessageRole::Assistant,
                text,
            }),
            _ => messages.push(InternalMessage {
                role: MessageRole::User,
                text,
            }),
        }
    }

    let stop = match body.get("stop") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

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
        max_tokens: body
            .get("max_completion_tokens")
            .or_else(|| body.get("max_tokens"))
            .and_then(Value::as_i64),
        temperature: body.get("temperature").and_then(Value::as_f64),
        top_p: body.get("top_p").and_then(Value::as_f64),
        stop,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
        extra,
    })
}

pub fn chat_request_from_internal(req: &InternalChatRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &req.messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        messages.push(json!({"role": role, "content": message.text}));
    }

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(req.model.clone()));
    out.insert("messages".to_string(), Value::Array(messages));
    if let Some(max_tokens) = req.max_tokens {
        out.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        out.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        out.insert("top_p".to_string(), json!(top_p));
    }
    if !req.stop.is_empty() {
        out.insert("stop".to_string(), json!(req.stop));
    }
    if req.stream {
        out.insert("stream".to_string(), Value::Bool(true));
        out.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    Value::Object(out)
}

pub fn chat_response_to_internal(body: &Value) -> InternalChatResponse {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    InternalChatResponse {
        id: body.get("id").and_then(Value::as_str).map(str::to_string),
        model: body.get("model").and_then(Value::as_str).map(str::to_string),
        text: choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .map(content_text)
            .unwrap_or_default(),
        finish_reason: choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        usage: extract_usage(body).unwrap_or_default(),
    }
}

pub fn chat_response_from_internal(resp: &InternalChatResponse) -> Value {
    let usage = usage_from_internal(&resp.usage);
    json!({
        "id": resp.id.clone().unwrap_or_else(|| "chatcmpl-aether".to_string()),
        "object": "chat.completion",
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": resp.text},
            "finish_reason": resp.finish_reason.clone().unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": usage,
    })
}

pub fn usage_from_internal(usage: &InternalUsage) -> Value {
    let mut out = json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.input_tokens + usage.output_tokens,
    });
    if usage.cache_read_tokens > 0 {
        out["prompt_tokens_details"] = json!({"cached_tokens": usage.cache_read_tokens});
    }
    out
}

pub fn extract_usage(body: &Value) -> Option<InternalUsage> {
    let raw = body.get("usage")?;
    let usage: CompletionUsage = serde_json::from_value(raw.clone()).ok()?;
    Some(InternalUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_creation_tokens: 0,
    })
}

pub fn extract_text(body: &Value) -> Option<String> {
    let choice = body.get("choices")?.as_array()?.first()?;
    // Stream chunks carry `delta`, full responses `message`.
    let content = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .or_else(|| choice.get("message").and_then(|m| m.get("content")))?;
    let text = content_text(content);
    if text.is_empty() { None } else { Some(text) }
}

pub fn is_error_response(body: &Value) -> bool {
    body.get("error").is_some_and(|e| !e.is_null())
}

pub fn parse_error(body: &Value, status: u16) -> ParsedError {
    let error = body.get("error").cloned().unwrap_or_else(|| body.clone());
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .or(if status >= 400 { Some(status as i64) } else { None });
    ParsedError {
        error_type: error
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| code.map(|c| c.to_string())),
        message,
        code,
    }
}

pub fn decode_stream_chunk(chunk: &Value) -> Vec<InternalStreamEvent> {
    let mut out = Vec::new();
    if let Some(choice) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        if choice
            .get("delta")
            .and_then(|d| d.get("role"))
            .and_then(Value::as_str)
            .is_some()
        {
            out.push(InternalStreamEvent::Start {
                id: chunk.get("id").and_then(Value::as_str).map(str::to_string),
                model: chunk.get("model").and_then(Value::as_str).map(str::to_string),
            });
        }
        if let Some(text) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .map(content_text)
            .filter(|t| !t.is_empty())
        {
            out.push(InternalStreamEvent::TextDelta(text));
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            out.push(InternalStreamEvent::Done {
                finish_reason: Some(reason.to_string()),
            });
        }
    }
    if let Some(usage) = extract_usage(chunk) {
        out.push(InternalStreamEvent::Usage(usage));
    }
    out
}

// ---- Video (Sora-style) ----

pub fn video_request_to_internal(body: &Value) -> TransformResult<InternalVideoRequest> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("model"))?
        .to_string();
    let prompt = body
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingField("prompt"))?
        .to_string();
    let duration_seconds = match body.get("seconds").or_else(|| body.get("duration")) {
        Some(Value::String(s)) => s.parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    Ok(InternalVideoRequest {
        model,
        prompt,
        duration_seconds,
        resolution: body.get("size").and_then(Value::as_str).map(str::to_string),
        aspect_ratio: None,
        extra: Map::new(),
    })
}

pub fn video_request_from_internal(req: &InternalVideoRequest) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(req.model.clone()));
    out.insert("prompt".to_string(), Value::String(req.prompt.clone()));
    if let Some(seconds) = req.duration_seconds {
        // The Sora surface takes seconds as a string.
        let rendered = if seconds.fract() == 0.0 {
            format!("{}", seconds as i64)
        } else {
            format!("{seconds}")
        };
        out.insert("seconds".to_string(), Value::String(rendered));
    }
    if let Some(size) = &req.resolution {
        out.insert("size".to_string(), Value::String(size.clone()));
    }
    Value::Object(out)
}

fn video_status(raw: &str) -> VideoStatus {
    match raw {
        "queued" => VideoStatus::Queued,
        "in_progress" | "processing" => VideoStatus::Processing,
        "completed" | "succeeded" => VideoStatus::Completed,
        "failed" | "error" => VideoStatus::Failed,
        "cancelled" | "canceled" => VideoStatus::Cancelled,
        _ => VideoStatus::Processing,
    }
}

pub fn video_poll_to_internal(body: &Value) -> InternalVideoPollResult {
    let job: VideoJob = match serde_json::from_value(body.clone()) {
        Ok(job) => job,
        Err(_) => {
            return InternalVideoPollResult {
                status: VideoStatus::Failed,
                error_code: Some("invalid_poll_response".to_string()),
                error_message: Some("unparseable upstream poll payload".to_string()),
                raw_response: Some(body.clone()),
                ..Default::default()
            };
        }
    };

    let status = video_status(&job.status);
    InternalVideoPollResult {
        status,
        progress_percent: job.progress.unwrap_or(if status == VideoStatus::Completed {
            100
        } else {
            0
        }),
        video_url: None,
        video_urls: Vec::new(),
        expires_at: job
            .expires_at
            .and_then(|ts| time::OffsetDateTime::from_unix_timestamp(ts).ok()),
        video_duration_seconds: job.seconds.as_deref().and_then(|s| s.parse::<f64>().ok()),
        error_code: job
            .error
            .as_ref()
            .and_then(|e| e.error_type.clone())
            .filter(|_| status == VideoStatus::Failed),
        error_message: job
            .error
            .map(|e| e.message)
            .filter(|_| status == VideoStatus::Failed),
        raw_response: Some(body.clone()),
    }
}
